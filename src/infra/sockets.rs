use crate::domain::{Protocol, Transport};
use crate::infra::process::run_checked;

/// Counts live client connections on a local port.
pub trait ConnectionCounter: Send + Sync {
    fn active_connections(&self, port: u16, protocol: Protocol) -> u64;
}

/// Reads socket tables through `ss`.
#[derive(Clone, Debug)]
pub struct SsCounter {
    binary: String,
}

impl Default for SsCounter {
    fn default() -> Self {
        Self {
            binary: "ss".to_string(),
        }
    }
}

impl SsCounter {
    fn listing(&self, transport: Transport) -> Option<String> {
        let flags = match transport {
            Transport::Tcp => "-Htan",
            Transport::Udp => "-Huan",
        };
        match run_checked(&[self.binary.as_str(), flags]) {
            Ok(output) => Some(output),
            Err(err) => {
                tracing::debug!(error = %err, "socket listing failed");
                None
            }
        }
    }
}

impl ConnectionCounter for SsCounter {
    fn active_connections(&self, port: u16, protocol: Protocol) -> u64 {
        protocol
            .transports()
            .iter()
            .filter_map(|transport| {
                self.listing(*transport)
                    .map(|output| count_connections(&output, port, *transport))
            })
            .sum()
    }
}

/// Counts rows of `ss -H{t,u}an` output that belong to `port`.
///
/// TCP rows must be `ESTAB`; UDP rows must have a concrete peer.
pub fn count_connections(output: &str, port: u16, transport: Transport) -> u64 {
    let suffix = format!(":{port}");
    let mut count = 0;
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // State Recv-Q Send-Q Local Peer [Process]
        if fields.len() < 5 {
            continue;
        }
        let (state, local, peer) = (fields[0], fields[3], fields[4]);
        if !local.ends_with(&suffix) {
            continue;
        }
        let matched = match transport {
            Transport::Tcp => state == "ESTAB",
            Transport::Udp => !is_wildcard_peer(peer),
        };
        if matched {
            count += 1;
        }
    }
    count
}

fn is_wildcard_peer(peer: &str) -> bool {
    peer.ends_with(":*")
}
