use thiserror::Error;

use crate::domain::traffic::CounterSample;
use crate::domain::{Protocol, RuleId, Transport};
use crate::infra::process::{run_checked, run_status, CommandError};

const MAX_JUMP_DELETES: usize = 16;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter chain {chain}: {source}")]
    Command {
        chain: String,
        #[source]
        source: CommandError,
    },
    #[error("unreadable counters in chain {0}")]
    Parse(String),
}

/// Per-(rule, port) byte counters kept by the host firewall.
pub trait TrafficCounters: Send + Sync {
    fn setup(&self, rule_id: RuleId, port: u16, protocol: Protocol) -> Result<(), CounterError>;
    fn read(&self, rule_id: RuleId, port: u16, protocol: Protocol)
        -> Result<CounterSample, CounterError>;
    fn teardown(&self, rule_id: RuleId, port: u16, protocol: Protocol);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    const fn parent_chain(self) -> &'static str {
        match self {
            Self::Inbound => "INPUT",
            Self::Outbound => "OUTPUT",
        }
    }

    const fn port_match(self) -> &'static str {
        match self {
            Self::Inbound => "--dport",
            Self::Outbound => "--sport",
        }
    }

    const fn tag(self) -> &'static str {
        match self {
            Self::Inbound => "IN",
            Self::Outbound => "OUT",
        }
    }
}

pub fn chain_name(rule_id: RuleId, port: u16, inbound: bool) -> String {
    let direction = if inbound {
        Direction::Inbound
    } else {
        Direction::Outbound
    };
    format!("RK_{}_{}_{}", direction.tag(), rule_id, port)
}

/// Counting chains managed through the `iptables` command.
#[derive(Clone, Debug)]
pub struct IptablesCounters {
    binary: String,
}

impl Default for IptablesCounters {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesCounters {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn ensure_chain(&self, chain: &str) -> Result<(), CounterError> {
        let bin = self.binary.as_str();
        if !run_status(&[bin, "-w", "-L", chain, "-n"]) {
            run_checked(&[bin, "-w", "-N", chain]).map_err(|source| command_error(chain, source))?;
        }
        if !run_status(&[bin, "-w", "-C", chain, "-j", "RETURN"]) {
            run_checked(&[bin, "-w", "-A", chain, "-j", "RETURN"])
                .map_err(|source| command_error(chain, source))?;
        }
        Ok(())
    }

    fn jump_args<'a>(
        &'a self,
        action: &'a str,
        direction: Direction,
        transport: Transport,
        port: &'a str,
        chain: &'a str,
    ) -> [&'a str; 10] {
        [
            self.binary.as_str(),
            "-w",
            action,
            direction.parent_chain(),
            "-p",
            transport.as_str(),
            direction.port_match(),
            port,
            "-j",
            chain,
        ]
    }

    fn ensure_jump(
        &self,
        direction: Direction,
        transport: Transport,
        port: u16,
        chain: &str,
    ) -> Result<(), CounterError> {
        let port = port.to_string();
        if run_status(&self.jump_args("-C", direction, transport, &port, chain)) {
            return Ok(());
        }
        run_checked(&self.jump_args("-I", direction, transport, &port, chain))
            .map(|_| ())
            .map_err(|source| command_error(chain, source))
    }

    fn remove_jumps(&self, direction: Direction, transport: Transport, port: u16, chain: &str) {
        let port = port.to_string();
        for _ in 0..MAX_JUMP_DELETES {
            if !run_status(&self.jump_args("-D", direction, transport, &port, chain)) {
                break;
            }
        }
    }

    fn read_chain(&self, chain: &str) -> Result<(u64, u64), CounterError> {
        let output = run_checked(&[self.binary.as_str(), "-w", "-L", chain, "-v", "-n", "-x"])
            .map_err(|source| command_error(chain, source))?;
        parse_chain_counters(&output).ok_or_else(|| CounterError::Parse(chain.to_string()))
    }
}

impl TrafficCounters for IptablesCounters {
    fn setup(&self, rule_id: RuleId, port: u16, protocol: Protocol) -> Result<(), CounterError> {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let chain = chain_name(rule_id, port, direction == Direction::Inbound);
            self.ensure_chain(&chain)?;
            for transport in protocol.transports() {
                self.ensure_jump(direction, *transport, port, &chain)?;
            }
        }
        Ok(())
    }

    fn read(
        &self,
        rule_id: RuleId,
        port: u16,
        _protocol: Protocol,
    ) -> Result<CounterSample, CounterError> {
        let (in_packets, in_bytes) = self.read_chain(&chain_name(rule_id, port, true))?;
        let (out_packets, out_bytes) = self.read_chain(&chain_name(rule_id, port, false))?;
        Ok(CounterSample {
            in_bytes,
            out_bytes,
            in_packets,
            out_packets,
        })
    }

    fn teardown(&self, rule_id: RuleId, port: u16, _protocol: Protocol) {
        let bin = self.binary.as_str();
        for direction in [Direction::Inbound, Direction::Outbound] {
            let chain = chain_name(rule_id, port, direction == Direction::Inbound);
            // Jumps from both transports are removed so a protocol change cannot strand one.
            for transport in Protocol::Both.transports() {
                self.remove_jumps(direction, *transport, port, &chain);
            }
            let _ = run_status(&[bin, "-w", "-F", &chain]);
            let _ = run_status(&[bin, "-w", "-X", &chain]);
        }
    }
}

fn command_error(chain: &str, source: CommandError) -> CounterError {
    CounterError::Command {
        chain: chain.to_string(),
        source,
    }
}

/// Sums the packet and byte columns of `iptables -L <chain> -v -n -x`.
pub fn parse_chain_counters(output: &str) -> Option<(u64, u64)> {
    let mut saw_header = false;
    let mut packets = 0u64;
    let mut bytes = 0u64;
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Chain ") {
            continue;
        }
        let mut fields = line.split_whitespace();
        let first = fields.next()?;
        if first == "pkts" {
            saw_header = true;
            continue;
        }
        let pkts: u64 = first.parse().ok()?;
        let byte_count: u64 = fields.next()?.parse().ok()?;
        packets = packets.saturating_add(pkts);
        bytes = bytes.saturating_add(byte_count);
    }
    saw_header.then_some((packets, bytes))
}
