use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use crate::domain::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub latency_ms: u64,
}

impl ProbeResult {
    pub const fn unreachable(latency_ms: u64) -> Self {
        Self {
            reachable: false,
            latency_ms,
        }
    }
}

/// Reachability check shared by the stats loop, link monitor and tasks.
pub trait Prober: Send + Sync {
    fn probe(&self, address: &str, transport: Transport, timeout: Duration) -> ProbeResult;
}

/// Dials the target: a TCP connect, or a UDP connect plus a one-byte write.
#[derive(Clone, Copy, Debug, Default)]
pub struct DialProber;

impl Prober for DialProber {
    fn probe(&self, address: &str, transport: Transport, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let outcome = resolve(address).and_then(|addr| match transport {
            Transport::Tcp => dial_tcp(addr, timeout),
            Transport::Udp => dial_udp(addr, timeout),
        });
        let latency_ms = elapsed_ms(started);
        match outcome {
            Ok(()) => ProbeResult {
                reachable: true,
                latency_ms,
            },
            Err(err) => {
                tracing::debug!(address, transport = transport.as_str(), error = %err, "probe failed");
                ProbeResult::unreachable(latency_ms)
            }
        }
    }
}

pub fn local_address(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {address}"),
        )
    })
}

fn dial_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<()> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    let _ = stream.shutdown(std::net::Shutdown::Both);
    Ok(())
}

fn dial_udp(addr: SocketAddr, timeout: Duration) -> io::Result<()> {
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)?;
    socket.set_write_timeout(Some(timeout))?;
    socket.connect(addr)?;
    socket.send(&[0u8])?;
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let result = DialProber.probe(
            &local_address(port),
            Transport::Tcp,
            Duration::from_secs(2),
        );
        assert!(result.reachable);
    }

    #[test]
    fn tcp_probe_fails_on_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let result = DialProber.probe(
            &local_address(port),
            Transport::Tcp,
            Duration::from_millis(500),
        );
        assert!(!result.reachable);
    }

    #[test]
    fn unresolvable_address_is_unreachable() {
        let result = DialProber.probe("not an address", Transport::Udp, Duration::from_millis(100));
        assert!(!result.reachable);
    }
}
