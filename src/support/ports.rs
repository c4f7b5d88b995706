use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener, UdpSocket};

use thiserror::Error;

use crate::domain::{Protocol, Transport};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortSpecError {
    #[error("port spec is empty")]
    Empty,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid range {0:?}")]
    InvalidRange(String),
}

/// Expands `"10000-10010,10020"` into ordered, unique ports.
pub(crate) fn parse_port_spec(spec: &str) -> Result<Vec<u16>, PortSpecError> {
    let mut ports = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start.trim())?;
                let end = parse_port(end.trim())?;
                if start > end {
                    return Err(PortSpecError::InvalidRange(part.to_string()));
                }
                ports.extend(start..=end);
            }
            None => {
                ports.insert(parse_port(part)?);
            }
        }
    }
    if ports.is_empty() {
        return Err(PortSpecError::Empty);
    }
    Ok(ports.into_iter().collect())
}

fn parse_port(value: &str) -> Result<u16, PortSpecError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(PortSpecError::InvalidPort(value.to_string())),
    }
}

/// True when every transport of `protocol` can bind `port` on all interfaces.
pub(crate) fn port_available(port: u16, protocol: Protocol) -> bool {
    protocol.transports().iter().all(|transport| match transport {
        Transport::Tcp => TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok(),
        Transport::Udp => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok(),
    })
}

pub(crate) fn first_available(
    spec: &str,
    protocol: Protocol,
) -> Result<Option<u16>, PortSpecError> {
    let ports = parse_port_spec(spec)?;
    Ok(ports.into_iter().find(|port| port_available(*port, protocol)))
}
