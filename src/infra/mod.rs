pub mod connection;
pub mod counter;
pub mod firewall;
pub mod probe;
pub mod process;
pub mod sockets;

#[cfg(test)]
mod parse_tests;
