use super::counter::{chain_name, parse_chain_counters};
use super::firewall::{ufw_lists_rule, ufw_reports_active};
use super::sockets::count_connections;
use crate::domain::Transport;

const CHAIN_LISTING: &str = "\
Chain RK_IN_7_30000 (2 references)
    pkts      bytes target     prot opt in     out     source               destination
    1520   918734 RETURN     all  --  *      *       0.0.0.0/0            0.0.0.0/0
";

#[test]
fn chain_names_fit_iptables_limits() {
    assert_eq!(chain_name(7, 30000, true), "RK_IN_7_30000");
    assert_eq!(chain_name(7, 30000, false), "RK_OUT_7_30000");
    assert!(chain_name(u64::from(u32::MAX), 65535, false).len() <= 28);
}

#[test]
fn reads_packet_and_byte_columns() {
    assert_eq!(parse_chain_counters(CHAIN_LISTING), Some((1520, 918_734)));
}

#[test]
fn empty_chain_reads_as_zero() {
    let listing = "Chain RK_OUT_7_30000 (1 references)\n    pkts      bytes target     prot opt in     out     source               destination\n";
    assert_eq!(parse_chain_counters(listing), Some((0, 0)));
}

#[test]
fn garbage_listing_is_rejected() {
    assert_eq!(parse_chain_counters("iptables: No chain/target/match by that name."), None);
    assert_eq!(parse_chain_counters(""), None);
}

#[test]
fn counts_established_tcp_on_port() {
    let listing = "\
LISTEN 0      4096         0.0.0.0:30000      0.0.0.0:*
ESTAB  0      0          10.0.0.2:30000   203.0.113.9:51522
ESTAB  0      0          10.0.0.2:30000   203.0.113.7:40100
ESTAB  0      0          10.0.0.2:22      203.0.113.7:40101
TIME-WAIT 0   0          10.0.0.2:30000   203.0.113.5:40000
ESTAB  0      0          10.0.0.2:51000   10.0.0.9:30000
";
    assert_eq!(count_connections(listing, 30000, Transport::Tcp), 2);
}

#[test]
fn counts_udp_rows_with_a_peer() {
    let listing = "\
UNCONN 0      0            0.0.0.0:30000      0.0.0.0:*
ESTAB  0      0          10.0.0.2:30000   203.0.113.9:5353
UNCONN 0      0               [::]:30000         [::]:*
";
    assert_eq!(count_connections(listing, 30000, Transport::Udp), 1);
}

#[test]
fn ufw_status_parsing() {
    let status = "Status: active\n\nTo                         Action      From\n--                         ------      ----\n30000/tcp                  ALLOW       Anywhere\n";
    assert!(ufw_reports_active(status));
    assert!(ufw_lists_rule(status, "30000/tcp"));
    assert!(!ufw_lists_rule(status, "30000/udp"));
    assert!(!ufw_reports_active("Status: inactive\n"));
}
