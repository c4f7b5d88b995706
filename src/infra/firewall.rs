use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Protocol, Transport};
use crate::infra::process::{command_exists, run_checked, run_output, run_status, CommandError};

const MAX_RULE_DELETES: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallPreference {
    #[default]
    Auto,
    Ufw,
    Firewalld,
    Iptables,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Ufw,
    Firewalld,
    Iptables,
    None,
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{0:?} firewall cannot be toggled")]
    Unsupported(FirewallBackend),
}

/// Opens and closes relay ports on the host firewall.
pub trait PortFirewall: Send + Sync {
    fn open_port(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError>;
    fn close_port(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError>;
}

impl FirewallBackend {
    pub fn detect(preference: FirewallPreference) -> Self {
        match preference {
            FirewallPreference::Ufw => Self::Ufw,
            FirewallPreference::Firewalld => Self::Firewalld,
            FirewallPreference::Iptables => Self::Iptables,
            FirewallPreference::None => Self::None,
            FirewallPreference::Auto => {
                if command_exists("ufw") && ufw_active() {
                    Self::Ufw
                } else if command_exists("firewall-cmd") && run_status(&["firewall-cmd", "--state"])
                {
                    Self::Firewalld
                } else if command_exists("iptables") {
                    Self::Iptables
                } else {
                    Self::None
                }
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ufw => "ufw",
            Self::Firewalld => "firewalld",
            Self::Iptables => "iptables",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HostFirewall {
    backend: FirewallBackend,
}

impl HostFirewall {
    pub const fn new(backend: FirewallBackend) -> Self {
        Self { backend }
    }

    pub fn detect(preference: FirewallPreference) -> Self {
        Self::new(FirewallBackend::detect(preference))
    }

    pub const fn backend(&self) -> FirewallBackend {
        self.backend
    }

    pub fn is_enabled(&self) -> bool {
        match self.backend {
            FirewallBackend::Ufw => ufw_active(),
            FirewallBackend::Firewalld => run_status(&["firewall-cmd", "--state"]),
            FirewallBackend::Iptables => true,
            FirewallBackend::None => false,
        }
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), FirewallError> {
        match self.backend {
            FirewallBackend::Ufw => {
                let cmd: &[&str] = if enabled {
                    &["ufw", "--force", "enable"]
                } else {
                    &["ufw", "disable"]
                };
                run_checked(cmd)?;
                Ok(())
            }
            FirewallBackend::Firewalld => {
                let action = if enabled { "start" } else { "stop" };
                run_checked(&["systemctl", action, "firewalld"])?;
                Ok(())
            }
            backend @ (FirewallBackend::Iptables | FirewallBackend::None) => {
                Err(FirewallError::Unsupported(backend))
            }
        }
    }

    fn open_one(&self, port: u16, transport: Transport) -> Result<(), FirewallError> {
        let spec = format!("{port}/{}", transport.as_str());
        match self.backend {
            FirewallBackend::Ufw => {
                if !ufw_has_rule(&spec) {
                    run_checked(&["ufw", "allow", &spec])?;
                }
            }
            FirewallBackend::Firewalld => {
                let query = format!("--query-port={spec}");
                if !run_status(&["firewall-cmd", &query]) {
                    let add = format!("--add-port={spec}");
                    run_checked(&["firewall-cmd", &add])?;
                    run_checked(&["firewall-cmd", "--permanent", &add])?;
                }
            }
            FirewallBackend::Iptables => {
                let port = port.to_string();
                let check = iptables_accept("-C", transport, &port);
                if !run_status(&check) {
                    run_checked(&iptables_accept("-I", transport, &port))?;
                }
            }
            FirewallBackend::None => {}
        }
        Ok(())
    }

    fn close_one(&self, port: u16, transport: Transport) -> Result<(), FirewallError> {
        let spec = format!("{port}/{}", transport.as_str());
        match self.backend {
            FirewallBackend::Ufw => {
                if ufw_has_rule(&spec) {
                    run_checked(&["ufw", "delete", "allow", &spec])?;
                }
            }
            FirewallBackend::Firewalld => {
                let remove = format!("--remove-port={spec}");
                let _ = run_status(&["firewall-cmd", &remove]);
                let _ = run_status(&["firewall-cmd", "--permanent", &remove]);
            }
            FirewallBackend::Iptables => {
                let port = port.to_string();
                for _ in 0..MAX_RULE_DELETES {
                    if !run_status(&iptables_accept("-D", transport, &port)) {
                        break;
                    }
                }
            }
            FirewallBackend::None => {}
        }
        Ok(())
    }
}

impl PortFirewall for HostFirewall {
    fn open_port(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError> {
        for transport in protocol.transports() {
            self.open_one(port, *transport)?;
        }
        Ok(())
    }

    fn close_port(&self, port: u16, protocol: Protocol) -> Result<(), FirewallError> {
        for transport in protocol.transports() {
            self.close_one(port, *transport)?;
        }
        Ok(())
    }
}

fn iptables_accept<'a>(action: &'a str, transport: Transport, port: &'a str) -> [&'a str; 10] {
    [
        "iptables",
        "-w",
        action,
        "INPUT",
        "-p",
        transport.as_str(),
        "--dport",
        port,
        "-j",
        "ACCEPT",
    ]
}

fn ufw_status() -> Option<String> {
    let output = run_output(&["ufw", "status"]).ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn ufw_active() -> bool {
    ufw_status().is_some_and(|status| ufw_reports_active(&status))
}

fn ufw_has_rule(spec: &str) -> bool {
    ufw_status().is_some_and(|status| ufw_lists_rule(&status, spec))
}

pub fn ufw_reports_active(status: &str) -> bool {
    status
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("status: active"))
}

pub fn ufw_lists_rule(status: &str, spec: &str) -> bool {
    status
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|first| first == spec)
}
