use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::NodeId;
use crate::infra::firewall::FirewallPreference;
use crate::support::constants::DEFAULT_CONFIG_PATH;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Agent settings; every field has a default so partial files are valid.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub control_addr: String,
    pub node_id: NodeId,
    pub relay_bin: String,
    pub relay_args: String,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub stats_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub crash_limit: u32,
    pub stop_timeout_secs: u64,
    pub restart_backoff_secs: u64,
    pub probe_timeout_ms: u64,
    pub link_probe_timeout_ms: u64,
    pub ewma_alpha: f64,
    pub reconnect_backoff_secs: u64,
    pub firewall: FirewallPreference,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:7700".to_string(),
            node_id: 0,
            relay_bin: "realm".to_string(),
            relay_args: "-c {config}".to_string(),
            config_dir: PathBuf::from("/etc/relaykeeper/realm"),
            log_dir: PathBuf::from("/var/log/relaykeeper"),
            stats_interval_secs: 10,
            health_check_interval_secs: 10,
            crash_limit: 3,
            stop_timeout_secs: 10,
            restart_backoff_secs: 5,
            probe_timeout_ms: 2000,
            link_probe_timeout_ms: 3000,
            ewma_alpha: 0.3,
            reconnect_backoff_secs: 5,
            firewall: FirewallPreference::Auto,
            log_level: None,
        }
    }
}

impl Settings {
    /// Loads `path`, or the default location when none is given.
    ///
    /// A missing file at the default location yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path.is_some();
        let path = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);
        let mut settings = match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents, &path)?,
            Err(err) if !explicit && err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("RELAYKEEPER_CONTROL_ADDR") {
            self.control_addr = value;
        }
        if let Some(node_id) = env::var("RELAYKEEPER_NODE_ID")
            .ok()
            .and_then(|value| value.trim().parse().ok())
        {
            self.node_id = node_id;
        }
        if let Ok(value) = env::var("RELAYKEEPER_RELAY_BIN") {
            self.relay_bin = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("stats_interval_secs", self.stats_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("stop_timeout_secs", self.stop_timeout_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("link_probe_timeout_ms", self.link_probe_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.relay_bin.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "relay_bin",
                reason: "must not be empty".to_string(),
            });
        }
        if let Err(err) = shell_words::split(&self.relay_args) {
            return Err(ConfigError::Invalid {
                field: "relay_args",
                reason: err.to_string(),
            });
        }
        Ok(())
    }

    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub const fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub const fn link_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.link_probe_timeout_ms)
    }

    pub const fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}
