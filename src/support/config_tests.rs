use std::path::Path;
use std::time::Duration;

use super::config::{ConfigError, Settings};
use crate::infra::firewall::FirewallPreference;

#[test]
fn partial_file_keeps_defaults() {
    let yaml = "node_id: 12\ncrash_limit: 5\nfirewall: ufw\n";
    let settings = Settings::parse(yaml, Path::new("agent.yaml")).expect("parse");
    assert_eq!(settings.node_id, 12);
    assert_eq!(settings.crash_limit, 5);
    assert_eq!(settings.firewall, FirewallPreference::Ufw);
    assert_eq!(settings.stats_interval(), Duration::from_secs(10));
    assert_eq!(settings.restart_backoff(), Duration::from_secs(5));
    assert_eq!(settings.relay_args, "-c {config}");
}

#[test]
fn empty_file_is_all_defaults() {
    let settings = Settings::parse("  \n", Path::new("agent.yaml")).expect("parse");
    assert_eq!(settings, Settings::default());
}

#[test]
fn zero_interval_is_rejected() {
    let settings = Settings {
        stats_interval_secs: 0,
        ..Settings::default()
    };
    assert!(matches!(
        settings.validate(),
        Err(ConfigError::Invalid {
            field: "stats_interval_secs",
            ..
        })
    ));
}

#[test]
fn unbalanced_relay_args_are_rejected() {
    let settings = Settings {
        relay_args: "-c 'unterminated".to_string(),
        ..Settings::default()
    };
    assert!(matches!(
        settings.validate(),
        Err(ConfigError::Invalid {
            field: "relay_args",
            ..
        })
    ));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let err = Settings::load(Some(Path::new("/nonexistent/relaykeeper.yaml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
