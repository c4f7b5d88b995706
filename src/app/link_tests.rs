use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::link::{classify, monitored_status, LinkHealthMonitor};
use super::test_support::ScriptedProber;
use crate::domain::task::LinkCheck;
use crate::domain::{LinkStatus, ProcessKey, Transport};
use crate::infra::probe::Prober;

fn monitor(prober: &Arc<ScriptedProber>, check: LinkCheck) -> Arc<LinkHealthMonitor> {
    LinkHealthMonitor::new(
        ProcessKey::new(1, 1),
        check,
        Transport::Tcp,
        Arc::clone(prober) as Arc<dyn Prober>,
        Duration::from_millis(10),
    )
}

#[test]
fn classification_table() {
    assert_eq!(classify(true, Some(true)), LinkStatus::Healthy);
    assert_eq!(classify(false, Some(true)), LinkStatus::Healthy);
    assert_eq!(classify(true, Some(false)), LinkStatus::Degraded);
    assert_eq!(classify(false, Some(false)), LinkStatus::Faulty);
    assert_eq!(classify(true, None), LinkStatus::Healthy);
    assert_eq!(classify(false, None), LinkStatus::Faulty);
}

#[test]
fn next_hop_only_follows_its_reachability() {
    let prober = Arc::new(ScriptedProber::default());
    let check = LinkCheck {
        next_hop: Some("10.0.0.2:1000".to_string()),
        end_to_end: None,
    };
    let monitor = monitor(&prober, check);

    assert_eq!(monitor.check_now(), LinkStatus::Faulty);
    prober.set("10.0.0.2:1000", true);
    assert_eq!(monitor.check_now(), LinkStatus::Healthy);
    assert_eq!(monitor.status(), LinkStatus::Healthy);
}

#[test]
fn end_to_end_without_next_hop() {
    let prober = Arc::new(ScriptedProber::default());
    let check = LinkCheck {
        next_hop: None,
        end_to_end: Some("example.net:443".to_string()),
    };
    let monitor = monitor(&prober, check);

    assert_eq!(monitor.check_now(), LinkStatus::Faulty);
    prober.set("example.net:443", true);
    assert_eq!(monitor.check_now(), LinkStatus::Healthy);
}

#[test]
fn started_monitor_checks_immediately_and_stops() {
    let prober = Arc::new(ScriptedProber::default());
    prober.set("10.0.0.2:1000", true);
    let check = LinkCheck {
        next_hop: Some("10.0.0.2:1000".to_string()),
        end_to_end: Some("10.0.0.3:1000".to_string()),
    };
    let monitor = monitor(&prober, check);

    monitor.start(Duration::from_secs(60));
    let mut status = monitor.status();
    for _ in 0..100 {
        if status == LinkStatus::Degraded {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        status = monitor.status();
    }
    monitor.stop();

    assert_eq!(status, LinkStatus::Degraded);
}

#[test]
fn missing_monitor_reports_nothing() {
    assert_eq!(monitored_status(None), None);
}
