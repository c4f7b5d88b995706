use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use super::alerts::spike_average;
use super::history::{bucket_start, TrafficRecorder};
use super::store::{ControlStore, MemoryStore};
use crate::domain::traffic::ForwardStat;
use crate::domain::LinkStatus;

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).expect("timestamp")
}

fn stat(traffic_in: u64, traffic_out: u64) -> ForwardStat {
    ForwardStat {
        rule_id: 3,
        node_id: 4,
        port: 30000,
        status: LinkStatus::Healthy,
        traffic_in_bytes: traffic_in,
        traffic_out_bytes: traffic_out,
        bps_in: 0.0,
        bps_out: 0.0,
        latency_ms: 1,
        active_connections: 0,
    }
}

fn recorder(bucket_secs: i64) -> (TrafficRecorder, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let recorder = TrafficRecorder::new(Arc::clone(&store) as Arc<dyn ControlStore>, bucket_secs);
    (recorder, store)
}

#[test]
fn buckets_align_to_their_width() {
    let start = bucket_start(at(0), 300);

    assert_eq!(start.unix_timestamp() % 300, 0);
    assert!(start <= at(0));
    assert_eq!(bucket_start(start + Duration::seconds(299), 300), start);
    assert_eq!(
        bucket_start(start + Duration::seconds(300), 300),
        start + Duration::seconds(300)
    );
}

#[test]
fn first_stat_only_sets_the_baseline() {
    let (recorder, _store) = recorder(60);

    let sample = recorder.record(&stat(5000, 7000), at(0)).expect("record");

    assert_eq!((sample.traffic_in, sample.traffic_out), (0, 0));
    assert!(sample.history.is_empty());
}

#[test]
fn deltas_accumulate_into_the_same_bucket() {
    let (recorder, store) = recorder(3600);
    let base = bucket_start(at(0), 3600);

    recorder.record(&stat(1000, 100), base).expect("baseline");
    let second = recorder
        .record(&stat(1500, 150), base + Duration::seconds(10))
        .expect("second");
    recorder
        .record(&stat(1700, 180), base + Duration::seconds(20))
        .expect("third");

    assert_eq!((second.traffic_in, second.traffic_out), (500, 50));
    let rows = store.list_traffic_history(3, 4, 10).expect("history");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].traffic_in, 700);
    assert_eq!(rows[0].traffic_out, 80);
    assert_eq!(rows[0].samples, 3);
}

#[test]
fn counter_reset_becomes_the_new_baseline() {
    let (recorder, _store) = recorder(60);

    recorder.record(&stat(9000, 9000), at(0)).expect("baseline");
    let reset = recorder.record(&stat(100, 50), at(10)).expect("reset");
    let after = recorder.record(&stat(400, 50), at(20)).expect("after");

    assert_eq!((reset.traffic_in, reset.traffic_out), (0, 0));
    assert_eq!((after.traffic_in, after.traffic_out), (300, 0));
}

#[test]
fn zero_reading_keeps_the_baseline() {
    let (recorder, _store) = recorder(60);

    recorder.record(&stat(1000, 1000), at(0)).expect("baseline");
    let blank = recorder.record(&stat(0, 0), at(10)).expect("blank");
    let next = recorder.record(&stat(1200, 1000), at(20)).expect("next");

    assert_eq!(blank.delta(), 0);
    assert_eq!(next.delta(), 200);
}

#[test]
fn history_is_read_before_the_current_sample() {
    let (recorder, _store) = recorder(60);

    recorder.record(&stat(0, 0), at(0)).expect("baseline");
    recorder.record(&stat(10, 0), at(60)).expect("first bucket");
    recorder.record(&stat(30, 0), at(120)).expect("second bucket");
    let sample = recorder.record(&stat(130, 0), at(180)).expect("third bucket");

    assert_eq!(sample.delta(), 100);
    assert_eq!(sample.history, vec![20, 10]);
}

#[test]
fn spike_history_skips_stats_without_a_delta() {
    let (recorder, _store) = recorder(60);

    recorder.record(&stat(1000, 0), at(0)).expect("baseline");
    recorder.record(&stat(1010, 0), at(10)).expect("measured");
    recorder.record(&stat(0, 0), at(20)).expect("blank");
    recorder.record(&stat(5, 0), at(30)).expect("reset");
    let sample = recorder.record(&stat(35, 0), at(40)).expect("measured");
    let next = recorder.record(&stat(36, 0), at(50)).expect("next");

    assert_eq!(sample.history, vec![10]);
    assert_eq!(next.history, vec![30, 10]);
}

#[test]
fn spike_history_keeps_the_latest_points() {
    let (recorder, _store) = recorder(300);
    let mut total = 0;
    recorder.record(&stat(total, 0), at(0)).expect("baseline");
    for tick in 1..=15 {
        total += tick;
        recorder.record(&stat(total, 0), at(tick as i64 * 10)).expect("tick");
    }

    let sample = recorder.record(&stat(total + 1, 0), at(160)).expect("last");

    assert_eq!(sample.history, (6..=15).rev().collect::<Vec<u64>>());
}

/// Recorder that has seen three stats each growing by 10 bytes.
fn steady_recorder() -> TrafficRecorder {
    let (recorder, _store) = recorder(300);
    recorder.record(&stat(0, 0), at(0)).expect("baseline");
    for (tick, total) in [10, 20, 30].into_iter().enumerate() {
        recorder
            .record(&stat(total, 0), at((tick as i64 + 1) * 10))
            .expect("steady");
    }
    recorder
}

#[test]
fn recorded_deltas_drive_spike_detection() {
    let spike = steady_recorder()
        .record(&stat(51, 0), at(40))
        .expect("spike");
    let calm = steady_recorder()
        .record(&stat(49, 0), at(40))
        .expect("calm");

    assert_eq!(spike.history, vec![10, 10, 10]);
    assert_eq!(spike_average(spike.delta(), &spike.history, 2.0), Some(10.0));
    assert_eq!(spike_average(calm.delta(), &calm.history, 2.0), None);
}

#[test]
fn burst_after_long_steady_traffic_is_flagged() {
    let (recorder, _store) = recorder(300);
    let mut total = 0;
    recorder.record(&stat(total, 0), at(0)).expect("baseline");
    for tick in 1..=181 {
        total += 1000;
        recorder.record(&stat(total, 0), at(tick * 10)).expect("steady");
    }

    let burst = recorder
        .record(&stat(total + 10_000, 0), at(1820))
        .expect("burst");

    assert_eq!(burst.delta(), 10_000);
    assert_eq!(burst.history, vec![1000; 10]);
    assert_eq!(spike_average(burst.delta(), &burst.history, 2.0), Some(1000.0));
}

#[test]
fn non_positive_bucket_width_falls_back_to_default() {
    let (recorder, store) = recorder(0);

    recorder.record(&stat(1, 1), at(1)).expect("record");

    let rows = store.list_traffic_history(3, 4, 1).expect("history");
    assert_eq!(rows[0].bucket_start, bucket_start(at(1), 300));
}
