use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;

use crate::control::store::{ControlStore, StoreError};
use crate::domain::traffic::{ForwardStat, ForwardTrafficHistory};
use crate::domain::{NodeId, RuleId};
use crate::support::constants::{DEFAULT_BUCKET_SECS, SPIKE_HISTORY_POINTS};

/// Traffic observed between two consecutive stats of one relay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub traffic_in: u64,
    pub traffic_out: u64,
    /// Per-stat deltas measured before this sample, newest first.
    pub history: Vec<u64>,
}

impl TrafficSample {
    pub fn delta(&self) -> u64 {
        self.traffic_in.saturating_add(self.traffic_out)
    }
}

/// Last cumulative totals of one relay and its recent measured deltas.
struct Tracker {
    totals: (u64, u64),
    recent: VecDeque<u64>,
}

impl Tracker {
    fn remember(&mut self, delta: u64) {
        self.recent.push_front(delta);
        self.recent.truncate(SPIKE_HISTORY_POINTS);
    }
}

/// Turns cumulative agent counters into bucketed traffic history.
///
/// Buckets are persisted through the store. Spike history is kept per
/// relay in memory, one entry per stat that measured a delta, so the
/// current delta is always compared against deltas of the same width.
pub struct TrafficRecorder {
    store: Arc<dyn ControlStore>,
    bucket_secs: i64,
    trackers: Mutex<HashMap<(RuleId, NodeId), Tracker>>,
}

impl TrafficRecorder {
    pub fn new(store: Arc<dyn ControlStore>, bucket_secs: i64) -> Self {
        Self {
            store,
            bucket_secs: if bucket_secs > 0 {
                bucket_secs
            } else {
                DEFAULT_BUCKET_SECS
            },
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        stat: &ForwardStat,
        at: OffsetDateTime,
    ) -> Result<TrafficSample, StoreError> {
        let (traffic_in, traffic_out, history) = self.advance(stat);
        self.store.upsert_traffic_history(&ForwardTrafficHistory {
            rule_id: stat.rule_id,
            node_id: stat.node_id,
            bucket_start: bucket_start(at, self.bucket_secs),
            traffic_in,
            traffic_out,
            samples: 1,
        })?;
        Ok(TrafficSample {
            traffic_in,
            traffic_out,
            history,
        })
    }

    /// Stores the new totals and returns the growth since the previous stat
    /// together with the deltas measured before it.
    ///
    /// The first stat and any counter reset only set the baseline. A stat
    /// with both totals at zero carries no reading and leaves it untouched.
    /// None of these enter the spike history.
    fn advance(&self, stat: &ForwardStat) -> (u64, u64, Vec<u64>) {
        let current = (stat.traffic_in_bytes, stat.traffic_out_bytes);
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (stat.rule_id, stat.node_id);
        let Some(tracker) = trackers.get_mut(&key) else {
            trackers.insert(
                key,
                Tracker {
                    totals: current,
                    recent: VecDeque::new(),
                },
            );
            return (0, 0, Vec::new());
        };
        let history: Vec<u64> = tracker.recent.iter().copied().collect();
        if current == (0, 0) {
            return (0, 0, history);
        }
        let (prev_in, prev_out) = tracker.totals;
        tracker.totals = current;
        if current.0 < prev_in || current.1 < prev_out {
            return (0, 0, history);
        }
        let (delta_in, delta_out) = (current.0 - prev_in, current.1 - prev_out);
        tracker.remember(delta_in.saturating_add(delta_out));
        (delta_in, delta_out, history)
    }
}

pub fn bucket_start(at: OffsetDateTime, bucket_secs: i64) -> OffsetDateTime {
    let ts = at.unix_timestamp();
    let start = ts - ts.rem_euclid(bucket_secs.max(1));
    OffsetDateTime::from_unix_timestamp(start).unwrap_or(at)
}
