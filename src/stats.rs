//! Engine-wide operational statistics.
//!
//! Guardrail hits, anomaly declarations, and queue pressure are recorded
//! here so they can be surfaced through reports and diagnostics. The stats
//! object is an explicit context passed into the pipeline; tests
//! instantiate their own instead of sharing process globals.

use crate::core::types::ConfigKey;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Tracks dimension guardrails, anomaly counts, and queue health.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Peak dimension count per (config, condition id).
    condition_dimension_sizes: Mutex<AHashMap<(ConfigKey, i64), usize>>,
    /// Peak dimension count per (config, metric id).
    metric_dimension_sizes: Mutex<AHashMap<(ConfigKey, i64), usize>>,
    /// Trackers that hit the hard dimension limit at least once.
    hard_limit_hits: Mutex<AHashMap<i64, u64>>,
    /// Declared anomalies per (config, alert id).
    anomalies_declared: Mutex<AHashMap<(ConfigKey, i64), u64>>,
    queue_overflow_count: AtomicU64,
    queue_max_observed_size: AtomicU64,
    queue_oldest_rejected_ns: AtomicI64,
    events_processed: AtomicU64,
    alarms_registered: AtomicU64,
}

impl EngineStats {
    /// Sliced trackers start reporting their dimension count at this size.
    pub const DIMENSION_KEY_SIZE_SOFT_LIMIT: usize = 500;
    /// Sliced trackers drop new keys past this size.
    pub const DIMENSION_KEY_SIZE_HARD_LIMIT: usize = 800;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_condition_dimension_size(&self, config: ConfigKey, condition_id: i64, size: usize) {
        let mut map = self.condition_dimension_sizes.lock();
        let entry = map.entry((config, condition_id)).or_insert(0);
        *entry = (*entry).max(size);
    }

    pub fn note_metric_dimension_size(&self, config: ConfigKey, metric_id: i64, size: usize) {
        let mut map = self.metric_dimension_sizes.lock();
        let entry = map.entry((config, metric_id)).or_insert(0);
        *entry = (*entry).max(size);
    }

    pub fn note_hard_dimension_limit_reached(&self, tracker_id: i64) {
        *self.hard_limit_hits.lock().entry(tracker_id).or_insert(0) += 1;
    }

    pub fn note_anomaly_declared(&self, config: ConfigKey, alert_id: i64) {
        *self
            .anomalies_declared
            .lock()
            .entry((config, alert_id))
            .or_insert(0) += 1;
    }

    pub fn note_queue_overflow(&self, oldest_timestamp_ns: i64, queue_size: usize) {
        self.queue_overflow_count.fetch_add(1, Ordering::Relaxed);
        self.queue_oldest_rejected_ns
            .store(oldest_timestamp_ns, Ordering::Relaxed);
        self.note_queue_size(queue_size);
    }

    pub fn note_queue_size(&self, size: usize) {
        self.queue_max_observed_size
            .fetch_max(size as u64, Ordering::Relaxed);
    }

    pub fn note_event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_alarm_registered(&self) {
        self.alarms_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_overflow_count(&self) -> u64 {
        self.queue_overflow_count.load(Ordering::Relaxed)
    }

    pub fn queue_max_observed_size(&self) -> u64 {
        self.queue_max_observed_size.load(Ordering::Relaxed)
    }

    pub fn queue_oldest_rejected_ns(&self) -> i64 {
        self.queue_oldest_rejected_ns.load(Ordering::Relaxed)
    }

    pub fn alarms_registered(&self) -> u64 {
        self.alarms_registered.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn anomalies_declared(&self, config: ConfigKey, alert_id: i64) -> u64 {
        self.anomalies_declared
            .lock()
            .get(&(config, alert_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn condition_dimension_size(&self, config: ConfigKey, condition_id: i64) -> usize {
        self.condition_dimension_sizes
            .lock()
            .get(&(config, condition_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn metric_dimension_size(&self, config: ConfigKey, metric_id: i64) -> usize {
        self.metric_dimension_sizes
            .lock()
            .get(&(config, metric_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn hard_limit_hits(&self, tracker_id: i64) -> u64 {
        self.hard_limit_hits
            .lock()
            .get(&tracker_id)
            .copied()
            .unwrap_or(0)
    }
}
