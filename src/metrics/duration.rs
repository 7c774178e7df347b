//! Duration trackers.
//!
//! Both variants are keyed by a *what* dimension and owned by a duration
//! metric producer. The OR'd tracker measures the union of all running
//! intervals: time counts while at least one dimension is started, and
//! overlaps never double-count. The MAX tracker records each dimension's
//! own interval and reports the longest one finalized in a bucket.
//!
//! Accrued time is kept per state key, so a state change mid-interval
//! attributes the elapsed slice to the state that was current while it ran.

use crate::anomaly::AnomalyTracker;
use crate::condition::{ConditionKey, ConditionWizard};
use crate::core::config::UploadThreshold;
use crate::core::types::{ConditionState, ConfigKey};
use crate::event::{FieldValue, HashableDimensionKey, MetricDimensionKey};
use crate::stats::EngineStats;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// One produced duration bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub duration_ns: i64,
    pub condition_true_ns: i64,
}

/// Bucket output, keyed by (what-dimension, state) pairs.
pub type DurationBucketOutput = AHashMap<MetricDimensionKey, Vec<DurationBucket>>;

/// A duration only reaches a report if it is positive and passes the
/// configured threshold.
pub fn duration_passes_threshold(threshold: &Option<UploadThreshold>, duration_ns: i64) -> bool {
    if duration_ns <= 0 {
        return false;
    }
    match threshold {
        Some(t) => t.passes_int(duration_ns),
        None => true,
    }
}

/// Fields shared by both tracker variants.
#[derive(Clone)]
pub struct DurationTrackerConfig {
    pub config_key: ConfigKey,
    pub tracker_id: i64,
    pub event_key: MetricDimensionKey,
    pub condition_index: Option<usize>,
    pub nested: bool,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,
    /// Origin of the bucket sequence (the metric's first bucket start).
    pub start_time_ns: i64,
    pub bucket_size_ns: i64,
    pub condition_sliced: bool,
    /// True when every output dimension of the condition is linked; a
    /// partial link widens wizard queries to containing keys.
    pub full_condition_links: bool,
    pub anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
}

struct DurationTrackerBase {
    config_key: ConfigKey,
    tracker_id: i64,
    event_key: MetricDimensionKey,
    condition_index: Option<usize>,
    nested: bool,
    current_bucket_start_ns: i64,
    current_bucket_num: i64,
    start_time_ns: i64,
    bucket_size_ns: i64,
    condition_sliced: bool,
    full_condition_links: bool,
    anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
    has_hit_guardrail: bool,
}

impl DurationTrackerBase {
    fn new(config: DurationTrackerConfig) -> Self {
        Self {
            config_key: config.config_key,
            tracker_id: config.tracker_id,
            event_key: config.event_key,
            condition_index: config.condition_index,
            nested: config.nested,
            current_bucket_start_ns: config.current_bucket_start_ns,
            current_bucket_num: config.current_bucket_num,
            start_time_ns: config.start_time_ns,
            bucket_size_ns: config.bucket_size_ns,
            condition_sliced: config.condition_sliced,
            full_condition_links: config.full_condition_links,
            anomaly_trackers: config.anomaly_trackers,
            has_hit_guardrail: false,
        }
    }

    fn current_bucket_end_time_ns(&self) -> i64 {
        self.start_time_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    fn detect_and_declare_anomaly(&self, timestamp_ns: i64, bucket_num: i64, value: i64) {
        for tracker in &self.anomaly_trackers {
            tracker
                .lock()
                .detect_and_declare_anomaly(timestamp_ns, bucket_num, &self.event_key, value);
        }
    }

    fn add_past_bucket_to_anomaly_trackers(
        &self,
        key: &MetricDimensionKey,
        value: i64,
        bucket_num: i64,
    ) {
        for tracker in &self.anomaly_trackers {
            tracker.lock().add_past_bucket_value(key, value, bucket_num);
        }
    }

    fn stop_anomaly_alarm(&self, timestamp_ns: i64) {
        for tracker in &self.anomaly_trackers {
            tracker.lock().stop_alarm(&self.event_key, timestamp_ns);
        }
    }

    fn query_condition(
        &self,
        wizard: &ConditionWizard<'_>,
        condition_key: &ConditionKey,
    ) -> ConditionState {
        match self.condition_index {
            Some(index) => wizard.query(index, condition_key, !self.full_condition_links),
            None => ConditionState::True,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StateDuration {
    duration_ns: i64,
    /// Carry across partial buckets within one full bucket, used for
    /// anomaly sums.
    full_bucket_duration_ns: i64,
}

/// OR'd duration: counts wall time while any dimension is started.
pub struct OringDurationTracker {
    base: DurationTrackerBase,
    /// Started and paused nesting counters per internal dimension.
    started: AHashMap<HashableDimensionKey, i32>,
    paused: AHashMap<HashableDimensionKey, i32>,
    last_start_time_ns: i64,
    /// Condition links captured at start, for sliced re-queries.
    condition_key_map: AHashMap<HashableDimensionKey, ConditionKey>,
    /// Accrued time per state key.
    state_key_durations: AHashMap<HashableDimensionKey, StateDuration>,
}

impl OringDurationTracker {
    pub fn new(config: DurationTrackerConfig) -> Self {
        Self {
            base: DurationTrackerBase::new(config),
            started: AHashMap::new(),
            paused: AHashMap::new(),
            last_start_time_ns: 0,
            condition_key_map: AHashMap::new(),
            state_key_durations: AHashMap::new(),
        }
    }

    fn hit_guardrail(
        &mut self,
        new_key: &HashableDimensionKey,
        hard_limit: usize,
        stats: &EngineStats,
    ) -> bool {
        if self.condition_key_map.contains_key(new_key) {
            return false;
        }
        if self.condition_key_map.len() >= EngineStats::DIMENSION_KEY_SIZE_SOFT_LIMIT {
            let new_count = self.condition_key_map.len() + 1;
            stats.note_metric_dimension_size(
                self.base.config_key,
                self.base.tracker_id,
                new_count,
            );
            if new_count > hard_limit {
                if !self.base.has_hit_guardrail {
                    warn!(
                        tracker_id = self.base.tracker_id,
                        key = %new_key,
                        "duration tracker dropping data over the dimension hard limit"
                    );
                    self.base.has_hit_guardrail = true;
                }
                stats.note_hard_dimension_limit_reached(self.base.tracker_id);
                return true;
            }
        }
        false
    }

    fn current_state_key_duration(&self) -> i64 {
        self.state_key_durations
            .get(self.base.event_key.state_values_key())
            .map(|d| d.duration_ns)
            .unwrap_or(0)
    }

    fn current_state_key_full_bucket_duration(&self) -> i64 {
        self.state_key_durations
            .get(self.base.event_key.state_values_key())
            .map(|d| d.full_bucket_duration_ns)
            .unwrap_or(0)
    }

    fn accrue_to_current_state(&mut self, until_ns: i64) {
        let state_key = self.base.event_key.state_values_key().clone();
        self.state_key_durations
            .entry(state_key)
            .or_default()
            .duration_ns += until_ns - self.last_start_time_ns;
    }

    fn start_anomaly_alarm(&self, timestamp_ns: i64) {
        for tracker in &self.base.anomaly_trackers {
            let mut guard = tracker.lock();
            let predicted = self.predict_anomaly_timestamp_ns(&guard, timestamp_ns);
            guard.start_alarm(&self.base.event_key, predicted);
        }
    }

    pub fn note_start(
        &mut self,
        key: &HashableDimensionKey,
        condition: bool,
        event_time_ns: i64,
        condition_key: ConditionKey,
        hard_limit: usize,
        stats: &EngineStats,
    ) {
        if self.hit_guardrail(key, hard_limit, stats) {
            return;
        }
        if condition {
            if self.started.is_empty() {
                self.last_start_time_ns = event_time_ns;
                self.start_anomaly_alarm(event_time_ns);
            }
            *self.started.entry(key.clone()).or_insert(0) += 1;
        } else {
            *self.paused.entry(key.clone()).or_insert(0) += 1;
        }
        if self.base.condition_sliced && !self.condition_key_map.contains_key(key) {
            self.condition_key_map.insert(key.clone(), condition_key);
        }
    }

    pub fn note_stop(&mut self, key: &HashableDimensionKey, timestamp_ns: i64, stop_all: bool) {
        if let Some(count) = self.started.get_mut(key) {
            *count -= 1;
            if stop_all || !self.base.nested || *count <= 0 {
                self.started.remove(key);
                self.condition_key_map.remove(key);
            }
            if self.started.is_empty() {
                self.accrue_to_current_state(timestamp_ns);
                self.base.detect_and_declare_anomaly(
                    timestamp_ns,
                    self.base.current_bucket_num,
                    self.current_state_key_duration()
                        + self.current_state_key_full_bucket_duration(),
                );
            }
        }

        if let Some(count) = self.paused.get_mut(key) {
            *count -= 1;
            if stop_all || !self.base.nested || *count <= 0 {
                self.paused.remove(key);
                self.condition_key_map.remove(key);
            }
        }
        if self.started.is_empty() {
            self.base.stop_anomaly_alarm(timestamp_ns);
        }
    }

    pub fn note_stop_all(&mut self, timestamp_ns: i64) {
        if !self.started.is_empty() {
            self.accrue_to_current_state(timestamp_ns);
            self.base.detect_and_declare_anomaly(
                timestamp_ns,
                self.base.current_bucket_num,
                self.current_state_key_duration() + self.current_state_key_full_bucket_duration(),
            );
        }
        self.base.stop_anomaly_alarm(timestamp_ns);
        self.started.clear();
        self.paused.clear();
        self.condition_key_map.clear();
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        if condition {
            if !self.paused.is_empty() {
                if self.started.is_empty() {
                    self.last_start_time_ns = timestamp_ns;
                    self.start_anomaly_alarm(timestamp_ns);
                }
                let paused = std::mem::take(&mut self.paused);
                for (key, count) in paused {
                    *self.started.entry(key).or_insert(0) += count;
                }
            }
        } else if !self.started.is_empty() {
            self.accrue_to_current_state(timestamp_ns);
            let started = std::mem::take(&mut self.started);
            for (key, count) in started {
                *self.paused.entry(key).or_insert(0) += count;
            }
            self.base.detect_and_declare_anomaly(
                timestamp_ns,
                self.base.current_bucket_num,
                self.current_state_key_duration() + self.current_state_key_full_bucket_duration(),
            );
        }
        if self.started.is_empty() {
            self.base.stop_anomaly_alarm(timestamp_ns);
        }
    }

    /// Re-queries the sliced condition for every tracked dimension and
    /// moves keys between started and paused accordingly.
    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: &ConditionWizard<'_>,
        timestamp_ns: i64,
    ) {
        let mut started_to_paused: Vec<(HashableDimensionKey, i32)> = Vec::new();
        let mut paused_to_started: Vec<(HashableDimensionKey, i32)> = Vec::new();

        if !self.started.is_empty() {
            let keys: Vec<HashableDimensionKey> = self.started.keys().cloned().collect();
            for key in keys {
                let Some(condition_key) = self.condition_key_map.get(&key) else {
                    continue;
                };
                if self.base.query_condition(wizard, condition_key) != ConditionState::True {
                    if let Some(count) = self.started.remove(&key) {
                        started_to_paused.push((key, count));
                    }
                }
            }

            if self.started.is_empty() {
                self.accrue_to_current_state(timestamp_ns);
                self.base.detect_and_declare_anomaly(
                    timestamp_ns,
                    self.base.current_bucket_num,
                    self.current_state_key_duration()
                        + self.current_state_key_full_bucket_duration(),
                );
            }
        }

        if !self.paused.is_empty() {
            let keys: Vec<HashableDimensionKey> = self.paused.keys().cloned().collect();
            for key in keys {
                let Some(condition_key) = self.condition_key_map.get(&key) else {
                    continue;
                };
                if self.base.query_condition(wizard, condition_key) == ConditionState::True {
                    if let Some(count) = self.paused.remove(&key) {
                        paused_to_started.push((key, count));
                    }
                }
            }

            if self.started.is_empty() && !paused_to_started.is_empty() {
                self.last_start_time_ns = timestamp_ns;
            }
        }

        if self.started.is_empty() && !paused_to_started.is_empty() {
            self.start_anomaly_alarm(timestamp_ns);
        }
        for (key, count) in paused_to_started {
            *self.started.entry(key).or_insert(0) += count;
        }
        for (key, count) in started_to_paused {
            *self.paused.entry(key).or_insert(0) += count;
        }

        if self.started.is_empty() {
            self.base.stop_anomaly_alarm(timestamp_ns);
        }
    }

    /// A state flip accrues the running slice to the old state key, then
    /// switches the key and restarts the clock.
    pub fn on_state_changed(&mut self, timestamp_ns: i64, atom_id: i32, new_state: &FieldValue) {
        if self.started.is_empty() {
            self.update_current_state_key(atom_id, new_state);
            return;
        }
        self.accrue_to_current_state(timestamp_ns);
        self.last_start_time_ns = timestamp_ns;
        self.update_current_state_key(atom_id, new_state);
    }

    fn update_current_state_key(&mut self, atom_id: i32, new_state: &FieldValue) {
        let state_key = self.base.event_key.state_values_key_mut();
        for value in state_key.values_mut() {
            if value.field.tag() == atom_id {
                value.value = new_state.value.clone();
            }
        }
    }

    pub fn has_accumulated_duration(&self) -> bool {
        !self.started.is_empty() || !self.paused.is_empty() || !self.state_key_durations.is_empty()
    }

    pub fn has_started_duration(&self) -> bool {
        !self.started.is_empty()
    }

    pub fn flush_if_needed(
        &mut self,
        event_time_ns: i64,
        threshold: &Option<UploadThreshold>,
        output: &mut DurationBucketOutput,
    ) -> bool {
        if event_time_ns < self.base.current_bucket_end_time_ns() {
            return false;
        }
        self.flush_current_bucket(event_time_ns, threshold, 0, output)
    }

    /// Closes the current bucket at `event_time_ns`.
    ///
    /// Whole buckets crossed while a dimension was still running are filled
    /// with the full bucket size for the current state key. Returns true
    /// when the tracker is finished and can be dropped by its owner.
    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        threshold: &Option<UploadThreshold>,
        global_condition_true_ns: i64,
        output: &mut DurationBucketOutput,
    ) -> bool {
        let full_bucket_end = self.base.current_bucket_end_time_ns();
        let (num_buckets_forward, current_bucket_end_time_ns) = if event_time_ns >= full_bucket_end
        {
            (
                1 + (event_time_ns - full_bucket_end) / self.base.bucket_size_ns,
                full_bucket_end,
            )
        } else {
            // Closing early: a partial bucket.
            (0, event_time_ns)
        };
        let is_full_bucket = num_buckets_forward > 0;

        if !self.started.is_empty() {
            self.accrue_to_current_state(current_bucket_end_time_ns);
        }

        // One bucket per state key that accrued time.
        for (state_key, state_duration) in self.state_key_durations.iter_mut() {
            state_duration.full_bucket_duration_ns += state_duration.duration_ns;
            if duration_passes_threshold(threshold, state_duration.duration_ns) {
                output
                    .entry(MetricDimensionKey::new(
                        self.base.event_key.dimension_key_in_what().clone(),
                        state_key.clone(),
                    ))
                    .or_default()
                    .push(DurationBucket {
                        bucket_start_ns: self.base.current_bucket_start_ns,
                        bucket_end_ns: current_bucket_end_time_ns,
                        duration_ns: state_duration.duration_ns,
                        condition_true_ns: global_condition_true_ns,
                    });
            }
            state_duration.duration_ns = 0;
        }
        if is_full_bucket {
            let full_bucket_duration = self.current_state_key_full_bucket_duration();
            self.base.add_past_bucket_to_anomaly_trackers(
                &self.base.event_key,
                full_bucket_duration,
                self.base.current_bucket_num,
            );
        }
        // Full-bucket carries are only needed while anomaly trackers watch
        // a partial bucket.
        if is_full_bucket || self.base.anomaly_trackers.is_empty() {
            self.state_key_durations.clear();
        }

        if !self.started.is_empty() {
            for i in 1..num_buckets_forward {
                let bucket_start = full_bucket_end + self.base.bucket_size_ns * (i - 1);
                let info = DurationBucket {
                    bucket_start_ns: bucket_start,
                    bucket_end_ns: bucket_start + self.base.bucket_size_ns,
                    duration_ns: self.base.bucket_size_ns,
                    condition_true_ns: 0,
                };
                // Filled buckets are attributed to the current state key.
                output
                    .entry(self.base.event_key.clone())
                    .or_default()
                    .push(info);
                self.base.add_past_bucket_to_anomaly_trackers(
                    &self.base.event_key,
                    info.duration_ns,
                    self.base.current_bucket_num + i,
                );
            }
        } else if num_buckets_forward >= 2 {
            self.base.add_past_bucket_to_anomaly_trackers(
                &self.base.event_key,
                0,
                self.base.current_bucket_num + num_buckets_forward - 1,
            );
        }

        if num_buckets_forward > 0 {
            self.base.current_bucket_start_ns =
                full_bucket_end + (num_buckets_forward - 1) * self.base.bucket_size_ns;
            self.base.current_bucket_num += num_buckets_forward;
        } else {
            self.base.current_bucket_start_ns = event_time_ns;
        }
        self.last_start_time_ns = self.base.current_bucket_start_ns;
        self.base.has_hit_guardrail = false;

        // On a full bucket with nothing running the owner can drop us; on a
        // partial bucket the full-bucket carry may still feed anomaly sums.
        self.started.is_empty()
            && self.paused.is_empty()
            && (is_full_bucket || self.base.anomaly_trackers.is_empty())
    }

    /// Earliest future instant at which the window sum could exceed the
    /// alert threshold, assuming the running interval continues.
    pub fn predict_anomaly_timestamp_ns(
        &self,
        anomaly_tracker: &AnomalyTracker,
        event_timestamp_ns: i64,
    ) -> i64 {
        let threshold_ns = anomaly_tracker.anomaly_threshold();
        let current_bucket_end_ns = self.base.current_bucket_end_time_ns();
        let current_state_bucket_past_ns =
            self.current_state_key_duration() + self.current_state_key_full_bucket_duration();
        let mut past_ns = current_state_bucket_past_ns
            + anomaly_tracker.get_sum_over_past_buckets(&self.base.event_key);
        let refractory_period_end_ns = anomaly_tracker
            .get_refractory_period_ends_sec(&self.base.event_key)
            * 1_000_000_000;

        let anomaly_timestamp_ns =
            (event_timestamp_ns + threshold_ns - past_ns).max(refractory_period_end_ns);
        if anomaly_timestamp_ns <= current_bucket_end_ns {
            return event_timestamp_ns.max(anomaly_timestamp_ns);
        }

        let num_past_buckets = anomaly_tracker.num_past_buckets() as i64;
        if num_past_buckets > 0 {
            past_ns -= anomaly_tracker.get_past_bucket_value(
                &self.base.event_key,
                self.base.current_bucket_num - num_past_buckets,
            );
            past_ns += current_bucket_end_ns - event_timestamp_ns;
        } else {
            // The alert looks at a single bucket.
            past_ns = 0;
        }

        for future_bucket_idx in 1..=(num_past_buckets + 1) {
            let bucket_end_ns =
                current_bucket_end_ns + future_bucket_idx * self.base.bucket_size_ns;
            let candidate_ns = (bucket_end_ns - self.base.bucket_size_ns + threshold_ns - past_ns)
                .max(refractory_period_end_ns);
            if candidate_ns <= bucket_end_ns {
                return candidate_ns;
            }
            if num_past_buckets <= 0 {
                continue;
            }

            past_ns += self.base.bucket_size_ns;
            if future_bucket_idx < num_past_buckets {
                past_ns -= anomaly_tracker.get_past_bucket_value(
                    &self.base.event_key,
                    self.base.current_bucket_num - num_past_buckets + future_bucket_idx,
                );
            } else if future_bucket_idx == num_past_buckets {
                past_ns -=
                    current_state_bucket_past_ns + (current_bucket_end_ns - event_timestamp_ns);
            }
        }

        (event_timestamp_ns + threshold_ns).max(refractory_period_end_ns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DurationState {
    Started,
    Paused,
    Stopped,
}

#[derive(Debug)]
struct MaxDurationInfo {
    state: DurationState,
    start_count: i32,
    last_start_time_ns: i64,
    last_duration_ns: i64,
    condition_key: ConditionKey,
}

/// MAX duration: each dimension runs its own interval; a bucket reports the
/// longest duration finalized within it.
pub struct MaxDurationTracker {
    base: DurationTrackerBase,
    infos: AHashMap<HashableDimensionKey, MaxDurationInfo>,
    /// Longest duration finalized in the current bucket so far.
    max_duration_ns: i64,
}

impl MaxDurationTracker {
    pub fn new(config: DurationTrackerConfig) -> Self {
        Self {
            base: DurationTrackerBase::new(config),
            infos: AHashMap::new(),
            max_duration_ns: 0,
        }
    }

    fn hit_guardrail(
        &mut self,
        new_key: &HashableDimensionKey,
        hard_limit: usize,
        stats: &EngineStats,
    ) -> bool {
        if self.infos.contains_key(new_key) {
            return false;
        }
        if self.infos.len() >= EngineStats::DIMENSION_KEY_SIZE_SOFT_LIMIT {
            let new_count = self.infos.len() + 1;
            stats.note_metric_dimension_size(
                self.base.config_key,
                self.base.tracker_id,
                new_count,
            );
            if new_count > hard_limit {
                if !self.base.has_hit_guardrail {
                    warn!(
                        tracker_id = self.base.tracker_id,
                        key = %new_key,
                        "max-duration tracker dropping data over the dimension hard limit"
                    );
                    self.base.has_hit_guardrail = true;
                }
                stats.note_hard_dimension_limit_reached(self.base.tracker_id);
                return true;
            }
        }
        false
    }

    pub fn note_start(
        &mut self,
        key: &HashableDimensionKey,
        condition: bool,
        event_time_ns: i64,
        condition_key: ConditionKey,
        hard_limit: usize,
        stats: &EngineStats,
    ) {
        if self.hit_guardrail(key, hard_limit, stats) {
            return;
        }
        let info = self.infos.entry(key.clone()).or_insert(MaxDurationInfo {
            state: DurationState::Stopped,
            start_count: 0,
            last_start_time_ns: 0,
            last_duration_ns: 0,
            condition_key: ConditionKey::default(),
        });
        if self.base.condition_sliced {
            info.condition_key = condition_key;
        }
        match info.state {
            DurationState::Started | DurationState::Paused => info.start_count += 1,
            DurationState::Stopped => {
                if condition {
                    info.state = DurationState::Started;
                    info.last_start_time_ns = event_time_ns;
                } else {
                    info.state = DurationState::Paused;
                }
                info.start_count = 1;
            }
        }
    }

    pub fn note_stop(&mut self, key: &HashableDimensionKey, event_time_ns: i64, stop_all: bool) {
        let Some(info) = self.infos.get_mut(key) else {
            return;
        };
        match info.state {
            DurationState::Stopped => {}
            DurationState::Started => {
                info.start_count -= 1;
                if stop_all || !self.base.nested || info.start_count <= 0 {
                    info.last_duration_ns += event_time_ns - info.last_start_time_ns;
                    info.state = DurationState::Stopped;
                }
            }
            DurationState::Paused => {
                info.start_count -= 1;
                if stop_all || !self.base.nested || info.start_count <= 0 {
                    info.state = DurationState::Stopped;
                }
            }
        }
        let last_duration = info.last_duration_ns;
        if last_duration != 0 {
            self.base.detect_and_declare_anomaly(
                event_time_ns,
                self.base.current_bucket_num,
                last_duration,
            );
        }
    }

    pub fn note_stop_all(&mut self, event_time_ns: i64) {
        let keys: Vec<HashableDimensionKey> = self.infos.keys().cloned().collect();
        for key in keys {
            self.note_stop(&key, event_time_ns, true);
        }
    }

    fn note_condition_changed(
        &mut self,
        key: &HashableDimensionKey,
        condition_met: bool,
        timestamp_ns: i64,
    ) {
        let Some(info) = self.infos.get_mut(key) else {
            return;
        };
        match info.state {
            DurationState::Started => {
                if !condition_met {
                    info.last_duration_ns += timestamp_ns - info.last_start_time_ns;
                    info.state = DurationState::Paused;
                }
            }
            DurationState::Paused => {
                if condition_met {
                    info.state = DurationState::Started;
                    info.last_start_time_ns = timestamp_ns;
                }
            }
            DurationState::Stopped => {}
        }
        let last_duration = info.last_duration_ns;
        if last_duration > 0 {
            self.base.detect_and_declare_anomaly(
                timestamp_ns,
                self.base.current_bucket_num,
                last_duration,
            );
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        let keys: Vec<HashableDimensionKey> = self.infos.keys().cloned().collect();
        for key in keys {
            self.note_condition_changed(&key, condition, timestamp_ns);
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: &ConditionWizard<'_>,
        timestamp_ns: i64,
    ) {
        let queries: Vec<(HashableDimensionKey, bool)> = self
            .infos
            .iter()
            .map(|(key, info)| {
                let state = self.base.query_condition(wizard, &info.condition_key);
                (key.clone(), state == ConditionState::True)
            })
            .collect();
        for (key, condition_met) in queries {
            self.note_condition_changed(&key, condition_met, timestamp_ns);
        }
    }

    pub fn has_accumulated_duration(&self) -> bool {
        !self.infos.is_empty() || self.max_duration_ns > 0
    }

    pub fn has_started_duration(&self) -> bool {
        self.infos
            .values()
            .any(|info| info.state == DurationState::Started)
    }

    pub fn flush_if_needed(
        &mut self,
        event_time_ns: i64,
        threshold: &Option<UploadThreshold>,
        output: &mut DurationBucketOutput,
    ) -> bool {
        if event_time_ns < self.base.current_bucket_end_time_ns() {
            return false;
        }
        self.flush_current_bucket(event_time_ns, threshold, 0, output)
    }

    /// Reports the longest interval finalized in the bucket. Intervals
    /// still running are attributed to the bucket they stop in.
    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        threshold: &Option<UploadThreshold>,
        global_condition_true_ns: i64,
        output: &mut DurationBucketOutput,
    ) -> bool {
        let full_bucket_end = self.base.current_bucket_end_time_ns();
        let (num_buckets_forward, current_bucket_end_time_ns) = if event_time_ns >= full_bucket_end
        {
            (
                1 + (event_time_ns - full_bucket_end) / self.base.bucket_size_ns,
                full_bucket_end,
            )
        } else {
            (0, event_time_ns)
        };

        let mut has_pending = false;
        self.infos.retain(|_, info| {
            if info.state == DurationState::Stopped {
                self.max_duration_ns = self.max_duration_ns.max(info.last_duration_ns);
                false
            } else {
                has_pending = true;
                true
            }
        });

        if duration_passes_threshold(threshold, self.max_duration_ns) {
            output
                .entry(self.base.event_key.clone())
                .or_default()
                .push(DurationBucket {
                    bucket_start_ns: self.base.current_bucket_start_ns,
                    bucket_end_ns: current_bucket_end_time_ns,
                    duration_ns: self.max_duration_ns,
                    condition_true_ns: global_condition_true_ns,
                });
        }

        if num_buckets_forward > 0 {
            self.base.current_bucket_start_ns =
                full_bucket_end + (num_buckets_forward - 1) * self.base.bucket_size_ns;
            self.base.current_bucket_num += num_buckets_forward;
        } else {
            self.base.current_bucket_start_ns = event_time_ns;
        }
        self.max_duration_ns = 0;
        self.base.has_hit_guardrail = false;

        !has_pending
    }

    /// Prediction is undefined for MAX aggregation; the current timestamp
    /// keeps callers from arming an alarm in the past.
    pub fn predict_anomaly_timestamp_ns(
        &self,
        _anomaly_tracker: &AnomalyTracker,
        event_timestamp_ns: i64,
    ) -> i64 {
        warn!("max-duration trackers do not support anomaly timestamp prediction");
        event_timestamp_ns
    }
}

/// A duration tracker of either variant.
pub enum DurationTracker {
    Oring(OringDurationTracker),
    Max(MaxDurationTracker),
}

impl DurationTracker {
    pub fn note_start(
        &mut self,
        key: &HashableDimensionKey,
        condition: bool,
        event_time_ns: i64,
        condition_key: ConditionKey,
        hard_limit: usize,
        stats: &EngineStats,
    ) {
        match self {
            DurationTracker::Oring(t) => {
                t.note_start(key, condition, event_time_ns, condition_key, hard_limit, stats)
            }
            DurationTracker::Max(t) => {
                t.note_start(key, condition, event_time_ns, condition_key, hard_limit, stats)
            }
        }
    }

    pub fn note_stop(&mut self, key: &HashableDimensionKey, timestamp_ns: i64, stop_all: bool) {
        match self {
            DurationTracker::Oring(t) => t.note_stop(key, timestamp_ns, stop_all),
            DurationTracker::Max(t) => t.note_stop(key, timestamp_ns, stop_all),
        }
    }

    pub fn note_stop_all(&mut self, timestamp_ns: i64) {
        match self {
            DurationTracker::Oring(t) => t.note_stop_all(timestamp_ns),
            DurationTracker::Max(t) => t.note_stop_all(timestamp_ns),
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        match self {
            DurationTracker::Oring(t) => t.on_condition_changed(condition, timestamp_ns),
            DurationTracker::Max(t) => t.on_condition_changed(condition, timestamp_ns),
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: &ConditionWizard<'_>,
        timestamp_ns: i64,
    ) {
        match self {
            DurationTracker::Oring(t) => t.on_sliced_condition_may_change(wizard, timestamp_ns),
            DurationTracker::Max(t) => t.on_sliced_condition_may_change(wizard, timestamp_ns),
        }
    }

    pub fn on_state_changed(&mut self, timestamp_ns: i64, atom_id: i32, new_state: &FieldValue) {
        match self {
            DurationTracker::Oring(t) => t.on_state_changed(timestamp_ns, atom_id, new_state),
            // MAX aggregation rejects state slicing at install time.
            DurationTracker::Max(_) => {}
        }
    }

    pub fn flush_if_needed(
        &mut self,
        event_time_ns: i64,
        threshold: &Option<UploadThreshold>,
        output: &mut DurationBucketOutput,
    ) -> bool {
        match self {
            DurationTracker::Oring(t) => t.flush_if_needed(event_time_ns, threshold, output),
            DurationTracker::Max(t) => t.flush_if_needed(event_time_ns, threshold, output),
        }
    }

    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        threshold: &Option<UploadThreshold>,
        global_condition_true_ns: i64,
        output: &mut DurationBucketOutput,
    ) -> bool {
        match self {
            DurationTracker::Oring(t) => t.flush_current_bucket(
                event_time_ns,
                threshold,
                global_condition_true_ns,
                output,
            ),
            DurationTracker::Max(t) => t.flush_current_bucket(
                event_time_ns,
                threshold,
                global_condition_true_ns,
                output,
            ),
        }
    }

    pub fn has_accumulated_duration(&self) -> bool {
        match self {
            DurationTracker::Oring(t) => t.has_accumulated_duration(),
            DurationTracker::Max(t) => t.has_accumulated_duration(),
        }
    }

    pub fn has_started_duration(&self) -> bool {
        match self {
            DurationTracker::Oring(t) => t.has_started_duration(),
            DurationTracker::Max(t) => t.has_started_duration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Field, Value};

    const NS_PER_SEC: i64 = 1_000_000_000;
    const BUCKET_SIZE_NS: i64 = 60 * NS_PER_SEC;
    const HARD_LIMIT: usize = EngineStats::DIMENSION_KEY_SIZE_HARD_LIMIT;

    fn what_key(name: &str) -> HashableDimensionKey {
        let mut key = HashableDimensionKey::default();
        key.add_value(FieldValue::new(
            Field::new(10, crate::event::field::get_simple_field(1)),
            Value::Str(name.to_owned()),
        ));
        key
    }

    fn config(anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>) -> DurationTrackerConfig {
        DurationTrackerConfig {
            config_key: ConfigKey::new(0, 1),
            tracker_id: 1,
            event_key: MetricDimensionKey::new(what_key("w"), HashableDimensionKey::default()),
            condition_index: None,
            nested: false,
            current_bucket_start_ns: 0,
            current_bucket_num: 0,
            start_time_ns: 0,
            bucket_size_ns: BUCKET_SIZE_NS,
            condition_sliced: false,
            full_condition_links: true,
            anomaly_trackers,
        }
    }

    fn total_duration(output: &DurationBucketOutput) -> i64 {
        output
            .values()
            .flat_map(|buckets| buckets.iter())
            .map(|b| b.duration_ns)
            .sum()
    }

    #[test]
    fn test_oring_union_never_double_counts() {
        let stats = EngineStats::new();
        let mut tracker = OringDurationTracker::new(config(Vec::new()));
        let key_a = what_key("a");
        let key_b = what_key("b");

        // A@10s, B@20s, stop A@40s, stop B@60s: union is [10, 60] = 50s.
        tracker.note_start(&key_a, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_start(&key_b, true, 20 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_stop(&key_a, 40 * NS_PER_SEC, false);
        tracker.note_stop(&key_b, 60 * NS_PER_SEC, false);

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 50 * NS_PER_SEC);
    }

    #[test]
    fn test_oring_condition_pause_resume() {
        let stats = EngineStats::new();
        let mut tracker = OringDurationTracker::new(config(Vec::new()));
        let key = what_key("a");

        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        // Condition falls at 20s, rises at 45s, stop at 55s: 10 + 10 = 20s.
        tracker.on_condition_changed(false, 20 * NS_PER_SEC);
        tracker.on_condition_changed(true, 45 * NS_PER_SEC);
        tracker.note_stop(&key, 55 * NS_PER_SEC, false);

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 20 * NS_PER_SEC);
    }

    #[test]
    fn test_oring_paused_start_accrues_nothing() {
        let stats = EngineStats::new();
        let mut tracker = OringDurationTracker::new(config(Vec::new()));
        let key = what_key("a");

        // Start under a false condition, stop before it ever turns true.
        tracker.note_start(&key, false, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_stop(&key, 50 * NS_PER_SEC, false);

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 0);
    }

    #[test]
    fn test_oring_cross_bucket_fills_whole_buckets() {
        let stats = EngineStats::new();
        let mut tracker = OringDurationTracker::new(config(Vec::new()));
        let key = what_key("a");

        // Runs from 10s across two full bucket boundaries to 130s.
        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);

        let mut output = DurationBucketOutput::default();
        // Stop lands in bucket #2.
        tracker.flush_if_needed(130 * NS_PER_SEC, &None, &mut output);
        tracker.note_stop(&key, 130 * NS_PER_SEC, false);

        let buckets: Vec<DurationBucket> = output.values().flatten().copied().collect();
        // Bucket [0,60) holds 50s, bucket [60,120) was filled whole.
        assert_eq!(buckets.len(), 2);
        assert_eq!(total_duration(&output), 50 * NS_PER_SEC + BUCKET_SIZE_NS);

        let mut final_output = DurationBucketOutput::default();
        tracker.flush_current_bucket(135 * NS_PER_SEC, &None, 0, &mut final_output);
        // [120, 130] of the third bucket.
        assert_eq!(total_duration(&final_output), 10 * NS_PER_SEC);
    }

    #[test]
    fn test_oring_nested_stops() {
        let stats = EngineStats::new();
        let mut cfg = config(Vec::new());
        cfg.nested = true;
        let mut tracker = OringDurationTracker::new(cfg);
        let key = what_key("a");

        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_start(&key, true, 20 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        // First stop only decrements.
        tracker.note_stop(&key, 30 * NS_PER_SEC, false);
        assert!(tracker.has_started_duration());
        tracker.note_stop(&key, 40 * NS_PER_SEC, false);
        assert!(!tracker.has_started_duration());

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 30 * NS_PER_SEC);
    }

    #[test]
    fn test_oring_state_change_splits_attribution() {
        let stats = EngineStats::new();
        let state_atom = 27;
        let mut cfg = config(Vec::new());
        let mut state_values = HashableDimensionKey::default();
        let mut fv = FieldValue::new(
            Field::new(state_atom, crate::event::field::get_simple_field(1)),
            Value::Int(1),
        );
        fv.annotations.set_exclusive_state(true);
        state_values.add_value(fv);
        cfg.event_key = MetricDimensionKey::new(what_key("w"), state_values);
        let mut tracker = OringDurationTracker::new(cfg);
        let key = what_key("a");

        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        // State flips 1 -> 2 at 25s; stop at 40s.
        let new_state = FieldValue::new(
            Field::new(state_atom, crate::event::field::get_simple_field(1)),
            Value::Int(2),
        );
        tracker.on_state_changed(25 * NS_PER_SEC, state_atom, &new_state);
        tracker.note_stop(&key, 40 * NS_PER_SEC, false);

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);

        // 15s under state 1, 15s under state 2.
        assert_eq!(output.len(), 2);
        for (key, buckets) in &output {
            let state = &key.state_values_key().values()[0].value;
            match state {
                Value::Int(1) | Value::Int(2) => {
                    assert_eq!(buckets[0].duration_ns, 15 * NS_PER_SEC)
                }
                other => panic!("unexpected state value {:?}", other),
            }
        }
    }

    #[test]
    fn test_oring_threshold_filters_buckets() {
        let stats = EngineStats::new();
        let mut tracker = OringDurationTracker::new(config(Vec::new()));
        let key = what_key("a");
        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_stop(&key, 15 * NS_PER_SEC, false);

        let threshold = Some(UploadThreshold::GtInt(10 * NS_PER_SEC));
        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &threshold, &mut output);
        assert!(output.is_empty());
    }

    #[test]
    fn test_max_duration_takes_longest_interval() {
        let stats = EngineStats::new();
        let mut tracker = MaxDurationTracker::new(config(Vec::new()));
        let key_a = what_key("a");
        let key_b = what_key("b");

        tracker.note_start(&key_a, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_start(&key_b, true, 15 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_stop(&key_a, 40 * NS_PER_SEC, false); // 30s
        tracker.note_stop(&key_b, 35 * NS_PER_SEC, false); // 20s

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 30 * NS_PER_SEC);
    }

    #[test]
    fn test_max_duration_monotone_under_shorter_intervals() {
        let stats = EngineStats::new();
        let mut tracker = MaxDurationTracker::new(config(Vec::new()));
        let key_a = what_key("a");
        let key_b = what_key("b");

        tracker.note_start(&key_a, true, 0, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_stop(&key_a, 30 * NS_PER_SEC, false);
        // A shorter interval must not reduce the reported max.
        tracker.note_start(&key_b, true, 40 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.note_stop(&key_b, 45 * NS_PER_SEC, false);

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 30 * NS_PER_SEC);
    }

    #[test]
    fn test_max_duration_pause_excludes_gap() {
        let stats = EngineStats::new();
        let mut tracker = MaxDurationTracker::new(config(Vec::new()));
        let key = what_key("a");

        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        tracker.on_condition_changed(false, 20 * NS_PER_SEC);
        tracker.on_condition_changed(true, 30 * NS_PER_SEC);
        tracker.note_stop(&key, 50 * NS_PER_SEC, false);

        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        // 10s before the pause + 20s after.
        assert_eq!(total_duration(&output), 30 * NS_PER_SEC);
    }

    #[test]
    fn test_max_duration_running_interval_spans_buckets() {
        let stats = EngineStats::new();
        let mut tracker = MaxDurationTracker::new(config(Vec::new()));
        let key = what_key("a");

        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);

        // Bucket closes while the interval runs: nothing reported yet.
        let mut output = DurationBucketOutput::default();
        let finished = tracker.flush_if_needed(BUCKET_SIZE_NS + 1, &None, &mut output);
        assert!(!finished);
        assert!(output.is_empty());

        // The whole 100s land in the bucket where the interval stops.
        tracker.note_stop(&key, 110 * NS_PER_SEC, false);
        let mut output = DurationBucketOutput::default();
        tracker.flush_if_needed(2 * BUCKET_SIZE_NS + 1, &None, &mut output);
        assert_eq!(total_duration(&output), 100 * NS_PER_SEC);
    }

    #[test]
    fn test_oring_predict_anomaly_timestamp_within_bucket() {
        use crate::core::config::Alert;
        use crate::subscriber::NoopDispatcher;

        let alert = Alert {
            id: 1,
            metric_id: 1,
            num_buckets: 2,
            refractory_period_secs: 0,
            trigger_if_sum_gt: 40 * NS_PER_SEC,
            probability_of_informing: 1.1,
        };
        let anomaly = Arc::new(Mutex::new(AnomalyTracker::new(
            alert,
            ConfigKey::new(0, 1),
            Arc::new(EngineStats::new()),
            Arc::new(NoopDispatcher),
            None,
        )));
        let stats = EngineStats::new();
        let mut tracker = OringDurationTracker::new(config(vec![Arc::clone(&anomaly)]));
        let key = what_key("a");

        tracker.note_start(&key, true, 10 * NS_PER_SEC, ConditionKey::default(), HARD_LIMIT, &stats);
        // Nothing accrued yet: threshold is 40s away from the start.
        let predicted =
            tracker.predict_anomaly_timestamp_ns(&anomaly.lock(), 10 * NS_PER_SEC);
        assert_eq!(predicted, 50 * NS_PER_SEC);
    }

    #[test]
    fn test_guardrail_stops_new_keys() {
        let stats = EngineStats::new();
        let mut cfg = config(Vec::new());
        cfg.condition_sliced = true;
        cfg.condition_index = Some(0);
        let mut tracker = OringDurationTracker::new(cfg);

        let hard_limit = EngineStats::DIMENSION_KEY_SIZE_SOFT_LIMIT;
        for i in 0..hard_limit {
            tracker.note_start(
                &what_key(&format!("k{}", i)),
                true,
                0,
                ConditionKey::default(),
                hard_limit,
                &stats,
            );
        }
        assert_eq!(tracker.started.len(), hard_limit);

        // One past the hard limit: the key is dropped entirely.
        tracker.note_start(
            &what_key("one-too-many"),
            true,
            0,
            ConditionKey::default(),
            hard_limit,
            &stats,
        );
        assert_eq!(tracker.started.len(), hard_limit);
        assert_eq!(stats.hard_limit_hits(1), 1);
    }
}
