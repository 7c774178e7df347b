//! Anomaly detection over past metric buckets.
//!
//! Each alert keeps a ring of the last `num_buckets - 1` per-dimension
//! bucket values together with an incrementally maintained sum, so that
//! detection is a map lookup instead of a window scan. Between any two
//! operations the sum invariant holds: the stored sum for a key equals the
//! sum of that key's values across all retained buckets.

pub mod alarm;

use crate::core::config::{Alert, Subscription};
use crate::core::error::InvalidConfigReason;
use crate::core::types::ConfigKey;
use crate::event::MetricDimensionKey;
use crate::stats::EngineStats;
use crate::subscriber::{should_inform, trigger_subscribers, SubscriberDispatcher};
use ahash::AHashMap;
use alarm::{AlarmMonitor, InternalAlarm, NS_PER_SEC};
use std::collections::HashSet;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-bucket dimension -> value map.
pub type DimToValMap = AHashMap<MetricDimensionKey, i64>;

/// Refractory ends per dimension, exported as wall-clock seconds so they
/// survive a restart, and reloaded against the new elapsed clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMetadata {
    pub alert_id: i64,
    /// `(dimension, refractory_end_wall_clock_sec)` pairs.
    pub refractory_ends: Vec<(MetricDimensionKey, i64)>,
}

/// Sliding-window sum detector with refractory suppression.
pub struct AnomalyTracker {
    alert: Alert,
    config_key: ConfigKey,
    /// Window size excluding the current bucket.
    num_past_buckets: usize,
    past_buckets: Vec<Option<Arc<DimToValMap>>>,
    sum_over_past_buckets: DimToValMap,
    most_recent_bucket_num: i64,
    refractory_period_ends_sec: AHashMap<MetricDimensionKey, i64>,
    subscriptions: Vec<Subscription>,
    /// Armed prediction alarms per dimension (duration metrics only).
    alarms: AHashMap<MetricDimensionKey, InternalAlarm>,
    stats: Arc<EngineStats>,
    dispatcher: Arc<dyn SubscriberDispatcher>,
    alarm_monitor: Option<Arc<AlarmMonitor>>,
}

impl AnomalyTracker {
    pub fn new(
        alert: Alert,
        config_key: ConfigKey,
        stats: Arc<EngineStats>,
        dispatcher: Arc<dyn SubscriberDispatcher>,
        alarm_monitor: Option<Arc<AlarmMonitor>>,
    ) -> Self {
        let num_past_buckets = (alert.num_buckets - 1).max(0) as usize;
        let mut tracker = Self {
            alert,
            config_key,
            num_past_buckets,
            past_buckets: Vec::new(),
            sum_over_past_buckets: DimToValMap::new(),
            most_recent_bucket_num: -1,
            refractory_period_ends_sec: AHashMap::new(),
            subscriptions: Vec::new(),
            alarms: AHashMap::new(),
            stats,
            dispatcher,
            alarm_monitor,
        };
        tracker.reset_storage();
        tracker
    }

    /// Stable content hash of an alert, used to preserve tracker instances
    /// across config updates. A serialization failure fails the install.
    pub fn proto_hash(alert: &Alert) -> Result<u64, InvalidConfigReason> {
        let serialized = serde_json::to_string(alert)
            .map_err(|_| InvalidConfigReason::AlertSerializationFailed(alert.id, alert.metric_id))?;
        let mut hasher = ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher();
        hasher.write(serialized.as_bytes());
        Ok(hasher.finish())
    }

    pub fn alert(&self) -> &Alert {
        &self.alert
    }

    pub fn alert_id(&self) -> i64 {
        self.alert.id
    }

    pub fn anomaly_threshold(&self) -> i64 {
        self.alert.trigger_if_sum_gt
    }

    pub fn num_past_buckets(&self) -> usize {
        self.num_past_buckets
    }

    pub fn most_recent_bucket_num(&self) -> i64 {
        self.most_recent_bucket_num
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Subscriptions are rebound after a config update.
    pub fn on_config_updated(&mut self) {
        self.subscriptions.clear();
    }

    /// Carries window and refractory state over from the previous
    /// generation of this alert during a config update.
    pub fn adopt_state(&mut self, old: &mut AnomalyTracker) {
        self.past_buckets = std::mem::take(&mut old.past_buckets);
        self.sum_over_past_buckets = std::mem::take(&mut old.sum_over_past_buckets);
        self.most_recent_bucket_num = old.most_recent_bucket_num;
        self.refractory_period_ends_sec = std::mem::take(&mut old.refractory_period_ends_sec);
        self.alarms = std::mem::take(&mut old.alarms);
    }

    fn reset_storage(&mut self) {
        self.past_buckets.clear();
        self.past_buckets.resize(self.num_past_buckets, None);
        self.sum_over_past_buckets.clear();
    }

    fn index(&self, bucket_num: i64) -> usize {
        (bucket_num % self.num_past_buckets as i64) as usize
    }

    /// Scrolls the window forward, subtracting buckets that fall off; a
    /// jump past the whole window resets storage.
    pub fn advance_most_recent_bucket_to(&mut self, bucket_num: i64) {
        if self.num_past_buckets == 0 {
            return;
        }
        if bucket_num <= self.most_recent_bucket_num {
            warn!(
                bucket_num,
                most_recent = self.most_recent_bucket_num,
                "cannot advance buckets backwards"
            );
            return;
        }
        if bucket_num >= self.most_recent_bucket_num + self.num_past_buckets as i64 {
            self.reset_storage();
            self.most_recent_bucket_num = bucket_num;
            return;
        }

        for i in (self.most_recent_bucket_num + 1)..=bucket_num {
            let idx = self.index(i);
            if let Some(bucket) = self.past_buckets[idx].take() {
                self.subtract_bucket_from_sum(&bucket);
            }
        }
        self.most_recent_bucket_num = bucket_num;
    }

    /// Inserts or overwrites one key's value in a past bucket.
    pub fn add_past_bucket_value(
        &mut self,
        key: &MetricDimensionKey,
        bucket_value: i64,
        bucket_num: i64,
    ) {
        if self.num_past_buckets == 0
            || bucket_num < 0
            || bucket_num <= self.most_recent_bucket_num - self.num_past_buckets as i64
        {
            return;
        }

        let idx = self.index(bucket_num);
        if bucket_num <= self.most_recent_bucket_num && self.past_buckets[idx].is_some() {
            let previous = {
                let bucket = Arc::make_mut(self.past_buckets[idx].as_mut().unwrap());
                match bucket.get_mut(key) {
                    Some(old) => {
                        let previous = *old;
                        *old = bucket_value;
                        Some(previous)
                    }
                    None => {
                        bucket.insert(key.clone(), bucket_value);
                        None
                    }
                }
            };
            if let Some(previous) = previous {
                self.subtract_value_from_sum(key, previous);
            }
            *self.sum_over_past_buckets.entry(key.clone()).or_insert(0) += bucket_value;
        } else {
            let mut bucket = DimToValMap::new();
            bucket.insert(key.clone(), bucket_value);
            self.add_past_bucket(Arc::new(bucket), bucket_num);
        }
    }

    /// Installs (or replaces) a whole past bucket.
    pub fn add_past_bucket(&mut self, bucket: Arc<DimToValMap>, bucket_num: i64) {
        if self.num_past_buckets == 0
            || bucket_num < 0
            || bucket_num <= self.most_recent_bucket_num - self.num_past_buckets as i64
        {
            return;
        }

        if bucket_num <= self.most_recent_bucket_num {
            let idx = self.index(bucket_num);
            if let Some(old) = self.past_buckets[idx].take() {
                self.subtract_bucket_from_sum(&old);
            }
        } else {
            self.advance_most_recent_bucket_to(bucket_num);
        }
        let idx = self.index(bucket_num);
        self.add_bucket_to_sum(&bucket);
        self.past_buckets[idx] = Some(bucket);
    }

    fn subtract_bucket_from_sum(&mut self, bucket: &DimToValMap) {
        for (key, value) in bucket {
            self.subtract_value_from_sum(key, *value);
        }
    }

    fn subtract_value_from_sum(&mut self, key: &MetricDimensionKey, value: i64) {
        if let Some(sum) = self.sum_over_past_buckets.get_mut(key) {
            *sum -= value;
            if *sum == 0 {
                self.sum_over_past_buckets.remove(key);
            }
        }
    }

    fn add_bucket_to_sum(&mut self, bucket: &DimToValMap) {
        for (key, value) in bucket {
            *self.sum_over_past_buckets.entry(key.clone()).or_insert(0) += value;
        }
    }

    pub fn get_past_bucket_value(&self, key: &MetricDimensionKey, bucket_num: i64) -> i64 {
        if self.num_past_buckets == 0
            || bucket_num < 0
            || self.most_recent_bucket_num < 0
            || bucket_num <= self.most_recent_bucket_num - self.num_past_buckets as i64
            || bucket_num > self.most_recent_bucket_num
        {
            return 0;
        }
        match &self.past_buckets[self.index(bucket_num)] {
            Some(bucket) => bucket.get(key).copied().unwrap_or(0),
            None => 0,
        }
    }

    pub fn get_sum_over_past_buckets(&self, key: &MetricDimensionKey) -> i64 {
        self.sum_over_past_buckets.get(key).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn sum_entry_count(&self) -> usize {
        self.sum_over_past_buckets.len()
    }

    /// Whether the window sum plus the current bucket's value exceeds the
    /// threshold. Advances the window when the current bucket has moved on.
    pub fn detect_anomaly(
        &mut self,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current_bucket_value: i64,
    ) -> bool {
        if current_bucket_num > self.most_recent_bucket_num + 1 {
            self.advance_most_recent_bucket_to(current_bucket_num - 1);
        }
        self.get_sum_over_past_buckets(key) + current_bucket_value > self.alert.trigger_if_sum_gt
    }

    /// Declares an anomaly for a key: refractory suppression first, then
    /// the probability gate, then refractory re-arm and subscriber
    /// notification.
    pub fn declare_anomaly(
        &mut self,
        timestamp_ns: i64,
        key: &MetricDimensionKey,
        metric_value: i64,
    ) {
        if self.is_in_refractory_period(timestamp_ns, key) {
            debug!(alert_id = self.alert.id, "anomaly suppressed by refractory period");
            return;
        }

        if !should_inform(self.alert.probability_of_informing) {
            debug!(
                alert_id = self.alert.id,
                "anomaly dropped by probability gate; refractory untouched"
            );
            return;
        }

        if self.alert.refractory_period_secs > 0 {
            // Round the timestamp up to whole seconds before arming.
            self.refractory_period_ends_sec.insert(
                key.clone(),
                (timestamp_ns + NS_PER_SEC - 1) / NS_PER_SEC + self.alert.refractory_period_secs,
            );
        }

        info!(
            alert_id = self.alert.id,
            metric_id = self.alert.metric_id,
            dimension = %key,
            metric_value,
            "anomaly detected"
        );
        if !self.subscriptions.is_empty() {
            trigger_subscribers(
                self.dispatcher.as_ref(),
                self.alert.id,
                key,
                metric_value,
                self.config_key,
                &self.subscriptions,
            );
        }
        self.stats.note_anomaly_declared(self.config_key, self.alert.id);
    }

    pub fn detect_and_declare_anomaly(
        &mut self,
        timestamp_ns: i64,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current_bucket_value: i64,
    ) {
        if self.detect_anomaly(current_bucket_num, key, current_bucket_value) {
            self.declare_anomaly(timestamp_ns, key, current_bucket_value);
        }
    }

    pub fn is_in_refractory_period(&self, timestamp_ns: i64, key: &MetricDimensionKey) -> bool {
        match self.refractory_period_ends_sec.get(key) {
            Some(ends_sec) => timestamp_ns < ends_sec * NS_PER_SEC,
            None => false,
        }
    }

    pub fn get_refractory_period_ends_sec(&self, key: &MetricDimensionKey) -> i64 {
        self.refractory_period_ends_sec.get(key).copied().unwrap_or(0)
    }

    /// Arms a prediction alarm for a dimension unless it is inside its
    /// refractory period. Alarm seconds round up so an early firing is
    /// never possible.
    pub fn start_alarm(&mut self, key: &MetricDimensionKey, timestamp_ns: i64) {
        if self.is_in_refractory_period(timestamp_ns, key) {
            return;
        }
        let timestamp_sec = (timestamp_ns - 1) / NS_PER_SEC + 1;
        if let Some(monitor) = &self.alarm_monitor {
            let alarm = monitor.add(timestamp_sec);
            self.stats.note_alarm_registered();
            if let Some(previous) = self.alarms.insert(key.clone(), alarm) {
                monitor.remove(&previous);
            }
        }
    }

    /// Disarms a dimension's alarm; an alarm already in the past is
    /// declared on the spot.
    pub fn stop_alarm(&mut self, key: &MetricDimensionKey, timestamp_ns: i64) {
        let Some(alarm) = self.alarms.remove(key) else {
            return;
        };
        if timestamp_ns >= alarm.timestamp_sec * NS_PER_SEC {
            self.declare_anomaly(timestamp_ns, key, self.alert.trigger_if_sum_gt);
        }
        if let Some(monitor) = &self.alarm_monitor {
            monitor.remove(&alarm);
        }
    }

    pub fn cancel_all_alarms(&mut self) {
        if let Some(monitor) = &self.alarm_monitor {
            for alarm in self.alarms.values() {
                monitor.remove(alarm);
            }
        }
        self.alarms.clear();
    }

    /// Declares anomalies for every armed dimension present in the fired
    /// set.
    pub fn inform_alarms_fired(&mut self, timestamp_ns: i64, fired: &mut HashSet<InternalAlarm>) {
        if fired.is_empty() || self.alarms.is_empty() {
            return;
        }
        let matched: Vec<MetricDimensionKey> = self
            .alarms
            .iter()
            .filter(|(_, alarm)| fired.contains(alarm))
            .map(|(key, _)| key.clone())
            .collect();
        for key in matched {
            let alarm = self.alarms.remove(&key).expect("alarm present");
            fired.remove(&alarm);
            self.declare_anomaly(timestamp_ns, &key, self.alert.trigger_if_sum_gt);
        }
    }

    /// Exports unexpired refractory ends as wall-clock seconds.
    pub fn write_metadata(
        &self,
        current_wall_clock_ns: i64,
        system_elapsed_ns: i64,
    ) -> Option<AlertMetadata> {
        if self.refractory_period_ends_sec.is_empty() {
            return None;
        }
        let mut refractory_ends = Vec::new();
        for (key, ends_sec) in &self.refractory_period_ends_sec {
            if *ends_sec < system_elapsed_ns / NS_PER_SEC {
                continue;
            }
            let wall_clock_sec =
                current_wall_clock_ns / NS_PER_SEC + (ends_sec - system_elapsed_ns / NS_PER_SEC);
            refractory_ends.push((key.clone(), wall_clock_sec));
        }
        if refractory_ends.is_empty() {
            return None;
        }
        Some(AlertMetadata {
            alert_id: self.alert.id,
            refractory_ends,
        })
    }

    /// Reloads refractory ends, translating wall-clock seconds back to the
    /// current elapsed clock. Already-expired entries are skipped.
    pub fn load_metadata(
        &mut self,
        metadata: &AlertMetadata,
        current_wall_clock_ns: i64,
        system_elapsed_ns: i64,
    ) {
        for (key, wall_clock_sec) in &metadata.refractory_ends {
            if *wall_clock_sec < current_wall_clock_ns / NS_PER_SEC {
                continue;
            }
            let elapsed_sec =
                wall_clock_sec - current_wall_clock_ns / NS_PER_SEC + system_elapsed_ns / NS_PER_SEC;
            self.refractory_period_ends_sec.insert(key.clone(), elapsed_sec);
        }
    }
}
