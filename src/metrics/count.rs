//! Count metric: events per bucket, per dimension.

use super::{ConditionTimer, ProducerBase, ProducerBaseConfig, ProducerContext};
use crate::anomaly::{AnomalyTracker, DimToValMap};
use crate::core::types::{BucketDropReason, ConditionState};
use crate::event::{FieldValue, LogEvent, MetricDimensionKey};
use crate::report::{CountBucketData, DimensionData, MetricReport, MetricReportData};
use crate::stats::EngineStats;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

pub struct CountMetricProducer {
    base: ProducerBase,
    current_slice: DimToValMap,
    past_buckets: AHashMap<MetricDimensionKey, Vec<CountBucketData>>,
    condition_timer: ConditionTimer,
    anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
    dimension_hard_limit: usize,
    has_hit_guardrail: bool,
}

impl CountMetricProducer {
    pub(crate) fn new(
        config: ProducerBaseConfig,
        anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
    ) -> Self {
        Self {
            base: ProducerBase::new(config),
            current_slice: DimToValMap::new(),
            past_buckets: AHashMap::new(),
            condition_timer: ConditionTimer::default(),
            anomaly_trackers,
            dimension_hard_limit: EngineStats::DIMENSION_KEY_SIZE_HARD_LIMIT,
            has_hit_guardrail: false,
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.base.metric_id
    }

    pub(crate) fn base_mut(&mut self) -> &mut ProducerBase {
        &mut self.base
    }

    pub fn slice_by_state_atoms(&self) -> &[i32] {
        &self.base.slice_by_state_atoms
    }

    fn hit_guardrail(&mut self, new_key: &MetricDimensionKey, stats: &EngineStats) -> bool {
        if self.current_slice.contains_key(new_key) {
            return false;
        }
        if self.current_slice.len() >= EngineStats::DIMENSION_KEY_SIZE_SOFT_LIMIT {
            let new_count = self.current_slice.len() + 1;
            stats.note_metric_dimension_size(self.base.config_key, self.base.metric_id, new_count);
            if new_count > self.dimension_hard_limit {
                if !self.has_hit_guardrail {
                    warn!(
                        metric_id = self.base.metric_id,
                        key = %new_key,
                        "count metric dropping data over the dimension hard limit"
                    );
                    self.has_hit_guardrail = true;
                }
                stats.note_hard_dimension_limit_reached(self.base.metric_id);
                return true;
            }
        }
        false
    }

    pub fn on_matched_log_event(&mut self, event: &LogEvent, ctx: &ProducerContext<'_>) {
        let event_time_ns = event.elapsed_timestamp_ns();
        if event_time_ns < self.base.current_bucket_start_ns {
            self.base.note_drop(BucketDropReason::EventTooLate, event_time_ns);
            return;
        }
        self.flush_if_needed(event_time_ns);

        if self.base.condition_index.is_some() && !self.base.condition_met() {
            if self.base.condition == ConditionState::Unknown {
                self.base.note_condition_unknown();
            }
            return;
        }

        let key = MetricDimensionKey::new(
            self.base.dimension_in_what(event),
            self.base.state_values_key.clone(),
        );
        if self.hit_guardrail(&key, ctx.stats) {
            return;
        }

        let count = self.current_slice.entry(key.clone()).or_insert(0);
        *count += 1;
        let current = *count;

        for tracker in &self.anomaly_trackers {
            tracker.lock().detect_and_declare_anomaly(
                event_time_ns,
                self.base.current_bucket_num,
                &key,
                current,
            );
        }
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, timestamp_ns: i64) {
        self.flush_if_needed(timestamp_ns);
        self.base.condition = condition;
        self.condition_timer
            .on_condition_changed(condition == ConditionState::True, timestamp_ns);
    }

    pub fn on_state_changed(&mut self, atom_id: i32, new_state: &FieldValue) {
        self.base.update_state_key(atom_id, new_state);
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) {
        if event_time_ns < self.base.current_bucket_end_ns() {
            return;
        }
        let full_bucket_end = self.base.current_bucket_end_ns();
        self.flush_current_bucket(full_bucket_end, true);
        if let Some((_, closed_end, forward)) = self.base.advance_buckets(event_time_ns) {
            if forward > 1 {
                // Whole buckets elapsed with no events at all.
                self.base
                    .note_drop(BucketDropReason::MultipleBucketsSkipped, event_time_ns);
                self.base
                    .commit_skipped_bucket(closed_end, self.base.current_bucket_start_ns);
            }
        }
    }

    pub fn notify_partial_bucket_split(&mut self, event_time_ns: i64) {
        if !self.base.split_bucket_for_app_upgrade {
            return;
        }
        if event_time_ns >= self.base.current_bucket_end_ns() {
            self.flush_if_needed(event_time_ns);
            return;
        }
        self.base.note_drop(BucketDropReason::Upgrade, event_time_ns);
        self.flush_current_bucket(event_time_ns, false);
        self.base.start_partial_bucket(event_time_ns);
    }

    fn flush_current_bucket(&mut self, bucket_end_ns: i64, is_full_bucket: bool) {
        let bucket_start_ns = self.base.current_bucket_start_ns;
        let condition_true_ns = self.condition_timer.new_bucket_start(bucket_end_ns);

        if self.base.take_condition_unknown() && self.current_slice.is_empty() {
            self.base
                .note_drop(BucketDropReason::ConditionUnknown, bucket_end_ns);
        }
        if self.base.bucket_too_small(bucket_end_ns) {
            self.base
                .note_drop(BucketDropReason::BucketTooSmall, bucket_end_ns);
            self.base.commit_skipped_bucket(bucket_start_ns, bucket_end_ns);
            self.current_slice.clear();
            self.has_hit_guardrail = false;
            return;
        }
        self.base.commit_skipped_bucket(bucket_start_ns, bucket_end_ns);

        let counts = Arc::new(std::mem::take(&mut self.current_slice));
        for (key, count) in counts.iter() {
            let passes = match &self.base.threshold {
                Some(threshold) => threshold.passes_int(*count),
                None => true,
            };
            if passes {
                self.past_buckets
                    .entry(key.clone())
                    .or_default()
                    .push(CountBucketData {
                        bucket_start_ns,
                        bucket_end_ns,
                        count: *count,
                        condition_true_ns,
                    });
            }
        }
        if is_full_bucket {
            for tracker in &self.anomaly_trackers {
                tracker
                    .lock()
                    .add_past_bucket(Arc::clone(&counts), self.base.current_bucket_num);
            }
        }
        self.has_hit_guardrail = false;
    }

    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase_data: bool,
    ) -> MetricReport {
        if include_partial && dump_time_ns > self.base.current_bucket_start_ns {
            self.base.note_drop(BucketDropReason::Dump, dump_time_ns);
            if dump_time_ns >= self.base.current_bucket_end_ns() {
                self.flush_if_needed(dump_time_ns);
            } else {
                self.flush_current_bucket(dump_time_ns, false);
                self.base.start_partial_bucket(dump_time_ns);
            }
        }

        let data: Vec<DimensionData<CountBucketData>> = self
            .past_buckets
            .iter()
            .map(|(dimension, buckets)| DimensionData {
                dimension: dimension.clone(),
                buckets: buckets.clone(),
            })
            .collect();
        if erase_data {
            self.past_buckets.clear();
        }
        let data = MetricReportData::Count(data);
        let estimated_data_bytes = data.estimated_bytes();
        MetricReport {
            metric_id: self.base.metric_id,
            data,
            skipped_buckets: self.base.take_skipped_buckets(),
            estimated_data_bytes,
        }
    }
}
