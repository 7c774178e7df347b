//! Duration metric: drives duration trackers from predicate start/stop
//! matcher firings.

use super::duration::{DurationBucketOutput, DurationTracker, DurationTrackerConfig, MaxDurationTracker, OringDurationTracker};
use super::{ProducerBase, ProducerBaseConfig, ProducerContext};
use crate::anomaly::AnomalyTracker;
use crate::core::config::DurationAggregation;
use crate::core::types::{BucketDropReason, ConditionState};
use crate::event::field::FieldMask;
use crate::event::{filter_values, FieldValue, LogEvent, MetricDimensionKey};
use crate::report::{DimensionData, DurationBucketData, MetricReport, MetricReportData};
use crate::stats::EngineStats;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct DurationMetricProducer {
    base: ProducerBase,
    aggregation: DurationAggregation,
    /// Matcher arena indices of the observed predicate's machines.
    start_index: usize,
    stop_index: Option<usize>,
    stop_all_index: Option<usize>,
    nested: bool,
    /// The predicate's own dimensions; keys handed to `note_start`.
    internal_dimensions: Vec<FieldMask>,
    trackers: AHashMap<MetricDimensionKey, DurationTracker>,
    past_buckets: DurationBucketOutput,
    anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
}

pub(crate) struct DurationMetricArgs {
    pub aggregation: DurationAggregation,
    pub start_index: usize,
    pub stop_index: Option<usize>,
    pub stop_all_index: Option<usize>,
    pub nested: bool,
    pub internal_dimensions: Vec<FieldMask>,
    pub anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
}

impl DurationMetricProducer {
    pub(crate) fn new(config: ProducerBaseConfig, args: DurationMetricArgs) -> Self {
        Self {
            base: ProducerBase::new(config),
            aggregation: args.aggregation,
            start_index: args.start_index,
            stop_index: args.stop_index,
            stop_all_index: args.stop_all_index,
            nested: args.nested,
            internal_dimensions: args.internal_dimensions,
            trackers: AHashMap::new(),
            past_buckets: DurationBucketOutput::default(),
            anomaly_trackers: args.anomaly_trackers,
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

    /// Matcher indices this metric reacts to.
    pub fn interested_matchers(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.start_index)
            .chain(self.stop_index)
            .chain(self.stop_all_index)
    }

    /// Rebinds matcher arena indices after a config update preserved this
    /// producer.
    pub(crate) fn set_matcher_indices(
        &mut self,
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
    ) {
        self.start_index = start_index;
        self.stop_index = stop_index;
        self.stop_all_index = stop_all_index;
    }

    fn tracker_config(&self, event_key: MetricDimensionKey) -> DurationTrackerConfig {
        DurationTrackerConfig {
            config_key: self.base.config_key,
            tracker_id: self.base.metric_id,
            event_key,
            condition_index: self.base.condition_index,
            nested: self.nested,
            current_bucket_start_ns: self.base.current_bucket_start_ns,
            current_bucket_num: self.base.current_bucket_num,
            start_time_ns: self.base.time_base_ns,
            bucket_size_ns: self.base.bucket_size_ns,
            condition_sliced: self.base.condition_sliced,
            full_condition_links: true,
            anomaly_trackers: self.anomaly_trackers.clone(),
        }
    }

    fn new_tracker(&self, event_key: MetricDimensionKey) -> DurationTracker {
        let config = self.tracker_config(event_key);
        match self.aggregation {
            DurationAggregation::Or => DurationTracker::Oring(OringDurationTracker::new(config)),
            DurationAggregation::Max => DurationTracker::Max(MaxDurationTracker::new(config)),
        }
    }

    pub fn on_matched_log_event(
        &mut self,
        matcher_index: usize,
        event: &LogEvent,
        ctx: &ProducerContext<'_>,
    ) {
        let event_time_ns = event.elapsed_timestamp_ns();
        self.flush_if_needed(event_time_ns);

        if Some(matcher_index) == self.stop_all_index {
            for tracker in self.trackers.values_mut() {
                tracker.note_stop_all(event_time_ns);
            }
            return;
        }

        let what_key = MetricDimensionKey::new(
            self.base.dimension_in_what(event),
            self.base.state_values_key.clone(),
        );
        let internal_key = filter_values(&self.internal_dimensions, event.values());

        if matcher_index == self.start_index {
            let condition_key = self.base.condition_key_for(event);
            let condition = match self.base.condition_index {
                None => true,
                Some(index) if self.base.condition_sliced => {
                    ctx.wizard.query(index, &condition_key, false) == ConditionState::True
                }
                Some(_) => self.base.condition_met(),
            };
            if !self.trackers.contains_key(&what_key) {
                let tracker = self.new_tracker(what_key.clone());
                self.trackers.insert(what_key.clone(), tracker);
            }
            if let Some(tracker) = self.trackers.get_mut(&what_key) {
                tracker.note_start(
                    &internal_key,
                    condition,
                    event_time_ns,
                    condition_key,
                    EngineStats::DIMENSION_KEY_SIZE_HARD_LIMIT,
                    ctx.stats,
                );
            }
        } else if Some(matcher_index) == self.stop_index {
            if let Some(tracker) = self.trackers.get_mut(&what_key) {
                tracker.note_stop(&internal_key, event_time_ns, false);
            }
        }
    }

    pub fn on_condition_changed(
        &mut self,
        condition: ConditionState,
        timestamp_ns: i64,
        ctx: &ProducerContext<'_>,
    ) {
        self.flush_if_needed(timestamp_ns);
        self.base.condition = condition;
        if self.base.condition_sliced {
            self.on_sliced_condition_may_change(timestamp_ns, ctx);
            return;
        }
        let condition_met = condition == ConditionState::True;
        for tracker in self.trackers.values_mut() {
            tracker.on_condition_changed(condition_met, timestamp_ns);
        }
    }

    pub fn on_sliced_condition_may_change(&mut self, timestamp_ns: i64, ctx: &ProducerContext<'_>) {
        self.flush_if_needed(timestamp_ns);
        for tracker in self.trackers.values_mut() {
            tracker.on_sliced_condition_may_change(&ctx.wizard, timestamp_ns);
        }
    }

    pub fn on_state_changed(&mut self, timestamp_ns: i64, atom_id: i32, new_state: &FieldValue) {
        for tracker in self.trackers.values_mut() {
            tracker.on_state_changed(timestamp_ns, atom_id, new_state);
        }
        self.base.update_state_key(atom_id, new_state);
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) {
        if event_time_ns < self.base.current_bucket_end_ns() {
            return;
        }
        let threshold = self.base.threshold;
        let mut output = std::mem::take(&mut self.past_buckets);
        self.trackers.retain(|_, tracker| {
            !tracker.flush_if_needed(event_time_ns, &threshold, &mut output)
        });
        self.past_buckets = output;
        self.base.advance_buckets(event_time_ns);
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
        self.flush_partial(event_time_ns);
    }

    fn flush_partial(&mut self, event_time_ns: i64) {
        let bucket_start = self.base.current_bucket_start_ns;
        let threshold = self.base.threshold;
        let mut output = std::mem::take(&mut self.past_buckets);
        self.trackers.retain(|_, tracker| {
            !tracker.flush_current_bucket(event_time_ns, &threshold, 0, &mut output)
        });
        self.past_buckets = output;
        self.base.commit_skipped_bucket(bucket_start, event_time_ns);
        self.base.start_partial_bucket(event_time_ns);
    }

    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase_data: bool,
    ) -> MetricReport {
        if include_partial && dump_time_ns > self.base.current_bucket_start_ns {
            if dump_time_ns >= self.base.current_bucket_end_ns() {
                self.flush_if_needed(dump_time_ns);
            } else {
                self.base.note_drop(BucketDropReason::Dump, dump_time_ns);
                self.flush_partial(dump_time_ns);
            }
        }

        let data: Vec<DimensionData<DurationBucketData>> = self
            .past_buckets
            .iter()
            .map(|(dimension, buckets)| DimensionData {
                dimension: dimension.clone(),
                buckets: buckets
                    .iter()
                    .map(|b| DurationBucketData {
                        bucket_start_ns: b.bucket_start_ns,
                        bucket_end_ns: b.bucket_end_ns,
                        duration_ns: b.duration_ns,
                        condition_true_ns: b.condition_true_ns,
                    })
                    .collect(),
            })
            .collect();
        if erase_data {
            self.past_buckets.clear();
        }
        let data = MetricReportData::Duration(data);
        let estimated_data_bytes = data.estimated_bytes();
        MetricReport {
            metric_id: self.base.metric_id,
            data,
            skipped_buckets: self.base.take_skipped_buckets(),
            estimated_data_bytes,
        }
    }
}
