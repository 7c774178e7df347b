//! Value metric: numeric-field aggregation, push- or pull-driven.
//!
//! Pulled sources report monotonically growing totals; the producer diffs
//! consecutive pulls per dimension. A negative diff means the source reset:
//! with `use_absolute_value_on_reset` the new absolute value is taken,
//! otherwise the interval is dropped.

use super::{ConditionTimer, ProducerBase, ProducerBaseConfig, ProducerContext};
use crate::core::config::ValueAggregation;
use crate::core::types::{BucketDropReason, ConditionState};
use crate::event::field::FieldMask;
use crate::event::{FieldValue, LogEvent, MetricDimensionKey};
use crate::puller::{PullStatus, Puller};
use crate::report::{DimensionData, MetricReport, MetricReportData, ValueBucketData};
use crate::stats::EngineStats;
use ahash::AHashMap;
use std::sync::Arc;
use tracing::warn;

const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Default, Clone, Copy)]
struct ValueAccumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl ValueAccumulator {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn aggregate(&self, aggregation: ValueAggregation) -> f64 {
        match aggregation {
            ValueAggregation::Sum => self.sum,
            ValueAggregation::Min => self.min,
            ValueAggregation::Max => self.max,
        }
    }
}

pub struct ValueMetricProducer {
    base: ProducerBase,
    value_matchers: Vec<FieldMask>,
    aggregation: ValueAggregation,
    puller: Option<Arc<dyn Puller>>,
    pulled_atom_id: i32,
    use_absolute_value_on_reset: bool,
    max_pull_delay_sec: i64,
    current: AHashMap<MetricDimensionKey, ValueAccumulator>,
    /// Last absolute values per dimension, for pull diffing.
    last_pulled: AHashMap<MetricDimensionKey, f64>,
    past_buckets: AHashMap<MetricDimensionKey, Vec<ValueBucketData>>,
    condition_timer: ConditionTimer,
    dimension_hard_limit: usize,
    has_hit_guardrail: bool,
    /// Pulls happen outside event dispatch, so the producer keeps its own
    /// stats handle instead of relying on the per-call context.
    stats: Arc<EngineStats>,
}

pub(crate) struct ValueMetricArgs {
    pub value_matchers: Vec<FieldMask>,
    pub aggregation: ValueAggregation,
    pub puller: Option<Arc<dyn Puller>>,
    pub pulled_atom_id: i32,
    pub use_absolute_value_on_reset: bool,
    pub max_pull_delay_sec: i64,
    pub stats: Arc<EngineStats>,
}

impl ValueMetricProducer {
    pub(crate) fn new(config: ProducerBaseConfig, args: ValueMetricArgs) -> Self {
        Self {
            base: ProducerBase::new(config),
            value_matchers: args.value_matchers,
            aggregation: args.aggregation,
            puller: args.puller,
            pulled_atom_id: args.pulled_atom_id,
            use_absolute_value_on_reset: args.use_absolute_value_on_reset,
            max_pull_delay_sec: args.max_pull_delay_sec,
            current: AHashMap::new(),
            last_pulled: AHashMap::new(),
            past_buckets: AHashMap::new(),
            condition_timer: ConditionTimer::default(),
            dimension_hard_limit: EngineStats::DIMENSION_KEY_SIZE_HARD_LIMIT,
            has_hit_guardrail: false,
            stats: args.stats,
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

    pub fn is_pulled(&self) -> bool {
        self.puller.is_some()
    }

    fn hit_guardrail(&mut self, new_key: &MetricDimensionKey, stats: &EngineStats) -> bool {
        if self.current.contains_key(new_key) {
            return false;
        }
        if self.current.len() >= EngineStats::DIMENSION_KEY_SIZE_SOFT_LIMIT {
            let new_count = self.current.len() + 1;
            stats.note_metric_dimension_size(self.base.config_key, self.base.metric_id, new_count);
            if new_count > self.dimension_hard_limit {
                if !self.has_hit_guardrail {
                    warn!(
                        metric_id = self.base.metric_id,
                        key = %new_key,
                        "value metric dropping data over the dimension hard limit"
                    );
                    self.has_hit_guardrail = true;
                }
                stats.note_hard_dimension_limit_reached(self.base.metric_id);
                return true;
            }
        }
        false
    }

    fn extract_value(&self, event: &LogEvent) -> Option<f64> {
        for matcher in &self.value_matchers {
            for fv in event.values() {
                if fv.field.matches(matcher) {
                    return Some(fv.value.as_double());
                }
            }
        }
        None
    }

    /// Accumulates one event. For pulled sources the stored absolute value
    /// is diffed against the previous pull.
    fn accumulate(&mut self, event: &LogEvent, stats: &EngineStats) {
        let Some(raw) = self.extract_value(event) else {
            return;
        };
        let key = MetricDimensionKey::new(
            self.base.dimension_in_what(event),
            self.base.state_values_key.clone(),
        );
        if self.hit_guardrail(&key, stats) {
            return;
        }

        let value = if self.is_pulled() {
            let previous = self.last_pulled.insert(key.clone(), raw);
            match previous {
                Some(previous) => {
                    let diff = raw - previous;
                    if diff >= 0.0 {
                        diff
                    } else if self.use_absolute_value_on_reset {
                        raw
                    } else {
                        // Source reset with no recovery: skip the interval.
                        return;
                    }
                }
                // First observation just seeds the base.
                None => return,
            }
        } else {
            raw
        };

        self.current.entry(key).or_default().add(value);
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
        self.accumulate(event, ctx.stats);
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, timestamp_ns: i64) {
        self.flush_if_needed(timestamp_ns);
        let was_met = self.base.condition_met();
        self.base.condition = condition;
        self.condition_timer
            .on_condition_changed(condition == ConditionState::True, timestamp_ns);
        // A pulled metric samples its source at both condition edges.
        if self.is_pulled() && was_met != self.base.condition_met() {
            self.pull_and_accumulate(timestamp_ns);
        }
    }

    pub fn on_state_changed(&mut self, atom_id: i32, new_state: &FieldValue) {
        self.base.update_state_key(atom_id, new_state);
    }

    /// Pulls the source and folds the result into the current bucket.
    fn pull_and_accumulate(&mut self, trigger_time_ns: i64) {
        let Some(puller) = self.puller.clone() else {
            return;
        };
        let result = puller.pull(self.pulled_atom_id);
        match result.status {
            PullStatus::Success => {}
            PullStatus::Timeout | PullStatus::Error => {
                warn!(
                    atom_id = self.pulled_atom_id,
                    metric_id = self.base.metric_id,
                    "pull failed"
                );
                self.base.note_drop(BucketDropReason::PullFailed, trigger_time_ns);
                return;
            }
        }
        if self.max_pull_delay_sec > 0
            && result.elapsed_pulled_ns - trigger_time_ns > self.max_pull_delay_sec * NS_PER_SEC
        {
            self.base
                .note_drop(BucketDropReason::PullDelayTooHigh, trigger_time_ns);
            return;
        }
        if result.events.is_empty() {
            self.base.note_drop(BucketDropReason::NoData, trigger_time_ns);
            return;
        }
        // Pulls bypass the condition gate: the caller already decided this
        // instant matters.
        let stats = Arc::clone(&self.stats);
        for event in &result.events {
            self.accumulate(event, &stats);
        }
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) {
        if event_time_ns < self.base.current_bucket_end_ns() {
            return;
        }
        let full_bucket_end = self.base.current_bucket_end_ns();
        if self.is_pulled() {
            self.pull_and_accumulate(full_bucket_end);
        }
        self.flush_current_bucket(full_bucket_end);
        if let Some((_, closed_end, forward)) = self.base.advance_buckets(event_time_ns) {
            if forward > 1 {
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
        if self.is_pulled() {
            self.pull_and_accumulate(event_time_ns);
        }
        self.flush_current_bucket(event_time_ns);
        self.base.start_partial_bucket(event_time_ns);
    }

    fn flush_current_bucket(&mut self, bucket_end_ns: i64) {
        let bucket_start_ns = self.base.current_bucket_start_ns;
        let condition_true_ns = self.condition_timer.new_bucket_start(bucket_end_ns);

        if self.base.take_condition_unknown() && self.current.is_empty() {
            self.base
                .note_drop(BucketDropReason::ConditionUnknown, bucket_end_ns);
        }
        if self.base.bucket_too_small(bucket_end_ns) {
            self.base
                .note_drop(BucketDropReason::BucketTooSmall, bucket_end_ns);
            self.base.commit_skipped_bucket(bucket_start_ns, bucket_end_ns);
            self.current.clear();
            self.has_hit_guardrail = false;
            return;
        }
        self.base.commit_skipped_bucket(bucket_start_ns, bucket_end_ns);

        for (key, accumulator) in self.current.drain() {
            let value = accumulator.aggregate(self.aggregation);
            let passes = match &self.base.threshold {
                Some(threshold) => threshold.passes_float(value),
                None => true,
            };
            if passes {
                self.past_buckets
                    .entry(key)
                    .or_default()
                    .push(ValueBucketData {
                        bucket_start_ns,
                        bucket_end_ns,
                        value,
                        condition_true_ns,
                    });
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
                if self.is_pulled() {
                    self.pull_and_accumulate(dump_time_ns);
                }
                self.flush_current_bucket(dump_time_ns);
                self.base.start_partial_bucket(dump_time_ns);
            }
        }

        let data: Vec<DimensionData<ValueBucketData>> = self
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
        let data = MetricReportData::Value(data);
        let estimated_data_bytes = data.estimated_bytes();
        MetricReport {
            metric_id: self.base.metric_id,
            data,
            skipped_buckets: self.base.take_skipped_buckets(),
            estimated_data_bytes,
        }
    }
}
