//! Gauge metric: per-bucket snapshots of selected fields.

use super::{ProducerBase, ProducerBaseConfig, ProducerContext};
use crate::core::config::GaugeSampling;
use crate::core::types::{BucketDropReason, ConditionState};
use crate::event::field::FieldMask;
use crate::event::{FieldValue, LogEvent, MetricDimensionKey};
use crate::report::{DimensionData, GaugeBucketData, MetricReport, MetricReportData};
use crate::stats::EngineStats;
use ahash::AHashMap;
use tracing::warn;

pub struct GaugeMetricProducer {
    base: ProducerBase,
    gauge_matchers: Vec<FieldMask>,
    sampling: GaugeSampling,
    max_atoms_per_bucket: usize,
    current: AHashMap<MetricDimensionKey, Vec<LogEvent>>,
    past_buckets: AHashMap<MetricDimensionKey, Vec<GaugeBucketData>>,
    dimension_hard_limit: usize,
    has_hit_guardrail: bool,
}

impl GaugeMetricProducer {
    pub(crate) fn new(
        config: ProducerBaseConfig,
        gauge_matchers: Vec<FieldMask>,
        sampling: GaugeSampling,
        max_atoms_per_bucket: usize,
    ) -> Self {
        Self {
            base: ProducerBase::new(config),
            gauge_matchers,
            sampling,
            max_atoms_per_bucket,
            current: AHashMap::new(),
            past_buckets: AHashMap::new(),
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
                        "gauge metric dropping data over the dimension hard limit"
                    );
                    self.has_hit_guardrail = true;
                }
                stats.note_hard_dimension_limit_reached(self.base.metric_id);
                return true;
            }
        }
        false
    }

    /// Strips the event down to the configured gauge fields.
    fn snapshot(&self, event: &LogEvent) -> LogEvent {
        if self.gauge_matchers.is_empty() {
            return event.clone();
        }
        let mut snapshot = LogEvent::new(event.tag(), event.elapsed_timestamp_ns());
        for matcher in &self.gauge_matchers {
            for fv in event.values() {
                if fv.field.matches(matcher) {
                    snapshot.push_value(fv.clone());
                }
            }
        }
        snapshot
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

        let snapshot = self.snapshot(event);
        let atoms = self.current.entry(key).or_default();
        match self.sampling {
            GaugeSampling::FirstPerBucket => {
                if atoms.is_empty() {
                    atoms.push(snapshot);
                }
            }
            GaugeSampling::AllPerBucket => {
                if atoms.len() < self.max_atoms_per_bucket {
                    atoms.push(snapshot);
                }
            }
        }
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, timestamp_ns: i64) {
        self.flush_if_needed(timestamp_ns);
        self.base.condition = condition;
    }

    pub fn on_state_changed(&mut self, atom_id: i32, new_state: &FieldValue) {
        self.base.update_state_key(atom_id, new_state);
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) {
        if event_time_ns < self.base.current_bucket_end_ns() {
            return;
        }
        let full_bucket_end = self.base.current_bucket_end_ns();
        self.flush_current_bucket(full_bucket_end);
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
        self.flush_current_bucket(event_time_ns);
        self.base.start_partial_bucket(event_time_ns);
    }

    fn flush_current_bucket(&mut self, bucket_end_ns: i64) {
        let bucket_start_ns = self.base.current_bucket_start_ns;
        if self.base.take_condition_unknown() && self.current.is_empty() {
            self.base
                .note_drop(BucketDropReason::ConditionUnknown, bucket_end_ns);
        }
        self.base.commit_skipped_bucket(bucket_start_ns, bucket_end_ns);

        for (key, atoms) in self.current.drain() {
            if atoms.is_empty() {
                continue;
            }
            self.past_buckets
                .entry(key)
                .or_default()
                .push(GaugeBucketData {
                    bucket_start_ns,
                    bucket_end_ns,
                    atoms,
                });
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
                self.flush_current_bucket(dump_time_ns);
                self.base.start_partial_bucket(dump_time_ns);
            }
        }

        let data: Vec<DimensionData<GaugeBucketData>> = self
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
        let data = MetricReportData::Gauge(data);
        let estimated_data_bytes = data.estimated_bytes();
        MetricReport {
            metric_id: self.base.metric_id,
            data,
            skipped_buckets: self.base.take_skipped_buckets(),
            estimated_data_bytes,
        }
    }
}
