//! Metric producers.
//!
//! A producer owns one metric's buckets: it receives matched events from
//! the pipeline, gates them on its condition, projects dimensions, and
//! rolls buckets forward at boundaries. Partial buckets arise at app
//! upgrade, boot complete, or an explicit dump when the metric is
//! configured to split; everything else extends the current bucket.

pub mod count;
pub mod duration;
pub mod duration_metric;
pub mod event;
pub mod gauge;
pub mod value;

use crate::condition::{ConditionKey, ConditionWizard};
use crate::core::config::UploadThreshold;
use crate::core::types::{
    BucketDropReason, ConditionState, ConfigKey, DataCorruptionReason, DataCorruptionSeverity,
};
use crate::event::field::FieldMask;
use crate::event::{filter_values, FieldValue, HashableDimensionKey, LogEvent};
use crate::report::{DropEvent, MetricReport, SkippedBucket};
use crate::stats::EngineStats;

pub use count::CountMetricProducer;
pub use duration_metric::DurationMetricProducer;
pub use event::EventMetricProducer;
pub use gauge::GaugeMetricProducer;
pub use value::ValueMetricProducer;

/// Shared context handed into producer calls.
pub struct ProducerContext<'a> {
    pub wizard: ConditionWizard<'a>,
    pub stats: &'a EngineStats,
}

/// Tracks how long the condition held true within each bucket.
#[derive(Debug, Default)]
pub(crate) struct ConditionTimer {
    condition: bool,
    last_true_ns: i64,
    accumulated_ns: i64,
}

impl ConditionTimer {
    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        if condition == self.condition {
            return;
        }
        if condition {
            self.last_true_ns = timestamp_ns;
        } else {
            self.accumulated_ns += timestamp_ns - self.last_true_ns;
        }
        self.condition = condition;
    }

    /// Closes the bucket at `bucket_end_ns` and returns its condition-true
    /// time; a still-true condition carries into the next bucket.
    pub fn new_bucket_start(&mut self, bucket_end_ns: i64) -> i64 {
        if self.condition {
            self.accumulated_ns += bucket_end_ns - self.last_true_ns;
            self.last_true_ns = bucket_end_ns;
        }
        std::mem::take(&mut self.accumulated_ns)
    }
}

/// State common to every producer kind.
pub(crate) struct ProducerBase {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    /// Origin of the bucket sequence.
    pub time_base_ns: i64,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,
    pub bucket_size_ns: i64,
    pub condition_index: Option<usize>,
    pub condition: ConditionState,
    pub condition_sliced: bool,
    /// Condition id and output dimensions, for building wizard query keys.
    pub condition_id: i64,
    pub condition_dimensions: Vec<FieldMask>,
    pub dimensions_in_what: Vec<FieldMask>,
    pub slice_by_state_atoms: Vec<i32>,
    pub state_values_key: HashableDimensionKey,
    pub split_bucket_for_app_upgrade: bool,
    pub threshold: Option<UploadThreshold>,
    pub min_bucket_size_ns: i64,
    skipped_buckets: Vec<SkippedBucket>,
    current_drop_events: Vec<DropEvent>,
    condition_unknown_in_bucket: bool,
    socket_loss_severity: DataCorruptionSeverity,
    queue_overflow_severity: DataCorruptionSeverity,
}

pub(crate) struct ProducerBaseConfig {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub condition_index: Option<usize>,
    pub condition_sliced: bool,
    pub condition_id: i64,
    pub condition_dimensions: Vec<FieldMask>,
    pub dimensions_in_what: Vec<FieldMask>,
    pub slice_by_state_atoms: Vec<i32>,
    pub state_values_key: HashableDimensionKey,
    pub split_bucket_for_app_upgrade: bool,
    pub threshold: Option<UploadThreshold>,
    pub min_bucket_size_ns: i64,
}

impl ProducerBase {
    pub fn new(config: ProducerBaseConfig) -> Self {
        let condition = if config.condition_index.is_some() {
            ConditionState::Unknown
        } else {
            ConditionState::True
        };
        Self {
            metric_id: config.metric_id,
            config_key: config.config_key,
            time_base_ns: config.time_base_ns,
            current_bucket_start_ns: config.time_base_ns,
            current_bucket_num: 0,
            bucket_size_ns: config.bucket_size_ns,
            condition_index: config.condition_index,
            condition,
            condition_sliced: config.condition_sliced,
            condition_id: config.condition_id,
            condition_dimensions: config.condition_dimensions,
            dimensions_in_what: config.dimensions_in_what,
            slice_by_state_atoms: config.slice_by_state_atoms,
            state_values_key: config.state_values_key,
            split_bucket_for_app_upgrade: config.split_bucket_for_app_upgrade,
            threshold: config.threshold,
            min_bucket_size_ns: config.min_bucket_size_ns,
            skipped_buckets: Vec::new(),
            current_drop_events: Vec::new(),
            condition_unknown_in_bucket: false,
            socket_loss_severity: DataCorruptionSeverity::None,
            queue_overflow_severity: DataCorruptionSeverity::None,
        }
    }

    pub fn current_bucket_end_ns(&self) -> i64 {
        self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    /// Whether the condition currently admits data.
    pub fn condition_met(&self) -> bool {
        self.condition == ConditionState::True
    }

    /// Records that an event arrived while the condition was unknown; the
    /// bucket is marked skipped if it ends without data.
    pub fn note_condition_unknown(&mut self) {
        self.condition_unknown_in_bucket = true;
    }

    pub fn take_condition_unknown(&mut self) -> bool {
        std::mem::take(&mut self.condition_unknown_in_bucket)
    }

    /// The what-dimension projection of an event.
    pub fn dimension_in_what(&self, event: &LogEvent) -> HashableDimensionKey {
        filter_values(&self.dimensions_in_what, event.values())
    }

    /// The condition links for an event: the condition's own output
    /// dimensions projected from this event.
    pub fn condition_key_for(&self, event: &LogEvent) -> ConditionKey {
        let mut key = ConditionKey::default();
        if self.condition_sliced {
            key.insert(
                self.condition_id,
                filter_values(&self.condition_dimensions, event.values()),
            );
        }
        key
    }

    /// Updates the current state-values key on an exclusive-state change.
    pub fn update_state_key(&mut self, atom_id: i32, new_state: &FieldValue) {
        for value in self.state_values_key.values_mut() {
            if value.field.tag() == atom_id {
                value.value = new_state.value.clone();
            }
        }
    }

    pub fn note_drop(&mut self, reason: BucketDropReason, drop_time_ns: i64) {
        self.current_drop_events.push(DropEvent {
            reason,
            drop_time_ns,
        });
    }

    /// Closes the current window's skipped-bucket record, if any drops were
    /// noted.
    pub fn commit_skipped_bucket(&mut self, bucket_start_ns: i64, bucket_end_ns: i64) {
        if self.current_drop_events.is_empty() {
            return;
        }
        self.skipped_buckets.push(SkippedBucket {
            bucket_start_ns,
            bucket_end_ns,
            drop_events: std::mem::take(&mut self.current_drop_events),
        });
    }

    pub fn take_skipped_buckets(&mut self) -> Vec<SkippedBucket> {
        std::mem::take(&mut self.skipped_buckets)
    }

    /// Whether a closing bucket is too narrow to report.
    pub fn bucket_too_small(&self, bucket_end_ns: i64) -> bool {
        self.min_bucket_size_ns > 0
            && bucket_end_ns - self.current_bucket_start_ns < self.min_bucket_size_ns
    }

    /// Records event loss. `is_condition_input` escalates to unrecoverable,
    /// since prior condition state can no longer be trusted.
    pub fn note_data_corruption(&mut self, reason: DataCorruptionReason, is_condition_input: bool) {
        let severity = if is_condition_input {
            DataCorruptionSeverity::Unrecoverable
        } else {
            DataCorruptionSeverity::ResetOnDump
        };
        match reason {
            DataCorruptionReason::SocketLoss => {
                self.socket_loss_severity = self.socket_loss_severity.escalate(severity);
            }
            DataCorruptionReason::QueueOverflow => {
                self.queue_overflow_severity = self.queue_overflow_severity.escalate(severity);
            }
        }
    }

    /// Reports the active corruption reasons; on dump, `reset_on_dump`
    /// severities clear while unrecoverable ones persist.
    pub fn drain_corruption_reasons(&mut self, clear_resettable: bool) -> Vec<DataCorruptionReason> {
        let mut reasons = Vec::new();
        if self.socket_loss_severity > DataCorruptionSeverity::None {
            reasons.push(DataCorruptionReason::SocketLoss);
        }
        if self.queue_overflow_severity > DataCorruptionSeverity::None {
            reasons.push(DataCorruptionReason::QueueOverflow);
        }
        if clear_resettable {
            if self.socket_loss_severity == DataCorruptionSeverity::ResetOnDump {
                self.socket_loss_severity = DataCorruptionSeverity::None;
            }
            if self.queue_overflow_severity == DataCorruptionSeverity::ResetOnDump {
                self.queue_overflow_severity = DataCorruptionSeverity::None;
            }
        }
        reasons
    }

    /// Advances bucket bookkeeping past `event_time_ns`, returning the
    /// closed bucket's `(start, end, buckets_forward)` when a boundary was
    /// crossed.
    pub fn advance_buckets(&mut self, event_time_ns: i64) -> Option<(i64, i64, i64)> {
        let full_bucket_end = self.current_bucket_end_ns();
        if event_time_ns < full_bucket_end {
            return None;
        }
        let num_forward = 1 + (event_time_ns - full_bucket_end) / self.bucket_size_ns;
        let closed = (self.current_bucket_start_ns, full_bucket_end, num_forward);
        self.current_bucket_num += num_forward;
        self.current_bucket_start_ns = full_bucket_end + (num_forward - 1) * self.bucket_size_ns;
        closed.into()
    }

    /// Resets the bucket start for a partial split (app upgrade, boot
    /// complete, dump) without advancing the bucket number.
    pub fn start_partial_bucket(&mut self, event_time_ns: i64) {
        self.current_bucket_start_ns = event_time_ns;
    }
}

/// One metric producer of any kind.
pub enum MetricProducer {
    Count(CountMetricProducer),
    Duration(DurationMetricProducer),
    Event(EventMetricProducer),
    Value(ValueMetricProducer),
    Gauge(GaugeMetricProducer),
}

impl MetricProducer {
    pub fn metric_id(&self) -> i64 {
        match self {
            MetricProducer::Count(p) => p.metric_id(),
            MetricProducer::Duration(p) => p.metric_id(),
            MetricProducer::Event(p) => p.metric_id(),
            MetricProducer::Value(p) => p.metric_id(),
            MetricProducer::Gauge(p) => p.metric_id(),
        }
    }

    /// Feeds one matched event through the producer. `matcher_index` names
    /// which of the producer's matchers fired (duration metrics listen to
    /// several).
    pub fn on_matched_log_event(
        &mut self,
        matcher_index: usize,
        event: &LogEvent,
        ctx: &ProducerContext<'_>,
    ) {
        match self {
            MetricProducer::Count(p) => p.on_matched_log_event(event, ctx),
            MetricProducer::Duration(p) => p.on_matched_log_event(matcher_index, event, ctx),
            MetricProducer::Event(p) => p.on_matched_log_event(event),
            MetricProducer::Value(p) => p.on_matched_log_event(event, ctx),
            MetricProducer::Gauge(p) => p.on_matched_log_event(event, ctx),
        }
    }

    pub fn on_condition_changed(
        &mut self,
        condition: ConditionState,
        timestamp_ns: i64,
        ctx: &ProducerContext<'_>,
    ) {
        match self {
            MetricProducer::Count(p) => p.on_condition_changed(condition, timestamp_ns),
            MetricProducer::Duration(p) => p.on_condition_changed(condition, timestamp_ns, ctx),
            MetricProducer::Event(p) => p.on_condition_changed(condition, timestamp_ns),
            MetricProducer::Value(p) => p.on_condition_changed(condition, timestamp_ns),
            MetricProducer::Gauge(p) => p.on_condition_changed(condition, timestamp_ns),
        }
    }

    pub fn on_sliced_condition_may_change(&mut self, timestamp_ns: i64, ctx: &ProducerContext<'_>) {
        if let MetricProducer::Duration(p) = self {
            p.on_sliced_condition_may_change(timestamp_ns, ctx);
        }
    }

    pub fn on_state_changed(&mut self, timestamp_ns: i64, atom_id: i32, new_state: &FieldValue) {
        match self {
            MetricProducer::Count(p) => p.on_state_changed(atom_id, new_state),
            MetricProducer::Duration(p) => p.on_state_changed(timestamp_ns, atom_id, new_state),
            MetricProducer::Event(_) => {}
            MetricProducer::Value(p) => p.on_state_changed(atom_id, new_state),
            MetricProducer::Gauge(p) => p.on_state_changed(atom_id, new_state),
        }
    }

    /// Whether this producer observes the given state atom.
    pub fn slices_by_state(&self, atom_id: i32) -> bool {
        let atoms = match self {
            MetricProducer::Count(p) => p.slice_by_state_atoms(),
            MetricProducer::Duration(p) => p.slice_by_state_atoms(),
            MetricProducer::Event(_) => &[],
            MetricProducer::Value(p) => p.slice_by_state_atoms(),
            MetricProducer::Gauge(p) => p.slice_by_state_atoms(),
        };
        atoms.contains(&atom_id)
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) {
        match self {
            MetricProducer::Count(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Duration(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Event(_) => {}
            MetricProducer::Value(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Gauge(p) => p.flush_if_needed(event_time_ns),
        }
    }

    /// Splits the current bucket at an app upgrade or boot-complete event
    /// for producers configured to do so; others extend the bucket.
    pub fn notify_partial_bucket_split(&mut self, event_time_ns: i64) {
        match self {
            MetricProducer::Count(p) => p.notify_partial_bucket_split(event_time_ns),
            MetricProducer::Duration(p) => p.notify_partial_bucket_split(event_time_ns),
            MetricProducer::Event(_) => {}
            MetricProducer::Value(p) => p.notify_partial_bucket_split(event_time_ns),
            MetricProducer::Gauge(p) => p.notify_partial_bucket_split(event_time_ns),
        }
    }

    pub fn note_data_corruption(&mut self, reason: DataCorruptionReason, is_condition_input: bool) {
        let base = match self {
            MetricProducer::Count(p) => p.base_mut(),
            MetricProducer::Duration(p) => p.base_mut(),
            MetricProducer::Event(p) => p.base_mut(),
            MetricProducer::Value(p) => p.base_mut(),
            MetricProducer::Gauge(p) => p.base_mut(),
        };
        base.note_data_corruption(reason, is_condition_input);
    }

    pub fn drain_corruption_reasons(&mut self, clear_resettable: bool) -> Vec<DataCorruptionReason> {
        let base = match self {
            MetricProducer::Count(p) => p.base_mut(),
            MetricProducer::Duration(p) => p.base_mut(),
            MetricProducer::Event(p) => p.base_mut(),
            MetricProducer::Value(p) => p.base_mut(),
            MetricProducer::Gauge(p) => p.base_mut(),
        };
        base.drain_corruption_reasons(clear_resettable)
    }

    /// Serializes the producer's buckets. With `include_partial`, the
    /// current bucket is drained at `dump_time_ns`; with `erase_data`, all
    /// reported state is dropped.
    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase_data: bool,
    ) -> MetricReport {
        match self {
            MetricProducer::Count(p) => p.on_dump_report(dump_time_ns, include_partial, erase_data),
            MetricProducer::Duration(p) => {
                p.on_dump_report(dump_time_ns, include_partial, erase_data)
            }
            MetricProducer::Event(p) => p.on_dump_report(erase_data),
            MetricProducer::Value(p) => p.on_dump_report(dump_time_ns, include_partial, erase_data),
            MetricProducer::Gauge(p) => p.on_dump_report(dump_time_ns, include_partial, erase_data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_timer_accumulates_within_bucket() {
        let mut timer = ConditionTimer::default();
        timer.on_condition_changed(true, 10);
        timer.on_condition_changed(false, 30);
        timer.on_condition_changed(true, 50);
        // Still true at bucket end: [10,30] + [50,60] = 30.
        assert_eq!(timer.new_bucket_start(60), 30);
        // Carry continues into the next bucket.
        timer.on_condition_changed(false, 80);
        assert_eq!(timer.new_bucket_start(120), 20);
    }

    #[test]
    fn test_advance_buckets() {
        let mut base = ProducerBase::new(ProducerBaseConfig {
            metric_id: 1,
            config_key: ConfigKey::new(0, 1),
            time_base_ns: 0,
            bucket_size_ns: 60,
            condition_index: None,
            condition_sliced: false,
            condition_id: 0,
            condition_dimensions: Vec::new(),
            dimensions_in_what: Vec::new(),
            slice_by_state_atoms: Vec::new(),
            state_values_key: HashableDimensionKey::default(),
            split_bucket_for_app_upgrade: false,
            threshold: None,
            min_bucket_size_ns: 0,
        });

        assert!(base.advance_buckets(59).is_none());
        let (start, end, forward) = base.advance_buckets(130).unwrap();
        assert_eq!((start, end, forward), (0, 60, 2));
        assert_eq!(base.current_bucket_num, 2);
        assert_eq!(base.current_bucket_start_ns, 120);
    }

    #[test]
    fn test_partial_bucket_keeps_bucket_num() {
        let mut base = ProducerBase::new(ProducerBaseConfig {
            metric_id: 1,
            config_key: ConfigKey::new(0, 1),
            time_base_ns: 0,
            bucket_size_ns: 60,
            condition_index: None,
            condition_sliced: false,
            condition_id: 0,
            condition_dimensions: Vec::new(),
            dimensions_in_what: Vec::new(),
            slice_by_state_atoms: Vec::new(),
            state_values_key: HashableDimensionKey::default(),
            split_bucket_for_app_upgrade: true,
            threshold: None,
            min_bucket_size_ns: 0,
        });
        base.start_partial_bucket(25);
        assert_eq!(base.current_bucket_start_ns, 25);
        assert_eq!(base.current_bucket_num, 0);
        // The full-bucket boundary is unchanged.
        assert_eq!(base.current_bucket_end_ns(), 60);
    }

    #[test]
    fn test_corruption_severity_composition() {
        let mut base = ProducerBase::new(ProducerBaseConfig {
            metric_id: 1,
            config_key: ConfigKey::new(0, 1),
            time_base_ns: 0,
            bucket_size_ns: 60,
            condition_index: None,
            condition_sliced: false,
            condition_id: 0,
            condition_dimensions: Vec::new(),
            dimensions_in_what: Vec::new(),
            slice_by_state_atoms: Vec::new(),
            state_values_key: HashableDimensionKey::default(),
            split_bucket_for_app_upgrade: false,
            threshold: None,
            min_bucket_size_ns: 0,
        });

        base.note_data_corruption(DataCorruptionReason::QueueOverflow, false);
        base.note_data_corruption(DataCorruptionReason::SocketLoss, true);

        // First dump reports both; queue overflow clears, socket loss is
        // unrecoverable and persists.
        let reasons = base.drain_corruption_reasons(true);
        assert!(reasons.contains(&DataCorruptionReason::QueueOverflow));
        assert!(reasons.contains(&DataCorruptionReason::SocketLoss));

        let reasons = base.drain_corruption_reasons(true);
        assert_eq!(reasons, vec![DataCorruptionReason::SocketLoss]);

        // Unrecoverable wins over a later reset-on-dump note.
        base.note_data_corruption(DataCorruptionReason::SocketLoss, false);
        let reasons = base.drain_corruption_reasons(true);
        assert_eq!(reasons, vec![DataCorruptionReason::SocketLoss]);
    }
}
