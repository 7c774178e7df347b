//! The engine: config installation and the per-event dispatch pipeline.
//!
//! Trackers live in per-kind arenas and reference each other by index, so
//! the cross-reference graph is validated once at install and the hot path
//! is plain vector indexing. For each event the dispatcher updates all
//! matcher states, then condition states, then the metric producers wired
//! to whatever matched. Install and update run between events; a config is
//! activated only after every check passes.

use crate::anomaly::alarm::AlarmMonitor;
use crate::anomaly::{alarm::AlarmTracker, AnomalyTracker};
use crate::condition::{
    evaluate_conditions, CombinationConditionTracker, ConditionTracker, ConditionWizard,
    SimpleConditionTracker,
};
use crate::core::config::{
    Alert, AtomMatcherKind, DurationAggregation, FieldMatcher as FieldMatcherConfig, Position,
    PredicateKind, RuleType, SimplePredicate, TelemetryConfig,
};
use crate::core::error::{InvalidConfigReason, Result, TallyError};
use crate::core::types::{ConditionState, ConfigKey, DataCorruptionReason, MatchingState};
use crate::event::field::{translate_field_matcher, Field, FieldMask};
use crate::event::queue::{EventQueue, PushResult};
use crate::event::{FieldValue, HashableDimensionKey, LogEvent, Value};
use crate::matchers::{
    evaluate_matchers, AtomMatchingTracker, CombinationMatchingTracker, SimpleMatchingTracker,
};
use crate::metrics::duration_metric::DurationMetricArgs;
use crate::metrics::value::ValueMetricArgs;
use crate::metrics::{
    CountMetricProducer, DurationMetricProducer, EventMetricProducer, GaugeMetricProducer,
    MetricProducer, ProducerBaseConfig, ProducerContext, ValueMetricProducer,
};
use crate::puller::Puller;
use crate::report::ConfigReport;
use crate::stats::EngineStats;
use crate::subscriber::{NoopDispatcher, SubscriberDispatcher};
use crate::uid::UidMap;
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const NS_PER_MS: i64 = 1_000_000;

/// Stable content hash used to preserve tracker instances across config
/// updates; `None` when the section cannot be serialized, which simply
/// disables preservation for it.
fn section_hash<T: Serialize>(value: &T) -> Option<u64> {
    let serialized = serde_json::to_string(value).ok()?;
    let mut hasher = ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher();
    hasher.write(serialized.as_bytes());
    Some(hasher.finish())
}

struct BuildDeps<'a> {
    stats: &'a Arc<EngineStats>,
    subscriber_dispatcher: &'a Arc<dyn SubscriberDispatcher>,
    alarm_monitor: &'a Arc<AlarmMonitor>,
    pullers: &'a AHashMap<i32, Arc<dyn Puller>>,
    time_base_ns: i64,
    start_wall_millis: i64,
    current_wall_millis: i64,
}

/// One installed config: its tracker arenas and routing tables.
struct ConfigPipeline {
    config_key: ConfigKey,
    atom_matchers: Vec<AtomMatchingTracker>,
    condition_trackers: Vec<ConditionTracker>,
    producers: Vec<MetricProducer>,
    anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>>,
    alarm_trackers: Vec<AlarmTracker>,
    /// Atoms any matcher of this config can match.
    tag_ids: AHashSet<i32>,
    /// Atoms that drive declared states.
    state_atom_ids: AHashSet<i32>,
    /// matcher index -> producers listening to it.
    tracker_to_metric: AHashMap<usize, Vec<usize>>,
    /// condition index -> producers gated by it.
    condition_to_metric: AHashMap<usize, Vec<usize>>,
    /// Per producer: atoms feeding its what and its condition/state inputs.
    producer_what_atoms: Vec<AHashSet<i32>>,
    producer_condition_atoms: Vec<AHashSet<i32>>,
    /// Section hashes for update-time instance preservation.
    matcher_hashes: AHashMap<i64, u64>,
    predicate_hashes: AHashMap<i64, u64>,
    metric_hashes: AHashMap<i64, u64>,
    alert_hashes: AHashMap<i64, u64>,
}

/// The aggregation engine. Owns the event queue, the installed configs,
/// and the shared context objects (uid map, stats, alarm monitor).
pub struct Engine {
    queue: Arc<EventQueue>,
    uid_map: Arc<UidMap>,
    stats: Arc<EngineStats>,
    subscriber_dispatcher: Arc<dyn SubscriberDispatcher>,
    alarm_monitor: Arc<AlarmMonitor>,
    pullers: AHashMap<i32, Arc<dyn Puller>>,
    configs: Vec<ConfigPipeline>,
    start_wall_millis: i64,
    /// Set by a failed push; folded into corruption accounting on the next
    /// dispatched event.
    overflow_pending: AtomicBool,
}

impl Engine {
    pub fn new(queue_capacity: usize, start_wall_millis: i64) -> Self {
        Self {
            queue: Arc::new(EventQueue::new(queue_capacity)),
            uid_map: Arc::new(UidMap::new()),
            stats: Arc::new(EngineStats::new()),
            subscriber_dispatcher: Arc::new(NoopDispatcher),
            alarm_monitor: Arc::new(AlarmMonitor::new()),
            pullers: AHashMap::new(),
            configs: Vec::new(),
            start_wall_millis,
            overflow_pending: AtomicBool::new(false),
        }
    }

    pub fn with_subscriber_dispatcher(mut self, dispatcher: Arc<dyn SubscriberDispatcher>) -> Self {
        self.subscriber_dispatcher = dispatcher;
        self
    }

    pub fn register_puller(&mut self, atom_id: i32, puller: Arc<dyn Puller>) {
        self.pullers.insert(atom_id, puller);
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn alarm_monitor(&self) -> &Arc<AlarmMonitor> {
        &self.alarm_monitor
    }

    /// Producer-side entry: non-blocking enqueue with overflow accounting.
    pub fn push_event(&self, event: LogEvent) -> PushResult {
        let result = self.queue.push(Box::new(event));
        if result.success {
            self.stats.note_queue_size(result.size);
        } else {
            self.stats
                .note_queue_overflow(result.oldest_timestamp_ns, result.size);
            self.overflow_pending.store(true, Ordering::Relaxed);
        }
        result
    }

    /// Dispatcher-side entry: blocks for the next event and runs it through
    /// every installed config.
    pub fn process_next(&mut self) {
        let event = self.queue.wait_pop();
        self.process_event(&event);
    }

    /// Drains whatever is queued without blocking.
    pub fn drain_queue(&mut self) {
        while let Some(event) = self.queue.try_pop() {
            self.process_event(&event);
        }
    }

    pub fn process_event(&mut self, event: &LogEvent) {
        self.stats.note_event_processed();
        if self.overflow_pending.swap(false, Ordering::Relaxed) {
            for pipeline in &mut self.configs {
                pipeline.note_queue_overflow();
            }
        }
        for pipeline in &mut self.configs {
            pipeline.process_event(event, &self.uid_map, &self.stats);
        }
    }

    /// Installs a config, failing closed: nothing is activated unless every
    /// reference and invariant checks out.
    pub fn install_config(
        &mut self,
        config_key: ConfigKey,
        config: &TelemetryConfig,
        time_base_ns: i64,
        current_wall_millis: i64,
    ) -> Result<()> {
        let deps = BuildDeps {
            stats: &self.stats,
            subscriber_dispatcher: &self.subscriber_dispatcher,
            alarm_monitor: &self.alarm_monitor,
            pullers: &self.pullers,
            time_base_ns,
            start_wall_millis: self.start_wall_millis,
            current_wall_millis,
        };
        let pipeline = ConfigPipeline::build(config_key, config, &deps, None)?;
        self.remove_config_internal(config_key);
        info!(config = %config_key, metrics = config.metric_count(), "config installed");
        self.configs.push(pipeline);
        Ok(())
    }

    /// Replaces a config in place, carrying over the state of trackers
    /// whose config sections hash identically.
    pub fn update_config(
        &mut self,
        config_key: ConfigKey,
        config: &TelemetryConfig,
        time_base_ns: i64,
        current_wall_millis: i64,
    ) -> Result<()> {
        let deps = BuildDeps {
            stats: &self.stats,
            subscriber_dispatcher: &self.subscriber_dispatcher,
            alarm_monitor: &self.alarm_monitor,
            pullers: &self.pullers,
            time_base_ns,
            start_wall_millis: self.start_wall_millis,
            current_wall_millis,
        };
        let old_index = self.configs.iter().position(|p| p.config_key == config_key);
        let pipeline = {
            let old = old_index.map(|i| &mut self.configs[i]);
            ConfigPipeline::build(config_key, config, &deps, old)?
        };
        if let Some(index) = old_index {
            let reused = pipeline.anomaly_trackers.clone();
            self.configs[index].teardown_for_update(&self.alarm_monitor, &reused);
            self.configs[index] = pipeline;
        } else {
            self.configs.push(pipeline);
        }
        info!(config = %config_key, "config updated");
        Ok(())
    }

    pub fn uninstall_config(&mut self, config_key: ConfigKey) -> Result<()> {
        if self.remove_config_internal(config_key) {
            info!(config = %config_key, "config removed");
            Ok(())
        } else {
            Err(TallyError::ConfigNotFound(config_key.to_string()))
        }
    }

    fn remove_config_internal(&mut self, config_key: ConfigKey) -> bool {
        if let Some(index) = self.configs.iter().position(|p| p.config_key == config_key) {
            let mut pipeline = self.configs.remove(index);
            pipeline.teardown(&self.alarm_monitor);
            true
        } else {
            false
        }
    }

    /// Produces a report for one config.
    pub fn dump_report(
        &mut self,
        config_key: ConfigKey,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
    ) -> Result<ConfigReport> {
        let pipeline = self
            .configs
            .iter_mut()
            .find(|p| p.config_key == config_key)
            .ok_or_else(|| TallyError::ConfigNotFound(config_key.to_string()))?;
        Ok(pipeline.dump_report(dump_time_ns, include_current_partial_bucket, erase_data))
    }

    /// Splits partial buckets for metrics configured to do so; the one
    /// mechanism behind both the app-upgrade and boot-complete triggers.
    pub fn notify_app_upgrade(&mut self, event_time_ns: i64) {
        self.split_partial_buckets(event_time_ns);
    }

    pub fn note_boot_complete(&mut self, event_time_ns: i64) {
        self.split_partial_buckets(event_time_ns);
    }

    fn split_partial_buckets(&mut self, event_time_ns: i64) {
        for pipeline in &mut self.configs {
            for producer in &mut pipeline.producers {
                producer.notify_partial_bucket_split(event_time_ns);
            }
        }
    }

    /// The transport lost events for an atom; producers downstream record
    /// the corruption with the severity their input role demands.
    pub fn note_socket_loss(&mut self, atom_id: i32) {
        for pipeline in &mut self.configs {
            pipeline.note_atom_loss(atom_id, DataCorruptionReason::SocketLoss);
        }
    }

    /// Delivers wall-clock alarms due at or before `wall_clock_sec` to
    /// periodic alarm trackers and anomaly prediction alarms.
    pub fn on_alarm_fired(&mut self, wall_clock_sec: i64, elapsed_ns: i64) {
        let mut fired = self.alarm_monitor.pop_sooner_or_same(wall_clock_sec);
        if fired.is_empty() {
            return;
        }
        for pipeline in &mut self.configs {
            for alarm in &mut pipeline.alarm_trackers {
                alarm.inform_alarms_fired(
                    elapsed_ns,
                    &mut fired,
                    &self.alarm_monitor,
                    self.subscriber_dispatcher.as_ref(),
                );
            }
            for tracker in &pipeline.anomaly_trackers {
                tracker.lock().inform_alarms_fired(elapsed_ns, &mut fired);
            }
        }
    }
}

impl ConfigPipeline {
    /// Builds a pipeline from a config. Every validation runs before any
    /// externally visible effect: no alarm registration, and no mutation of
    /// the previous generation's trackers, until the config is known good.
    fn build(
        config_key: ConfigKey,
        config: &TelemetryConfig,
        deps: &BuildDeps<'_>,
        mut old: Option<&mut ConfigPipeline>,
    ) -> Result<ConfigPipeline> {
        // --- Atom matchers, children before parents. ---
        let (atom_matchers, matcher_index_map) = build_matchers(config)?;
        let mut matcher_hashes = AHashMap::new();
        for matcher in &config.atom_matchers {
            if let Some(hash) = section_hash(matcher) {
                matcher_hashes.insert(matcher.id, hash);
            }
        }

        let mut tag_ids = AHashSet::new();
        for matcher in &atom_matchers {
            matcher.collect_atom_ids(&atom_matchers, &mut tag_ids);
        }

        // --- Conditions. ---
        let (mut condition_trackers, condition_index_map) =
            build_conditions(config_key, config, &matcher_index_map)?;
        let mut predicate_hashes = AHashMap::new();
        for predicate in &config.predicates {
            if let Some(hash) = section_hash(predicate) {
                predicate_hashes.insert(predicate.id, hash);
            }
        }

        // --- States. ---
        let mut state_atom_by_id: AHashMap<i64, i32> = AHashMap::new();
        let mut state_atom_ids = AHashSet::new();
        for state in &config.states {
            state_atom_by_id.insert(state.id, state.atom_id);
            state_atom_ids.insert(state.atom_id);
        }

        // --- Alerts, grouped by metric; instances survive an update when
        // their hash is unchanged. ---
        let mut alert_hashes = AHashMap::new();
        let mut alert_ids = AHashSet::new();
        let metric_ids: AHashSet<i64> = config
            .count_metrics
            .iter()
            .map(|m| m.id)
            .chain(config.duration_metrics.iter().map(|m| m.id))
            .chain(config.event_metrics.iter().map(|m| m.id))
            .chain(config.value_metrics.iter().map(|m| m.id))
            .chain(config.gauge_metrics.iter().map(|m| m.id))
            .collect();
        let alertable_ids: AHashSet<i64> = config
            .count_metrics
            .iter()
            .map(|m| m.id)
            .chain(config.duration_metrics.iter().map(|m| m.id))
            .collect();

        let mut anomaly_trackers: Vec<Arc<Mutex<AnomalyTracker>>> = Vec::new();
        let mut alerts_by_metric: AHashMap<i64, Vec<usize>> = AHashMap::new();
        for alert in &config.alerts {
            if !alert_ids.insert(alert.id) {
                return Err(InvalidConfigReason::DuplicateAlertId(alert.id).into());
            }
            if alert.num_buckets <= 0 {
                return Err(
                    InvalidConfigReason::AlertInvalidNumBuckets(alert.id, alert.num_buckets).into(),
                );
            }
            if !metric_ids.contains(&alert.metric_id) {
                return Err(
                    InvalidConfigReason::AlertMetricNotFound(alert.id, alert.metric_id).into(),
                );
            }
            if !alertable_ids.contains(&alert.metric_id) {
                return Err(InvalidConfigReason::AlertUnsupportedMetricKind(
                    alert.id,
                    alert.metric_id,
                )
                .into());
            }
            // The hash is mandatory for alerts: a serialization failure
            // fails the install closed.
            let hash = AnomalyTracker::proto_hash(alert)?;
            alert_hashes.insert(alert.id, hash);

            let tracker =
                reuse_or_build_anomaly_tracker(alert, hash, config_key, deps, old.as_deref());
            alerts_by_metric
                .entry(alert.metric_id)
                .or_default()
                .push(anomaly_trackers.len());
            anomaly_trackers.push(tracker);
        }

        // --- Metric producers. ---
        let mut builder = ProducerSetBuilder {
            config_key,
            deps,
            atom_matchers: &atom_matchers,
            matcher_index_map: &matcher_index_map,
            condition_trackers: &condition_trackers,
            condition_index_map: &condition_index_map,
            state_atom_by_id: &state_atom_by_id,
            anomaly_trackers: &anomaly_trackers,
            alerts_by_metric: &alerts_by_metric,
            producers: Vec::new(),
            tracker_to_metric: AHashMap::new(),
            condition_to_metric: AHashMap::new(),
            producer_what_atoms: Vec::new(),
            producer_condition_atoms: Vec::new(),
            metric_hashes: AHashMap::new(),
            seen_metric_ids: AHashSet::new(),
        };
        builder.build_all(config)?;
        let ProducerSetBuilder {
            mut producers,
            tracker_to_metric,
            condition_to_metric,
            producer_what_atoms,
            producer_condition_atoms,
            metric_hashes,
            ..
        } = builder;

        // --- Remaining validations, still effect-free. ---
        for alarm in &config.alarms {
            if alarm.period_millis <= 0 {
                return Err(
                    InvalidConfigReason::AlarmInvalidPeriod(alarm.id, alarm.period_millis).into(),
                );
            }
        }
        for subscription in &config.subscriptions {
            let known = match subscription.rule_type {
                RuleType::Alert => alert_ids.contains(&subscription.rule_id),
                RuleType::Alarm => config.alarms.iter().any(|a| a.id == subscription.rule_id),
            };
            if !known {
                return Err(InvalidConfigReason::SubscriptionRuleNotFound(
                    subscription.id,
                    subscription.rule_id,
                )
                .into());
            }
        }

        // --- Everything checked out; effects begin here. ---
        if let Some(old) = old.as_deref_mut() {
            adopt_condition_state(&mut condition_trackers, &predicate_hashes, old);
            adopt_producers(
                &mut producers,
                &metric_hashes,
                &predicate_hashes,
                &matcher_hashes,
                config,
                &matcher_index_map,
                &condition_index_map,
                old,
            );
        }

        let mut alarm_trackers = Vec::with_capacity(config.alarms.len());
        for alarm in &config.alarms {
            alarm_trackers.push(AlarmTracker::new(
                deps.start_wall_millis,
                deps.current_wall_millis,
                alarm.clone(),
                config_key,
                deps.alarm_monitor,
            ));
            deps.stats.note_alarm_registered();
        }

        // Reused anomaly trackers carry stale subscriptions; drop and
        // rebind.
        for tracker in &anomaly_trackers {
            tracker.lock().on_config_updated();
        }
        for subscription in &config.subscriptions {
            match subscription.rule_type {
                RuleType::Alert => {
                    if let Some(tracker) = anomaly_trackers
                        .iter()
                        .find(|t| t.lock().alert_id() == subscription.rule_id)
                    {
                        tracker.lock().add_subscription(subscription.clone());
                    }
                }
                RuleType::Alarm => {
                    if let Some(tracker) = alarm_trackers
                        .iter_mut()
                        .find(|t| t.alarm_id() == subscription.rule_id)
                    {
                        tracker.add_subscription(subscription.clone());
                    }
                }
            }
        }

        Ok(ConfigPipeline {
            config_key,
            atom_matchers,
            condition_trackers,
            producers,
            anomaly_trackers,
            alarm_trackers,
            tag_ids,
            state_atom_ids,
            tracker_to_metric,
            condition_to_metric,
            producer_what_atoms,
            producer_condition_atoms,
            matcher_hashes,
            predicate_hashes,
            metric_hashes,
            alert_hashes,
        })
    }

    fn teardown(&mut self, monitor: &AlarmMonitor) {
        for alarm in &mut self.alarm_trackers {
            alarm.unregister(monitor);
        }
        for tracker in &self.anomaly_trackers {
            tracker.lock().cancel_all_alarms();
        }
    }

    /// Teardown after an update: periodic alarms are always rebuilt, but
    /// anomaly trackers reused by the new generation keep their prediction
    /// alarms.
    fn teardown_for_update(
        &mut self,
        monitor: &AlarmMonitor,
        reused: &[Arc<Mutex<AnomalyTracker>>],
    ) {
        for alarm in &mut self.alarm_trackers {
            alarm.unregister(monitor);
        }
        for tracker in &self.anomaly_trackers {
            if !reused.iter().any(|kept| Arc::ptr_eq(kept, tracker)) {
                tracker.lock().cancel_all_alarms();
            }
        }
    }

    fn process_event(&mut self, event: &LogEvent, uid_map: &UidMap, stats: &EngineStats) {
        let tag = event.tag();
        let event_time_ns = event.elapsed_timestamp_ns();

        // Exclusive-state changes re-key sliced producers before the event
        // continues through the ordinary matching path.
        if self.state_atom_ids.contains(&tag) {
            let state_value = event
                .values()
                .iter()
                .find(|fv| fv.annotations.is_exclusive_state())
                .cloned();
            if let Some(state_value) = state_value {
                for producer in &mut self.producers {
                    if producer.slices_by_state(tag) {
                        producer.on_state_changed(event_time_ns, tag, &state_value);
                    }
                }
            }
        }

        if !self.tag_ids.contains(&tag) {
            return;
        }

        let results = evaluate_matchers(&self.atom_matchers, uid_map, event);
        if !results
            .states
            .iter()
            .any(|state| *state == MatchingState::Matched)
        {
            return;
        }

        let mut condition_cache =
            vec![ConditionState::NotEvaluated; self.condition_trackers.len()];
        let mut condition_changed = vec![false; self.condition_trackers.len()];
        evaluate_conditions(
            &mut self.condition_trackers,
            event,
            &results.states,
            &mut condition_cache,
            &mut condition_changed,
            stats,
        );

        // Condition flips reach their gated producers first, so the event
        // itself is observed under the new condition.
        for (&condition_index, producer_indices) in &self.condition_to_metric {
            if !condition_changed[condition_index] {
                continue;
            }
            let sliced =
                self.condition_trackers[condition_index].is_sliced(&self.condition_trackers);
            for &producer_index in producer_indices {
                let ctx = ProducerContext {
                    wizard: ConditionWizard::new(&self.condition_trackers),
                    stats,
                };
                if sliced {
                    self.producers[producer_index]
                        .on_sliced_condition_may_change(event_time_ns, &ctx);
                } else {
                    self.producers[producer_index].on_condition_changed(
                        condition_cache[condition_index],
                        event_time_ns,
                        &ctx,
                    );
                }
            }
        }

        for (matcher_index, state) in results.states.iter().enumerate() {
            if *state != MatchingState::Matched {
                continue;
            }
            let Some(producer_indices) = self.tracker_to_metric.get(&matcher_index) else {
                continue;
            };
            let dispatch_event = results.event_for(matcher_index, event);
            for &producer_index in producer_indices {
                let ctx = ProducerContext {
                    wizard: ConditionWizard::new(&self.condition_trackers),
                    stats,
                };
                self.producers[producer_index].on_matched_log_event(
                    matcher_index,
                    dispatch_event,
                    &ctx,
                );
            }
        }
    }

    fn note_queue_overflow(&mut self) {
        // The dropped event's atom is unknown, so every producer accounts
        // for the loss; those with condition or state inputs can no longer
        // trust their accumulated truth.
        for (index, producer) in self.producers.iter_mut().enumerate() {
            let is_condition_input = !self.producer_condition_atoms[index].is_empty();
            producer.note_data_corruption(DataCorruptionReason::QueueOverflow, is_condition_input);
        }
    }

    fn note_atom_loss(&mut self, atom_id: i32, reason: DataCorruptionReason) {
        for (index, producer) in self.producers.iter_mut().enumerate() {
            if self.producer_condition_atoms[index].contains(&atom_id) {
                producer.note_data_corruption(reason, true);
            } else if self.producer_what_atoms[index].contains(&atom_id) {
                producer.note_data_corruption(reason, false);
            }
        }
    }

    fn dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase_data: bool,
    ) -> ConfigReport {
        let mut metrics = Vec::with_capacity(self.producers.len());
        let mut corrupted: AHashSet<DataCorruptionReason> = AHashSet::new();
        for producer in &mut self.producers {
            metrics.push(producer.on_dump_report(dump_time_ns, include_partial, erase_data));
            for reason in producer.drain_corruption_reasons(true) {
                corrupted.insert(reason);
            }
        }
        let estimated_bytes = metrics.iter().map(|m| m.estimated_data_bytes).sum();
        debug!(config = %self.config_key, estimated_bytes, "report produced");
        ConfigReport {
            config_key: self.config_key,
            current_report_elapsed_ns: dump_time_ns,
            metrics,
            data_corrupted_reasons: corrupted.into_iter().collect(),
            estimated_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Install-time construction helpers.

fn build_matchers(
    config: &TelemetryConfig,
) -> Result<(Vec<AtomMatchingTracker>, AHashMap<i64, usize>)> {
    let mut by_id: AHashMap<i64, &crate::core::config::AtomMatcherConfig> = AHashMap::new();
    for matcher in &config.atom_matchers {
        if by_id.insert(matcher.id, matcher).is_some() {
            return Err(InvalidConfigReason::DuplicateMatcherId(matcher.id).into());
        }
    }

    let mut arena = Vec::with_capacity(config.atom_matchers.len());
    let mut index_map = AHashMap::new();
    let mut in_progress = AHashSet::new();
    for matcher in &config.atom_matchers {
        visit_matcher(matcher.id, &by_id, &mut arena, &mut index_map, &mut in_progress)?;
    }
    Ok((arena, index_map))
}

fn visit_matcher(
    id: i64,
    by_id: &AHashMap<i64, &crate::core::config::AtomMatcherConfig>,
    arena: &mut Vec<AtomMatchingTracker>,
    index_map: &mut AHashMap<i64, usize>,
    in_progress: &mut AHashSet<i64>,
) -> Result<usize> {
    if let Some(&index) = index_map.get(&id) {
        return Ok(index);
    }
    if !in_progress.insert(id) {
        return Err(InvalidConfigReason::MatcherCycle(id).into());
    }
    let config = by_id
        .get(&id)
        .copied()
        .ok_or(InvalidConfigReason::MatcherChildNotFound(id, id))?;

    let tracker = match &config.kind {
        AtomMatcherKind::Simple(simple) => {
            AtomMatchingTracker::Simple(SimpleMatchingTracker::compile(id, simple)?)
        }
        AtomMatcherKind::Combination {
            operation,
            child_ids,
        } => {
            if child_ids.is_empty() {
                return Err(InvalidConfigReason::MatcherNoChildren(id).into());
            }
            let mut children = Vec::with_capacity(child_ids.len());
            for &child_id in child_ids {
                if !by_id.contains_key(&child_id) {
                    return Err(InvalidConfigReason::MatcherChildNotFound(id, child_id).into());
                }
                children.push(visit_matcher(child_id, by_id, arena, index_map, in_progress)?);
            }
            AtomMatchingTracker::Combination(CombinationMatchingTracker::new(
                id, *operation, children,
            ))
        }
    };
    in_progress.remove(&id);
    let index = arena.len();
    arena.push(tracker);
    index_map.insert(id, index);
    Ok(index)
}

fn translate_dimensions(config: &FieldMatcherConfig) -> Vec<FieldMask> {
    let mut output = Vec::new();
    translate_field_matcher(config, &mut output);
    output
}

fn build_conditions(
    config_key: ConfigKey,
    config: &TelemetryConfig,
    matcher_index_map: &AHashMap<i64, usize>,
) -> Result<(Vec<ConditionTracker>, AHashMap<i64, usize>)> {
    let mut by_id: AHashMap<i64, &crate::core::config::PredicateConfig> = AHashMap::new();
    for predicate in &config.predicates {
        if by_id.insert(predicate.id, predicate).is_some() {
            return Err(InvalidConfigReason::DuplicatePredicateId(predicate.id).into());
        }
    }

    let mut arena = Vec::with_capacity(config.predicates.len());
    let mut index_map = AHashMap::new();
    let mut in_progress = AHashSet::new();
    for predicate in &config.predicates {
        visit_predicate(
            predicate.id,
            config_key,
            &by_id,
            matcher_index_map,
            &mut arena,
            &mut index_map,
            &mut in_progress,
        )?;
    }
    Ok((arena, index_map))
}

#[allow(clippy::too_many_arguments)]
fn visit_predicate(
    id: i64,
    config_key: ConfigKey,
    by_id: &AHashMap<i64, &crate::core::config::PredicateConfig>,
    matcher_index_map: &AHashMap<i64, usize>,
    arena: &mut Vec<ConditionTracker>,
    index_map: &mut AHashMap<i64, usize>,
    in_progress: &mut AHashSet<i64>,
) -> Result<usize> {
    if let Some(&index) = index_map.get(&id) {
        return Ok(index);
    }
    if !in_progress.insert(id) {
        return Err(InvalidConfigReason::PredicateCycle(id).into());
    }
    let config = by_id
        .get(&id)
        .copied()
        .ok_or(InvalidConfigReason::PredicateChildNotFound(id, id))?;

    let tracker = match &config.kind {
        PredicateKind::Simple(simple) => {
            let resolve = |matcher_id: Option<i64>| -> Result<Option<usize>> {
                match matcher_id {
                    None => Ok(None),
                    Some(matcher_id) => matcher_index_map
                        .get(&matcher_id)
                        .copied()
                        .map(Some)
                        .ok_or_else(|| {
                            InvalidConfigReason::PredicateMatcherNotFound(id, matcher_id).into()
                        }),
                }
            };
            let start = resolve(simple.start)?;
            let stop = resolve(simple.stop)?;
            let stop_all = resolve(simple.stop_all)?;
            let output_dimensions = simple
                .dimensions
                .as_ref()
                .map(translate_dimensions)
                .unwrap_or_default();
            if simple
                .dimensions
                .as_ref()
                .is_some_and(|d| d.has_position(Position::Any))
            {
                return Err(InvalidConfigReason::MatcherPositionMisuse(
                    id,
                    "condition dimensions cannot use the ANY position",
                )
                .into());
            }
            let index = arena.len();
            ConditionTracker::Simple(SimpleConditionTracker::new(
                config_key,
                id,
                index,
                simple,
                start,
                stop,
                stop_all,
                output_dimensions,
            ))
        }
        PredicateKind::Combination {
            operation,
            child_ids,
        } => {
            if child_ids.is_empty() {
                return Err(InvalidConfigReason::PredicateNoChildren(id).into());
            }
            let mut children = Vec::with_capacity(child_ids.len());
            for &child_id in child_ids {
                if !by_id.contains_key(&child_id) {
                    return Err(InvalidConfigReason::PredicateChildNotFound(id, child_id).into());
                }
                children.push(visit_predicate(
                    child_id,
                    config_key,
                    by_id,
                    matcher_index_map,
                    arena,
                    index_map,
                    in_progress,
                )?);
            }
            let sliced_children: Vec<usize> = children
                .iter()
                .copied()
                .filter(|&child| arena[child].is_sliced(arena))
                .collect();
            let index = arena.len();
            ConditionTracker::Combination(CombinationConditionTracker::new(
                id,
                index,
                *operation,
                children,
                sliced_children,
            ))
        }
    };
    in_progress.remove(&id);
    let index = arena.len();
    arena.push(tracker);
    index_map.insert(id, index);
    Ok(index)
}

fn reuse_or_build_anomaly_tracker(
    alert: &Alert,
    hash: u64,
    config_key: ConfigKey,
    deps: &BuildDeps<'_>,
    old: Option<&ConfigPipeline>,
) -> Arc<Mutex<AnomalyTracker>> {
    if let Some(old) = old {
        if old.alert_hashes.get(&alert.id) == Some(&hash) {
            if let Some(tracker) = old
                .anomaly_trackers
                .iter()
                .find(|t| t.lock().alert_id() == alert.id)
            {
                return Arc::clone(tracker);
            }
        }
    }
    Arc::new(Mutex::new(AnomalyTracker::new(
        alert.clone(),
        config_key,
        Arc::clone(deps.stats),
        Arc::clone(deps.subscriber_dispatcher),
        Some(Arc::clone(deps.alarm_monitor)),
    )))
}

fn adopt_condition_state(
    trackers: &mut [ConditionTracker],
    predicate_hashes: &AHashMap<i64, u64>,
    old: &mut ConfigPipeline,
) {
    for tracker in trackers.iter_mut() {
        let ConditionTracker::Simple(new_simple) = tracker else {
            continue;
        };
        let id = new_simple.condition_id();
        if predicate_hashes.get(&id) != old.predicate_hashes.get(&id)
            || predicate_hashes.get(&id).is_none()
        {
            continue;
        }
        let old_simple = old.condition_trackers.iter_mut().find_map(|t| match t {
            ConditionTracker::Simple(s) if s.condition_id() == id => Some(s),
            _ => None,
        });
        if let Some(old_simple) = old_simple {
            new_simple.adopt_state(old_simple);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn adopt_producers(
    producers: &mut [MetricProducer],
    metric_hashes: &AHashMap<i64, u64>,
    predicate_hashes: &AHashMap<i64, u64>,
    matcher_hashes: &AHashMap<i64, u64>,
    config: &TelemetryConfig,
    matcher_index_map: &AHashMap<i64, usize>,
    condition_index_map: &AHashMap<i64, usize>,
    old: &mut ConfigPipeline,
) {
    // A producer survives an update when its own section and every
    // referenced section hash unchanged; only its arena indices need
    // rebinding.
    let section_unchanged = |new: &AHashMap<i64, u64>, old_map: &AHashMap<i64, u64>, id: i64| {
        matches!((new.get(&id), old_map.get(&id)), (Some(a), Some(b)) if a == b)
    };

    for producer in producers.iter_mut() {
        let metric_id = producer.metric_id();
        if !section_unchanged(metric_hashes, &old.metric_hashes, metric_id) {
            continue;
        }

        // Dependencies: what + condition sections must also be unchanged.
        let deps_unchanged = |what_id: Option<i64>,
                              what_is_predicate: bool,
                              condition_id: Option<i64>| {
            let what_ok = match what_id {
                None => false,
                Some(id) if what_is_predicate => {
                    section_unchanged(predicate_hashes, &old.predicate_hashes, id)
                }
                Some(id) => section_unchanged(matcher_hashes, &old.matcher_hashes, id),
            };
            let condition_ok = match condition_id {
                None => true,
                Some(id) => section_unchanged(predicate_hashes, &old.predicate_hashes, id),
            };
            what_ok && condition_ok
        };

        let (what_id, what_is_predicate, condition_id) = match producer {
            MetricProducer::Count(_) => {
                match config.count_metrics.iter().find(|m| m.id == metric_id) {
                    Some(m) => (Some(m.what), false, m.condition),
                    None => continue,
                }
            }
            MetricProducer::Duration(_) => {
                match config.duration_metrics.iter().find(|m| m.id == metric_id) {
                    Some(m) => (Some(m.what), true, m.condition),
                    None => continue,
                }
            }
            MetricProducer::Event(_) => {
                match config.event_metrics.iter().find(|m| m.id == metric_id) {
                    Some(m) => (Some(m.what), false, m.condition),
                    None => continue,
                }
            }
            MetricProducer::Value(_) => {
                match config.value_metrics.iter().find(|m| m.id == metric_id) {
                    Some(m) => (Some(m.what), false, m.condition),
                    None => continue,
                }
            }
            MetricProducer::Gauge(_) => {
                match config.gauge_metrics.iter().find(|m| m.id == metric_id) {
                    Some(m) => (Some(m.what), false, m.condition),
                    None => continue,
                }
            }
        };
        if !deps_unchanged(what_id, what_is_predicate, condition_id) {
            continue;
        }

        // Find the old producer of the same kind and id and take it.
        let old_producer_index = old.producers.iter().position(|p| {
            p.metric_id() == metric_id
                && std::mem::discriminant(p) == std::mem::discriminant(producer)
        });
        let Some(old_index) = old_producer_index else {
            continue;
        };
        let mut preserved = old.producers.swap_remove(old_index);

        // Rebind arena indices that may have shifted.
        let new_condition_index = condition_id.and_then(|id| condition_index_map.get(&id).copied());
        match &mut preserved {
            MetricProducer::Count(p) => p.base_mut().condition_index = new_condition_index,
            MetricProducer::Event(p) => p.base_mut().condition_index = new_condition_index,
            MetricProducer::Value(p) => p.base_mut().condition_index = new_condition_index,
            MetricProducer::Gauge(p) => p.base_mut().condition_index = new_condition_index,
            MetricProducer::Duration(p) => {
                p.base_mut().condition_index = new_condition_index;
                if let Some(predicate) = config
                    .duration_metrics
                    .iter()
                    .find(|m| m.id == metric_id)
                    .and_then(|m| find_simple_predicate(config, m.what))
                {
                    let resolve =
                        |matcher_id: Option<i64>| -> Option<usize> {
                            matcher_id.and_then(|id| matcher_index_map.get(&id).copied())
                        };
                    if let Some(start) = resolve(predicate.start) {
                        p.set_matcher_indices(
                            start,
                            resolve(predicate.stop),
                            resolve(predicate.stop_all),
                        );
                    }
                }
            }
        }
        *producer = preserved;
        debug!(metric_id, "producer preserved across config update");
    }
}

fn find_simple_predicate(config: &TelemetryConfig, predicate_id: i64) -> Option<&SimplePredicate> {
    config.predicates.iter().find_map(|p| {
        if p.id != predicate_id {
            return None;
        }
        match &p.kind {
            PredicateKind::Simple(simple) => Some(simple),
            PredicateKind::Combination { .. } => None,
        }
    })
}

/// Accumulates producers and their routing tables during a build.
struct ProducerSetBuilder<'a> {
    config_key: ConfigKey,
    deps: &'a BuildDeps<'a>,
    atom_matchers: &'a [AtomMatchingTracker],
    matcher_index_map: &'a AHashMap<i64, usize>,
    condition_trackers: &'a [ConditionTracker],
    condition_index_map: &'a AHashMap<i64, usize>,
    state_atom_by_id: &'a AHashMap<i64, i32>,
    anomaly_trackers: &'a [Arc<Mutex<AnomalyTracker>>],
    alerts_by_metric: &'a AHashMap<i64, Vec<usize>>,
    producers: Vec<MetricProducer>,
    tracker_to_metric: AHashMap<usize, Vec<usize>>,
    condition_to_metric: AHashMap<usize, Vec<usize>>,
    producer_what_atoms: Vec<AHashSet<i32>>,
    producer_condition_atoms: Vec<AHashSet<i32>>,
    metric_hashes: AHashMap<i64, u64>,
    seen_metric_ids: AHashSet<i64>,
}

/// Per-metric wiring computed before the producer itself is constructed.
struct MetricWiring {
    condition_index: Option<usize>,
    condition_sliced: bool,
    condition_id: i64,
    condition_dimensions: Vec<FieldMask>,
    state_atoms: Vec<i32>,
    state_values_key: HashableDimensionKey,
    condition_atoms: AHashSet<i32>,
}

impl<'a> ProducerSetBuilder<'a> {
    fn build_all(&mut self, config: &TelemetryConfig) -> Result<()> {
        for metric in &config.count_metrics {
            self.check_metric_id(metric.id)?;
            if let Some(hash) = section_hash(metric) {
                self.metric_hashes.insert(metric.id, hash);
            }
            self.build_count(metric)?;
        }
        for metric in &config.duration_metrics {
            self.check_metric_id(metric.id)?;
            if let Some(hash) = section_hash(metric) {
                self.metric_hashes.insert(metric.id, hash);
            }
            self.build_duration(config, metric)?;
        }
        for metric in &config.event_metrics {
            self.check_metric_id(metric.id)?;
            if let Some(hash) = section_hash(metric) {
                self.metric_hashes.insert(metric.id, hash);
            }
            self.build_event(metric)?;
        }
        for metric in &config.value_metrics {
            self.check_metric_id(metric.id)?;
            if let Some(hash) = section_hash(metric) {
                self.metric_hashes.insert(metric.id, hash);
            }
            self.build_value(metric)?;
        }
        for metric in &config.gauge_metrics {
            self.check_metric_id(metric.id)?;
            if let Some(hash) = section_hash(metric) {
                self.metric_hashes.insert(metric.id, hash);
            }
            self.build_gauge(metric)?;
        }
        Ok(())
    }

    fn check_metric_id(&mut self, id: i64) -> Result<()> {
        if !self.seen_metric_ids.insert(id) {
            return Err(InvalidConfigReason::DuplicateMetricId(id).into());
        }
        Ok(())
    }

    fn resolve_what_matcher(&self, metric_id: i64, what: i64) -> Result<usize> {
        self.matcher_index_map
            .get(&what)
            .copied()
            .ok_or_else(|| InvalidConfigReason::MetricMatcherNotFound(metric_id, what).into())
    }

    fn wire_metric(
        &self,
        metric_id: i64,
        condition: Option<i64>,
        slice_by_state: &[i64],
    ) -> Result<MetricWiring> {
        let condition_index = match condition {
            None => None,
            Some(condition_id) => Some(
                self.condition_index_map
                    .get(&condition_id)
                    .copied()
                    .ok_or(InvalidConfigReason::MetricConditionNotFound(
                        metric_id,
                        condition_id,
                    ))?,
            ),
        };

        let mut condition_sliced = false;
        let mut condition_dimensions = Vec::new();
        let mut condition_atoms = AHashSet::new();
        if let Some(index) = condition_index {
            let tracker = &self.condition_trackers[index];
            condition_sliced = tracker.is_sliced(self.condition_trackers);
            if condition_sliced {
                if let ConditionTracker::Combination(combination) = tracker {
                    if combination.sliced_children().len() > 1 {
                        return Err(InvalidConfigReason::PredicateTooManySlicedChildren(
                            tracker.condition_id(),
                        )
                        .into());
                    }
                }
                condition_dimensions = tracker
                    .output_dimensions(self.condition_trackers)
                    .map(<[FieldMask]>::to_vec)
                    .unwrap_or_default();
            }
            collect_condition_atoms(
                self.condition_trackers,
                index,
                self.atom_matchers,
                &mut condition_atoms,
            );
        }

        let mut state_atoms = Vec::with_capacity(slice_by_state.len());
        let mut state_values_key = HashableDimensionKey::default();
        for &state_id in slice_by_state {
            let atom_id = self
                .state_atom_by_id
                .get(&state_id)
                .copied()
                .ok_or(InvalidConfigReason::MetricStateNotFound(metric_id, state_id))?;
            state_atoms.push(atom_id);
            // States start unknown until the first exclusive-state event.
            state_values_key.add_value(FieldValue::new(
                Field::new(atom_id, crate::event::field::get_simple_field(1)),
                Value::Unknown,
            ));
            condition_atoms.insert(atom_id);
        }

        let condition_id = condition.unwrap_or(0);
        Ok(MetricWiring {
            condition_index,
            condition_sliced,
            condition_id,
            condition_dimensions,
            state_atoms,
            state_values_key,
            condition_atoms,
        })
    }

    fn check_dimensions(&self, metric_id: i64, dimensions: &Option<FieldMatcherConfig>) -> Result<()> {
        if dimensions
            .as_ref()
            .is_some_and(|d| d.has_position(Position::Any))
        {
            return Err(InvalidConfigReason::MatcherPositionMisuse(
                metric_id,
                "metric dimensions cannot use the ANY position",
            )
            .into());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn base_config(
        &self,
        metric_id: i64,
        bucket_size_millis: i64,
        dimensions_in_what: &Option<FieldMatcherConfig>,
        wiring: &MetricWiring,
        split_bucket_for_app_upgrade: bool,
        threshold: Option<crate::core::config::UploadThreshold>,
        min_bucket_size_ns: i64,
    ) -> Result<ProducerBaseConfig> {
        if bucket_size_millis <= 0 {
            return Err(InvalidConfigReason::MetricZeroBucketSize(metric_id).into());
        }
        Ok(ProducerBaseConfig {
            metric_id,
            config_key: self.config_key,
            time_base_ns: self.deps.time_base_ns,
            bucket_size_ns: bucket_size_millis * NS_PER_MS,
            condition_index: wiring.condition_index,
            condition_sliced: wiring.condition_sliced,
            condition_id: wiring.condition_id,
            condition_dimensions: wiring.condition_dimensions.clone(),
            dimensions_in_what: dimensions_in_what
                .as_ref()
                .map(translate_dimensions)
                .unwrap_or_default(),
            slice_by_state_atoms: wiring.state_atoms.clone(),
            state_values_key: wiring.state_values_key.clone(),
            split_bucket_for_app_upgrade,
            threshold,
            min_bucket_size_ns,
        })
    }

    fn push_producer(
        &mut self,
        producer: MetricProducer,
        listened_matchers: Vec<usize>,
        wiring: &MetricWiring,
        what_atoms: AHashSet<i32>,
    ) {
        let producer_index = self.producers.len();
        for matcher_index in listened_matchers {
            self.tracker_to_metric
                .entry(matcher_index)
                .or_default()
                .push(producer_index);
        }
        if let Some(condition_index) = wiring.condition_index {
            self.condition_to_metric
                .entry(condition_index)
                .or_default()
                .push(producer_index);
        }
        self.producer_what_atoms.push(what_atoms);
        self.producer_condition_atoms
            .push(wiring.condition_atoms.clone());
        self.producers.push(producer);
    }

    fn what_atoms_of(&self, matcher_index: usize) -> AHashSet<i32> {
        let mut atoms = AHashSet::new();
        self.atom_matchers[matcher_index].collect_atom_ids(self.atom_matchers, &mut atoms);
        atoms
    }

    fn anomaly_trackers_for(&self, metric_id: i64) -> Vec<Arc<Mutex<AnomalyTracker>>> {
        self.alerts_by_metric
            .get(&metric_id)
            .map(|indices| {
                indices
                    .iter()
                    .map(|&i| Arc::clone(&self.anomaly_trackers[i]))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn build_count(&mut self, metric: &crate::core::config::CountMetric) -> Result<()> {
        let what_index = self.resolve_what_matcher(metric.id, metric.what)?;
        self.check_dimensions(metric.id, &metric.dimensions_in_what)?;
        let wiring = self.wire_metric(metric.id, metric.condition, &metric.slice_by_state)?;
        let base = self.base_config(
            metric.id,
            metric.bucket_size_millis,
            &metric.dimensions_in_what,
            &wiring,
            metric.split_bucket_for_app_upgrade,
            metric.threshold,
            0,
        )?;
        let producer = MetricProducer::Count(CountMetricProducer::new(
            base,
            self.anomaly_trackers_for(metric.id),
        ));
        let what_atoms = self.what_atoms_of(what_index);
        self.push_producer(producer, vec![what_index], &wiring, what_atoms);
        Ok(())
    }

    fn build_duration(
        &mut self,
        config: &TelemetryConfig,
        metric: &crate::core::config::DurationMetric,
    ) -> Result<()> {
        let predicate = find_simple_predicate(config, metric.what)
            .ok_or(InvalidConfigReason::DurationWhatNotSimple(metric.id))?;
        let start_id = predicate
            .start
            .ok_or(InvalidConfigReason::MetricMissingWhat(metric.id))?;
        let resolve = |matcher_id: Option<i64>| -> Result<Option<usize>> {
            match matcher_id {
                None => Ok(None),
                Some(matcher_id) => self
                    .matcher_index_map
                    .get(&matcher_id)
                    .copied()
                    .map(Some)
                    .ok_or_else(|| {
                        InvalidConfigReason::MetricMatcherNotFound(metric.id, matcher_id).into()
                    }),
            }
        };
        let start_index = self.resolve_what_matcher(metric.id, start_id)?;
        let stop_index = resolve(predicate.stop)?;
        let stop_all_index = resolve(predicate.stop_all)?;

        if metric.aggregation == DurationAggregation::Max && !metric.slice_by_state.is_empty() {
            return Err(InvalidConfigReason::DurationMaxSliceByState(metric.id).into());
        }
        self.check_dimensions(metric.id, &metric.dimensions_in_what)?;
        let wiring = self.wire_metric(metric.id, metric.condition, &metric.slice_by_state)?;
        let base = self.base_config(
            metric.id,
            metric.bucket_size_millis,
            &metric.dimensions_in_what,
            &wiring,
            metric.split_bucket_for_app_upgrade,
            metric.threshold,
            0,
        )?;
        let internal_dimensions = predicate
            .dimensions
            .as_ref()
            .map(translate_dimensions)
            .unwrap_or_default();
        let producer = MetricProducer::Duration(DurationMetricProducer::new(
            base,
            DurationMetricArgs {
                aggregation: metric.aggregation,
                start_index,
                stop_index,
                stop_all_index,
                nested: predicate.count_nesting,
                internal_dimensions,
                anomaly_trackers: self.anomaly_trackers_for(metric.id),
            },
        ));

        let mut listened = vec![start_index];
        listened.extend(stop_index);
        listened.extend(stop_all_index);
        let mut what_atoms = AHashSet::new();
        for &index in &listened {
            self.atom_matchers[index].collect_atom_ids(self.atom_matchers, &mut what_atoms);
        }
        self.push_producer(producer, listened, &wiring, what_atoms);
        Ok(())
    }

    fn build_event(&mut self, metric: &crate::core::config::EventMetric) -> Result<()> {
        let what_index = self.resolve_what_matcher(metric.id, metric.what)?;
        let wiring = self.wire_metric(metric.id, metric.condition, &[])?;
        // Event metrics are unbucketed; the base still wants a width.
        let base = self.base_config(metric.id, i64::MAX / NS_PER_MS, &None, &wiring, false, None, 0)?;
        let producer = MetricProducer::Event(EventMetricProducer::new(base));
        let what_atoms = self.what_atoms_of(what_index);
        self.push_producer(producer, vec![what_index], &wiring, what_atoms);
        Ok(())
    }

    fn build_value(&mut self, metric: &crate::core::config::ValueMetric) -> Result<()> {
        let what_index = self.resolve_what_matcher(metric.id, metric.what)?;
        self.check_dimensions(metric.id, &metric.dimensions_in_what)?;
        let wiring = self.wire_metric(metric.id, metric.condition, &[])?;
        let base = self.base_config(
            metric.id,
            metric.bucket_size_millis,
            &metric.dimensions_in_what,
            &wiring,
            metric.split_bucket_for_app_upgrade,
            metric.threshold,
            metric.min_bucket_size_nanos,
        )?;

        // A value metric is pulled when its observed atom has a registered
        // puller.
        let what_atoms = self.what_atoms_of(what_index);
        let pulled_atom = what_atoms
            .iter()
            .copied()
            .find(|atom| self.deps.pullers.contains_key(atom));
        let puller = pulled_atom.and_then(|atom| self.deps.pullers.get(&atom).cloned());

        let aggregation = metric.aggregation_types.first().copied().unwrap_or_default();
        let producer = MetricProducer::Value(ValueMetricProducer::new(
            base,
            ValueMetricArgs {
                value_matchers: translate_dimensions(&metric.value_field),
                aggregation,
                puller,
                pulled_atom_id: pulled_atom.unwrap_or_default(),
                use_absolute_value_on_reset: metric.use_absolute_value_on_reset,
                max_pull_delay_sec: metric.max_pull_delay_sec,
                stats: Arc::clone(self.deps.stats),
            },
        ));
        self.push_producer(producer, vec![what_index], &wiring, what_atoms);
        Ok(())
    }

    fn build_gauge(&mut self, metric: &crate::core::config::GaugeMetric) -> Result<()> {
        let what_index = self.resolve_what_matcher(metric.id, metric.what)?;
        self.check_dimensions(metric.id, &metric.dimensions_in_what)?;
        let wiring = self.wire_metric(metric.id, metric.condition, &[])?;
        let base = self.base_config(
            metric.id,
            metric.bucket_size_millis,
            &metric.dimensions_in_what,
            &wiring,
            metric.split_bucket_for_app_upgrade,
            None,
            0,
        )?;
        let producer = MetricProducer::Gauge(GaugeMetricProducer::new(
            base,
            translate_dimensions(&metric.gauge_fields),
            metric.sampling,
            metric.max_gauge_atoms_per_bucket,
        ));
        let what_atoms = self.what_atoms_of(what_index);
        self.push_producer(producer, vec![what_index], &wiring, what_atoms);
        Ok(())
    }
}

/// Collects the atoms feeding a condition, recursing through combinations.
fn collect_condition_atoms(
    trackers: &[ConditionTracker],
    index: usize,
    matchers: &[AtomMatchingTracker],
    out: &mut AHashSet<i32>,
) {
    match &trackers[index] {
        ConditionTracker::Simple(simple) => {
            for matcher_index in simple.interested_matchers() {
                matchers[matcher_index].collect_atom_ids(matchers, out);
            }
        }
        ConditionTracker::Combination(combination) => {
            for &child in combination.children() {
                collect_condition_atoms(trackers, child, matchers, out);
            }
        }
    }
}
