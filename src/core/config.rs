//! Declarative configuration records.
//!
//! A [`TelemetryConfig`] describes which events to observe (atom matchers),
//! how to combine them into conditions (predicates), and how to aggregate
//! matched events into metric buckets. Configs are plain data: full
//! validation happens when the pipeline installs them, not here.

use serde::{Deserialize, Serialize};

/// Positional intent for a repeated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    First,
    Last,
    /// Every element; only valid for dimension projection and string
    /// transformation.
    All,
    /// At least one element; requires a tuple child matcher unless a string
    /// transformation is declared.
    Any,
}

/// A node in a field-matcher tree, addressing one field (and optionally a
/// position within it) of a structured atom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldMatcher {
    pub field: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldMatcher>,
}

impl FieldMatcher {
    /// A leaf matcher for a top-level field.
    pub fn leaf(field: i32) -> Self {
        Self {
            field,
            position: None,
            children: Vec::new(),
        }
    }

    /// Returns true if any node in the tree declares the given position.
    pub fn has_position(&self, position: Position) -> bool {
        self.position == Some(position)
            || self.children.iter().any(|c| c.has_position(position))
    }
}

/// Declarative regex replacement applied to candidate string fields before
/// value matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringReplacer {
    pub regex: String,
    pub replacement: String,
}

/// The value test applied by a [`FieldValueMatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatcher {
    EqBool(bool),
    EqString(String),
    EqAnyString(Vec<String>),
    NeqAnyString(Vec<String>),
    EqWildcardString(String),
    EqAnyWildcardString(Vec<String>),
    NeqAnyWildcardString(Vec<String>),
    EqInt(i64),
    EqAnyInt(Vec<i64>),
    NeqAnyInt(Vec<i64>),
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
    LtFloat(f32),
    GtFloat(f32),
    /// Descend one repeated-structure level and require every child matcher
    /// to match within the same sub-tree.
    MatchesTuple(Vec<FieldValueMatcher>),
}

/// A filter on one field of an atom, with optional position handling and
/// string transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    pub field: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueMatcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_string: Option<StringReplacer>,
}

impl FieldValueMatcher {
    /// A matcher with a value test and no position or transform.
    pub fn with_value(field: i32, value: ValueMatcher) -> Self {
        Self {
            field,
            position: None,
            value: Some(value),
            replace_string: None,
        }
    }
}

/// Filters events of a single atom by field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAtomMatcher {
    pub atom_id: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_value_matchers: Vec<FieldValueMatcher>,
}

impl SimpleAtomMatcher {
    /// Matches every event of the given atom.
    pub fn for_atom(atom_id: i32) -> Self {
        Self {
            atom_id,
            field_value_matchers: Vec::new(),
        }
    }
}

/// Boolean combinator over child matchers or predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
    Nand,
    Nor,
}

/// One atom matcher: either a simple per-atom filter or a combination of
/// other matchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMatcherConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: AtomMatcherKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomMatcherKind {
    Simple(SimpleAtomMatcher),
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
    },
}

impl AtomMatcherConfig {
    pub fn simple(id: i64, matcher: SimpleAtomMatcher) -> Self {
        Self {
            id,
            kind: AtomMatcherKind::Simple(matcher),
        }
    }

    pub fn combination(id: i64, operation: LogicalOperation, child_ids: Vec<i64>) -> Self {
        Self {
            id,
            kind: AtomMatcherKind::Combination {
                operation,
                child_ids,
            },
        }
    }
}

/// Initial value of a simple predicate before any start/stop is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialValue {
    Unknown,
    False,
}

/// A start/stop/stop-all state machine over matcher firings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePredicate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_all: Option<i64>,
    /// When true, N starts require N stops before the condition falls.
    #[serde(default)]
    pub count_nesting: bool,
    /// Slices the condition by the projected event dimensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<FieldMatcher>,
    /// Defaults to `False` when sliced and `Unknown` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<InitialValue>,
}

/// One predicate: simple or a combination of other predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: PredicateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    Simple(SimplePredicate),
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
    },
}

impl PredicateConfig {
    pub fn simple(id: i64, predicate: SimplePredicate) -> Self {
        Self {
            id,
            kind: PredicateKind::Simple(predicate),
        }
    }

    pub fn combination(id: i64, operation: LogicalOperation, child_ids: Vec<i64>) -> Self {
        Self {
            id,
            kind: PredicateKind::Combination {
                operation,
                child_ids,
            },
        }
    }
}

/// An enumerated, event-driven variable that further partitions metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    pub id: i64,
    /// The atom whose exclusive-state field drives this state.
    pub atom_id: i32,
}

/// Sliding-window anomaly alert over a metric's past buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub metric_id: i64,
    /// Window size including the current bucket.
    pub num_buckets: i64,
    #[serde(default)]
    pub refractory_period_secs: i64,
    pub trigger_if_sum_gt: i64,
    /// Outside `[0, 1]` means never/always; the boundary values are subject
    /// to float imprecision, so use -0.1 and 1.1 instead.
    #[serde(default = "default_probability")]
    pub probability_of_informing: f32,
}

/// Periodic wall-clock alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: i64,
    pub offset_millis: i64,
    pub period_millis: i64,
    #[serde(default = "default_probability")]
    pub probability_of_informing: f32,
}

fn default_probability() -> f32 {
    1.1
}

/// Whether a subscription is bound to an alert or to an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Alert,
    Alarm,
}

/// Binds an alert or alarm to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub rule_type: RuleType,
    pub rule_id: i64,
    pub subscriber_id: i64,
    #[serde(default = "default_probability")]
    pub probability_of_informing: f32,
}

/// Gate on a bucket value before it is included in a report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadThreshold {
    GtInt(i64),
    GteInt(i64),
    LtInt(i64),
    LteInt(i64),
    GtFloat(f64),
    LtFloat(f64),
}

impl UploadThreshold {
    /// Whether an integer bucket value passes this threshold.
    pub fn passes_int(&self, value: i64) -> bool {
        match *self {
            UploadThreshold::GtInt(t) => value > t,
            UploadThreshold::GteInt(t) => value >= t,
            UploadThreshold::LtInt(t) => value < t,
            UploadThreshold::LteInt(t) => value <= t,
            UploadThreshold::GtFloat(t) => (value as f64) > t,
            UploadThreshold::LtFloat(t) => (value as f64) < t,
        }
    }

    /// Whether a float bucket value passes this threshold.
    pub fn passes_float(&self, value: f64) -> bool {
        match *self {
            UploadThreshold::GtInt(t) => value > t as f64,
            UploadThreshold::GteInt(t) => value >= t as f64,
            UploadThreshold::LtInt(t) => value < t as f64,
            UploadThreshold::LteInt(t) => value <= t as f64,
            UploadThreshold::GtFloat(t) => value > t,
            UploadThreshold::LtFloat(t) => value < t,
        }
    }
}

/// Duration aggregation shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    /// Measure of the union of all running intervals.
    #[default]
    Or,
    /// Longest single interval per dimension.
    Max,
}

/// Aggregation applied to a value metric's field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueAggregation {
    #[default]
    Sum,
    Min,
    Max,
}

/// Which gauge sample(s) to keep per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSampling {
    /// Keep only the first event in each bucket.
    #[default]
    FirstPerBucket,
    /// Keep every event, bounded by the per-bucket cap.
    AllPerBucket,
}

const DEFAULT_BUCKET_MILLIS: i64 = 60 * 60 * 1000;

fn default_bucket_millis() -> i64 {
    DEFAULT_BUCKET_MILLIS
}

/// Counts matcher firings per bucket and dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMetric {
    pub id: i64,
    /// Matcher id whose firings are counted.
    pub what: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slice_by_state: Vec<i64>,
    #[serde(default = "default_bucket_millis")]
    pub bucket_size_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<UploadThreshold>,
    #[serde(default)]
    pub split_bucket_for_app_upgrade: bool,
}

/// Aggregates the time a predicate holds, per bucket and dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetric {
    pub id: i64,
    /// Predicate id whose true-time is measured; must be a simple predicate.
    pub what: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub aggregation: DurationAggregation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slice_by_state: Vec<i64>,
    #[serde(default = "default_bucket_millis")]
    pub bucket_size_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<UploadThreshold>,
    #[serde(default)]
    pub split_bucket_for_app_upgrade: bool,
}

/// Records every matched event verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetric {
    pub id: i64,
    pub what: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
}

/// Aggregates a numeric field of matched (or pulled) events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetric {
    pub id: i64,
    pub what: i64,
    pub value_field: FieldMatcher,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregation_types: Vec<ValueAggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default = "default_bucket_millis")]
    pub bucket_size_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<UploadThreshold>,
    /// On a pulled-source reset, take the new absolute value instead of a
    /// negative diff.
    #[serde(default)]
    pub use_absolute_value_on_reset: bool,
    #[serde(default)]
    pub min_bucket_size_nanos: i64,
    #[serde(default)]
    pub max_pull_delay_sec: i64,
    #[serde(default)]
    pub split_bucket_for_app_upgrade: bool,
}

/// Snapshots field values of matched (or pulled) events per bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetric {
    pub id: i64,
    pub what: i64,
    pub gauge_fields: FieldMatcher,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub sampling: GaugeSampling,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default = "default_bucket_millis")]
    pub bucket_size_millis: i64,
    #[serde(default = "default_max_gauge_atoms")]
    pub max_gauge_atoms_per_bucket: usize,
    #[serde(default)]
    pub split_bucket_for_app_upgrade: bool,
}

fn default_max_gauge_atoms() -> usize {
    10
}

/// A complete declarative configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub atom_matchers: Vec<AtomMatcherConfig>,
    pub predicates: Vec<PredicateConfig>,
    pub states: Vec<StateConfig>,
    pub alerts: Vec<Alert>,
    pub alarms: Vec<Alarm>,
    pub subscriptions: Vec<Subscription>,
    pub count_metrics: Vec<CountMetric>,
    pub duration_metrics: Vec<DurationMetric>,
    pub event_metrics: Vec<EventMetric>,
    pub value_metrics: Vec<ValueMetric>,
    pub gauge_metrics: Vec<GaugeMetric>,
}

impl TelemetryConfig {
    /// Total number of metric definitions of all kinds.
    pub fn metric_count(&self) -> usize {
        self.count_metrics.len()
            + self.duration_metrics.len()
            + self.event_metrics.len()
            + self.value_metrics.len()
            + self.gauge_metrics.len()
    }
}
