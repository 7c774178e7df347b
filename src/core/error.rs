use thiserror::Error;

/// Reasons a configuration is rejected at install time.
///
/// Installation fails closed: a config that produces any of these is never
/// partially activated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidConfigReason {
    #[error("matcher {0} references unknown matcher id {1}")]
    MatcherChildNotFound(i64, i64),

    #[error("duplicate matcher id {0}")]
    DuplicateMatcherId(i64),

    #[error("matcher {0} has no children")]
    MatcherNoChildren(i64),

    #[error("cycle detected through matcher id {0}")]
    MatcherCycle(i64),

    #[error("matcher {0} misuses position: {1}")]
    MatcherPositionMisuse(i64, &'static str),

    #[error("matcher {0} declares an invalid replacement regex")]
    MatcherInvalidRegex(i64),

    #[error("duplicate predicate id {0}")]
    DuplicatePredicateId(i64),

    #[error("predicate {0} references unknown matcher id {1}")]
    PredicateMatcherNotFound(i64, i64),

    #[error("predicate {0} references unknown predicate id {1}")]
    PredicateChildNotFound(i64, i64),

    #[error("cycle detected through predicate id {0}")]
    PredicateCycle(i64),

    #[error("predicate {0} has more than one sliced child")]
    PredicateTooManySlicedChildren(i64),

    #[error("predicate {0} has no children")]
    PredicateNoChildren(i64),

    #[error("metric {0} references unknown matcher id {1}")]
    MetricMatcherNotFound(i64, i64),

    #[error("metric {0} references unknown predicate id {1}")]
    MetricConditionNotFound(i64, i64),

    #[error("metric {0} references unknown state id {1}")]
    MetricStateNotFound(i64, i64),

    #[error("duplicate metric id {0}")]
    DuplicateMetricId(i64),

    #[error("metric {0} has a zero-width bucket")]
    MetricZeroBucketSize(i64),

    #[error("metric {0} is missing its observed matcher")]
    MetricMissingWhat(i64),

    #[error("alert {0} on metric {1} failed to serialize for hashing")]
    AlertSerializationFailed(i64, i64),

    #[error("alert {0} references unknown metric id {1}")]
    AlertMetricNotFound(i64, i64),

    #[error("alert {0} is bound to metric {1}, which does not produce alertable buckets")]
    AlertUnsupportedMetricKind(i64, i64),

    #[error("alert {0} has invalid num_buckets {1}")]
    AlertInvalidNumBuckets(i64, i64),

    #[error("duplicate alert id {0}")]
    DuplicateAlertId(i64),

    #[error("alarm {0} has invalid period {1}ms")]
    AlarmInvalidPeriod(i64, i64),

    #[error("subscription {0} references unknown rule id {1}")]
    SubscriptionRuleNotFound(i64, i64),

    #[error("duration metric {0} uses MAX aggregation and cannot be sliced by state")]
    DurationMaxSliceByState(i64),

    #[error("duration metric {0} must observe a simple predicate")]
    DurationWhatNotSimple(i64),
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum TallyError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] InvalidConfigReason),

    #[error("config {0} is not installed")]
    ConfigNotFound(String),

    #[error("event queue is full: oldest pending event at {oldest_timestamp_ns}ns, size {size}")]
    QueueFull {
        oldest_timestamp_ns: i64,
        size: usize,
    },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("field depth {0} exceeds the maximum nesting depth")]
    DepthExceeded(usize),

    #[error("pull failed for atom {atom_id}: {reason}")]
    PullFailed { atom_id: i32, reason: String },

    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, TallyError>;

impl TallyError {
    /// Creates a malformed-event error.
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedEvent(msg.into())
    }

    /// Creates a pull-failure error.
    pub fn pull_failed<S: Into<String>>(atom_id: i32, reason: S) -> Self {
        Self::PullFailed {
            atom_id,
            reason: reason.into(),
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) | Self::ConfigNotFound(_) => "config",
            Self::QueueFull { .. } => "queue",
            Self::MalformedEvent(_) | Self::DepthExceeded(_) => "event",
            Self::PullFailed { .. } => "pull",
            Self::Serialization(_) => "serialization",
            Self::Regex(_) => "matcher",
        }
    }
}
