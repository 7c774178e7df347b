use serde::{Deserialize, Serialize};
use std::fmt;

/// Names one installed configuration instance for reporting and subscriber
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    uid: i32,
    id: i64,
}

impl ConfigKey {
    /// Creates a config key from the installing uid and the config id.
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.uid, self.id)
    }
}

/// Result of evaluating one atom matcher against one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    /// Not yet evaluated during this event dispatch.
    NotComputed,
    Matched,
    NotMatched,
}

/// The tri-state value of a condition, plus the not-yet-evaluated sentinel
/// used by per-event caches.
///
/// The numeric order matters: combining two states with [`ConditionState::or`]
/// picks the larger one, so an evaluated value always wins over
/// `NotEvaluated` and `True` wins over everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConditionState {
    NotEvaluated = -2,
    Unknown = -1,
    False = 0,
    True = 1,
}

impl ConditionState {
    /// Combines two states, keeping the stronger one.
    pub fn or(self, other: ConditionState) -> ConditionState {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// Logical negation; `Unknown` stays `Unknown`.
    pub fn not(self) -> ConditionState {
        match self {
            ConditionState::True => ConditionState::False,
            ConditionState::False => ConditionState::True,
            other => other,
        }
    }
}

impl From<bool> for ConditionState {
    fn from(value: bool) -> Self {
        if value {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }
}

/// Severity of a data-corruption event. Severities compose pointwise and
/// only grow within a config generation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum DataCorruptionSeverity {
    #[default]
    None = 0,
    /// Cleared when the next report is emitted.
    ResetOnDump = 1,
    /// Persists in every subsequent report until the config is reset; used
    /// when the lost input fed a condition or state, leaving prior counter
    /// states untrustworthy.
    Unrecoverable = 2,
}

impl DataCorruptionSeverity {
    /// Pointwise composition: `None < ResetOnDump < Unrecoverable`.
    pub fn escalate(self, other: DataCorruptionSeverity) -> DataCorruptionSeverity {
        self.max(other)
    }
}

/// The two disjoint kinds of event loss the engine accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataCorruptionReason {
    /// The transport lost events before they reached the queue.
    SocketLoss,
    /// The bounded event queue rejected a push.
    QueueOverflow,
}

/// Why a bucket was not produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketDropReason {
    /// The condition was never evaluated within the bucket.
    ConditionUnknown,
    /// A pull returned an empty result.
    NoData,
    /// The bucket was narrower than the configured minimum.
    BucketTooSmall,
    /// The bucket was split by an app upgrade.
    Upgrade,
    /// The bucket was drained by an explicit dump.
    Dump,
    /// The triggering event arrived after the bucket had already closed.
    EventTooLate,
    /// The pull failed outright.
    PullFailed,
    /// The pull completed later than `max_pull_delay_sec`.
    PullDelayTooHigh,
    /// More than one whole bucket elapsed without events.
    MultipleBucketsSkipped,
}
