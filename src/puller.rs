//! Pull interface to external telemetry sources.

use crate::event::LogEvent;

/// Outcome status of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// The pull completed; an empty event vector means "no data".
    Success,
    Timeout,
    Error,
}

/// A completed pull: status, the elapsed time the data describes, and the
/// pulled events.
#[derive(Debug)]
pub struct PullResult {
    pub status: PullStatus,
    pub elapsed_pulled_ns: i64,
    pub events: Vec<LogEvent>,
}

impl PullResult {
    pub fn success(elapsed_pulled_ns: i64, events: Vec<LogEvent>) -> Self {
        Self {
            status: PullStatus::Success,
            elapsed_pulled_ns,
            events,
        }
    }

    pub fn failure(status: PullStatus) -> Self {
        Self {
            status,
            elapsed_pulled_ns: 0,
            events: Vec::new(),
        }
    }
}

/// Pulls a snapshot of events for an atom on demand.
pub trait Puller: Send + Sync {
    fn pull(&self, atom_id: i32) -> PullResult;
}
