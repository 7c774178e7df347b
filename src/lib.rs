//! Tally - structured-telemetry aggregation engine.
//!
//! Tally ingests a live stream of typed events and applies declarative
//! configurations that describe which events to observe, how to combine
//! them into logical conditions, and how to aggregate matched events into
//! metric buckets with per-dimension slicing, anomaly detection, and
//! subscriber notification.
//!
//! # Features
//!
//! - **Mask-based matching**: field addressing compiles to a 32-bit
//!   mask-and-compare on the hot path
//! - **Condition tracking**: start/stop/stop-all state machines and
//!   three-valued boolean combinations, sliced per dimension
//! - **Bucketed metrics**: count, duration (OR'd and MAX), event, value,
//!   and gauge producers with partial-bucket splits
//! - **Anomaly detection**: sliding-window sums over past buckets with
//!   refractory periods and alarm prediction
//! - **Bounded ingestion**: a fixed-capacity queue with drop-oldest
//!   accounting on overflow
//!
//! # Architecture
//!
//! The crate is organized around the dispatch pipeline:
//! - `event`: typed events, field addressing, and the bounded queue
//! - `matchers`: per-event simple and combinational matching
//! - `condition`: condition trackers and the query wizard
//! - `metrics`: metric producers and duration trackers
//! - `anomaly`: anomaly and wall-clock alarm trackers
//! - `pipeline`: config installation and the per-event dispatcher
//!
//! # Example
//!
//! ```no_run
//! use tally::core::types::ConfigKey;
//! use tally::core::TelemetryConfig;
//! use tally::Engine;
//!
//! let mut engine = Engine::new(5000, 0);
//! let config = TelemetryConfig::default();
//! engine.install_config(ConfigKey::new(1000, 1), &config, 0, 0)?;
//! loop {
//!     engine.process_next();
//! }
//! # Ok::<(), tally::core::TallyError>(())
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod anomaly;
pub mod condition;
pub mod core;
pub mod event;
pub mod matchers;
pub mod metrics;
pub mod pipeline;
pub mod puller;
pub mod report;
pub mod stats;
pub mod subscriber;
pub mod uid;

pub use crate::core::{Result, TallyError, TelemetryConfig};
pub use crate::event::{EventQueue, LogEvent};
pub use crate::pipeline::Engine;
pub use crate::report::ConfigReport;
pub use crate::stats::EngineStats;
