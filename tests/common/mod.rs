//! Shared fixtures for integration tests.
#![allow(dead_code)]

use tally::core::config::{
    AtomMatcherConfig, DurationAggregation, DurationMetric, FieldMatcher, FieldValueMatcher,
    Position, PredicateConfig, SimpleAtomMatcher, SimplePredicate, TelemetryConfig, ValueMatcher,
};
use tally::event::LogEvent;

pub const NS_PER_SEC: i64 = 1_000_000_000;
pub const SCREEN_ATOM: i32 = 29;
pub const WAKELOCK_ATOM: i32 = 10;

pub const SCREEN_ON: i32 = 2;
pub const SCREEN_OFF: i32 = 1;

pub const SCREEN_ON_MATCHER: i64 = 1;
pub const SCREEN_OFF_MATCHER: i64 = 2;
pub const ACQUIRE_MATCHER: i64 = 3;
pub const RELEASE_MATCHER: i64 = 4;
pub const SCREEN_IS_ON_PREDICATE: i64 = 10;
pub const WAKELOCK_HELD_PREDICATE: i64 = 11;
pub const DURATION_METRIC_ID: i64 = 100;

pub fn screen_event(ts_ns: i64, state: i32) -> LogEvent {
    LogEvent::builder(SCREEN_ATOM, ts_ns).write_int(state).build()
}

/// A wakelock event: attribution chain in field 1, acquire/release state in
/// field 2.
pub fn wakelock_event(ts_ns: i64, uids: &[(i32, &str)], acquired: bool) -> LogEvent {
    LogEvent::builder(WAKELOCK_ATOM, ts_ns)
        .write_attribution_chain(uids)
        .write_int(if acquired { 1 } else { 0 })
        .build()
}

pub fn screen_matchers() -> Vec<AtomMatcherConfig> {
    vec![
        AtomMatcherConfig::simple(
            SCREEN_ON_MATCHER,
            SimpleAtomMatcher {
                atom_id: SCREEN_ATOM,
                field_value_matchers: vec![FieldValueMatcher::with_value(
                    1,
                    ValueMatcher::EqInt(SCREEN_ON as i64),
                )],
            },
        ),
        AtomMatcherConfig::simple(
            SCREEN_OFF_MATCHER,
            SimpleAtomMatcher {
                atom_id: SCREEN_ATOM,
                field_value_matchers: vec![FieldValueMatcher::with_value(
                    1,
                    ValueMatcher::EqInt(SCREEN_OFF as i64),
                )],
            },
        ),
    ]
}

pub fn wakelock_matchers() -> Vec<AtomMatcherConfig> {
    vec![
        AtomMatcherConfig::simple(
            ACQUIRE_MATCHER,
            SimpleAtomMatcher {
                atom_id: WAKELOCK_ATOM,
                field_value_matchers: vec![FieldValueMatcher::with_value(
                    2,
                    ValueMatcher::EqInt(1),
                )],
            },
        ),
        AtomMatcherConfig::simple(
            RELEASE_MATCHER,
            SimpleAtomMatcher {
                atom_id: WAKELOCK_ATOM,
                field_value_matchers: vec![FieldValueMatcher::with_value(
                    2,
                    ValueMatcher::EqInt(0),
                )],
            },
        ),
    ]
}

/// Attribution-chain first-uid dimensions for the wakelock atom.
pub fn first_uid_dimensions() -> FieldMatcher {
    FieldMatcher {
        field: WAKELOCK_ATOM,
        position: None,
        children: vec![FieldMatcher {
            field: 1,
            position: Some(Position::First),
            children: vec![FieldMatcher::leaf(1)],
        }],
    }
}

/// A config with a wakelock-held duration metric sliced by the acquiring
/// uid, bucketed at one minute.
pub fn wakelock_duration_config(aggregation: DurationAggregation) -> TelemetryConfig {
    TelemetryConfig {
        atom_matchers: wakelock_matchers(),
        predicates: vec![PredicateConfig::simple(
            WAKELOCK_HELD_PREDICATE,
            SimplePredicate {
                start: Some(ACQUIRE_MATCHER),
                stop: Some(RELEASE_MATCHER),
                stop_all: None,
                count_nesting: false,
                dimensions: Some(first_uid_dimensions()),
                initial_value: None,
            },
        )],
        duration_metrics: vec![DurationMetric {
            id: DURATION_METRIC_ID,
            what: WAKELOCK_HELD_PREDICATE,
            condition: None,
            aggregation,
            dimensions_in_what: None,
            slice_by_state: Vec::new(),
            bucket_size_millis: 60_000,
            threshold: None,
            split_bucket_for_app_upgrade: true,
        }],
        ..Default::default()
    }
}
