//! Condition tracking scenarios driven through real matcher evaluation.

mod common;

use common::*;
use tally::condition::{ConditionKey, SimpleConditionTracker};
use tally::core::config::{Position, SimplePredicate};
use tally::core::types::{ConditionState, ConfigKey};
use tally::event::field::translate_field_matcher;
use tally::event::HashableDimensionKey;
use tally::matchers::{evaluate_matchers, AtomMatchingTracker, SimpleMatchingTracker};
use tally::stats::EngineStats;
use tally::uid::UidMap;

fn compiled_screen_matchers() -> Vec<AtomMatchingTracker> {
    screen_matchers()
        .into_iter()
        .map(|config| match config.kind {
            tally::core::config::AtomMatcherKind::Simple(simple) => AtomMatchingTracker::Simple(
                SimpleMatchingTracker::compile(config.id, &simple).unwrap(),
            ),
            _ => unreachable!(),
        })
        .collect()
}

/// Simple condition over start=screen-on, stop=screen-off; matcher arena
/// indices 0 and 1.
fn screen_is_on_condition(count_nesting: bool) -> SimpleConditionTracker {
    SimpleConditionTracker::new(
        ConfigKey::new(0, 1),
        SCREEN_IS_ON_PREDICATE,
        0,
        &SimplePredicate {
            start: Some(SCREEN_ON_MATCHER),
            stop: Some(SCREEN_OFF_MATCHER),
            stop_all: None,
            count_nesting,
            dimensions: None,
            initial_value: None,
        },
        Some(0),
        Some(1),
        None,
        Vec::new(),
    )
}

fn evaluate(
    tracker: &mut SimpleConditionTracker,
    matchers: &[AtomMatchingTracker],
    event: &tally::event::LogEvent,
    stats: &EngineStats,
) -> (ConditionState, bool) {
    let uid_map = UidMap::new();
    let results = evaluate_matchers(matchers, &uid_map, event);
    let mut cache = [ConditionState::NotEvaluated];
    let mut changed = [false];
    tracker.evaluate_condition(event, &results.states, &mut cache, &mut changed, stats);
    (cache[0], changed[0])
}

#[test]
fn screen_condition_tracks_on_off() {
    // Screen-off at t=50 drives unknown -> false; screen-on at t=100
    // drives false -> true; both are reported as changes.
    let stats = EngineStats::new();
    let matchers = compiled_screen_matchers();
    let mut condition = screen_is_on_condition(false);

    let (state, changed) = evaluate(
        &mut condition,
        &matchers,
        &screen_event(50, SCREEN_OFF),
        &stats,
    );
    assert_eq!(state, ConditionState::False);
    assert!(changed);

    let (state, changed) = evaluate(
        &mut condition,
        &matchers,
        &screen_event(100, SCREEN_ON),
        &stats,
    );
    assert_eq!(state, ConditionState::True);
    assert!(changed);
}

#[test]
fn nested_condition_needs_matching_stop_count() {
    // With nesting, two screen-ons hold the condition true through the
    // first screen-off; only the second drops it.
    let stats = EngineStats::new();
    let matchers = compiled_screen_matchers();
    let mut condition = screen_is_on_condition(true);

    let expectations = [
        (SCREEN_ON, ConditionState::True, true),
        (SCREEN_ON, ConditionState::True, false),
        (SCREEN_OFF, ConditionState::True, false),
        (SCREEN_OFF, ConditionState::False, true),
    ];
    for (i, (event_state, expected_state, expected_changed)) in
        expectations.into_iter().enumerate()
    {
        let (state, changed) = evaluate(
            &mut condition,
            &matchers,
            &screen_event((i as i64 + 1) * 10, event_state),
            &stats,
        );
        assert_eq!(state, expected_state, "step {}", i);
        assert_eq!(changed, expected_changed, "step {}", i);
    }
}

#[test]
fn unsliced_condition_reports_unknown_until_first_event() {
    // Property: an unsliced condition with no declared initial value is
    // unknown until the first start or stop arrives.
    let stats = EngineStats::new();
    let matchers = compiled_screen_matchers();
    let mut condition = screen_is_on_condition(false);

    // An unrelated event of the same atom matches neither start nor stop.
    let other = tally::event::LogEvent::builder(SCREEN_ATOM, 10).write_int(3).build();
    let (state, changed) = evaluate(&mut condition, &matchers, &other, &stats);
    assert_eq!(state, ConditionState::Unknown);
    assert!(!changed);
}

#[test]
fn sliced_condition_defaults_to_false_for_unseen_keys() {
    // Property: a sliced condition with no declared initial value reports
    // false for any key never seen.
    let mut dims = Vec::new();
    translate_field_matcher(&first_uid_dimensions(), &mut dims);
    let condition = SimpleConditionTracker::new(
        ConfigKey::new(0, 1),
        WAKELOCK_HELD_PREDICATE,
        0,
        &SimplePredicate {
            start: Some(ACQUIRE_MATCHER),
            stop: Some(RELEASE_MATCHER),
            stop_all: None,
            count_nesting: true,
            dimensions: Some(first_uid_dimensions()),
            initial_value: None,
        },
        Some(0),
        Some(1),
        None,
        dims,
    );

    let mut key = ConditionKey::default();
    key.insert(WAKELOCK_HELD_PREDICATE, HashableDimensionKey::default());
    let mut cache = [ConditionState::NotEvaluated];
    condition.is_condition_met(&key, false, &mut cache);
    assert_eq!(cache[0], ConditionState::False);
}

#[test]
fn condition_sliced_by_last_uid_sets_only_last_dimension() {
    // An attribution chain of three uids with position=LAST: only the
    // uid-333 dimension turns true; uid-111 queries report the initial
    // value.
    let stats = EngineStats::new();
    let uid_map = UidMap::new();

    let dims_config = tally::core::config::FieldMatcher {
        field: WAKELOCK_ATOM,
        position: None,
        children: vec![tally::core::config::FieldMatcher {
            field: 1,
            position: Some(Position::Last),
            children: vec![tally::core::config::FieldMatcher::leaf(1)],
        }],
    };
    let mut dims = Vec::new();
    translate_field_matcher(&dims_config, &mut dims);
    let last_uid_matcher = dims[0];

    let mut condition = SimpleConditionTracker::new(
        ConfigKey::new(0, 1),
        WAKELOCK_HELD_PREDICATE,
        0,
        &SimplePredicate {
            start: Some(ACQUIRE_MATCHER),
            stop: Some(RELEASE_MATCHER),
            stop_all: None,
            count_nesting: true,
            dimensions: Some(dims_config),
            initial_value: None,
        },
        Some(0),
        Some(1),
        None,
        dims,
    );

    let matchers: Vec<AtomMatchingTracker> = wakelock_matchers()
        .into_iter()
        .map(|config| match config.kind {
            tally::core::config::AtomMatcherKind::Simple(simple) => AtomMatchingTracker::Simple(
                SimpleMatchingTracker::compile(config.id, &simple).unwrap(),
            ),
            _ => unreachable!(),
        })
        .collect();

    let start = wakelock_event(100, &[(111, "a"), (222, "b"), (333, "c")], true);
    let results = evaluate_matchers(&matchers, &uid_map, &start);
    let mut cache = [ConditionState::NotEvaluated];
    let mut changed = [false];
    condition.evaluate_condition(&start, &results.states, &mut cache, &mut changed, &stats);
    assert_eq!(cache[0], ConditionState::True);
    assert!(changed[0]);
    assert_eq!(condition.sliced_dimension_map().len(), 1);

    // Build query keys by projecting single-uid events through the same
    // dimension matcher.
    let key_for = |uid: i32| {
        let event = wakelock_event(100, &[(uid, "x")], true);
        tally::event::filter_values(&[last_uid_matcher], event.values())
    };

    let mut query = ConditionKey::default();
    query.insert(WAKELOCK_HELD_PREDICATE, key_for(333));
    let mut cache = [ConditionState::NotEvaluated];
    condition.is_condition_met(&query, false, &mut cache);
    assert_eq!(cache[0], ConditionState::True);

    let mut query = ConditionKey::default();
    query.insert(WAKELOCK_HELD_PREDICATE, key_for(111));
    let mut cache = [ConditionState::NotEvaluated];
    condition.is_condition_met(&query, false, &mut cache);
    assert_eq!(cache[0], ConditionState::False);
}
