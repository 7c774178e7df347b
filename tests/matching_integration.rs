//! Matcher algebra checked against a brute-force reference.

mod common;

use common::*;
use tally::core::config::{
    AtomMatcherKind, FieldValueMatcher, LogicalOperation, ValueMatcher,
};
use tally::core::types::MatchingState;
use tally::event::LogEvent;
use tally::matchers::{
    evaluate_matchers, matches_simple, AtomMatchingTracker, CombinationMatchingTracker,
    SimpleMatchingTracker,
};
use tally::uid::UidMap;

/// A simple matcher matches exactly when the tag matches and every child
/// field matcher matches.
#[test]
fn simple_matcher_is_tag_and_all_children() {
    let uid_map = UidMap::new();
    let matcher = SimpleMatchingTracker::compile(
        1,
        &tally::core::config::SimpleAtomMatcher {
            atom_id: WAKELOCK_ATOM,
            field_value_matchers: vec![
                FieldValueMatcher::with_value(2, ValueMatcher::EqInt(1)),
            ],
        },
    )
    .unwrap();

    // Both children satisfied.
    let event = wakelock_event(100, &[(111, "a")], true);
    assert!(matches_simple(&uid_map, &matcher, &event).matched);

    // Tag matches, value test fails.
    let released = wakelock_event(100, &[(111, "a")], false);
    assert!(!matches_simple(&uid_map, &matcher, &released).matched);

    // Value present elsewhere, tag differs.
    let foreign = LogEvent::builder(SCREEN_ATOM, 100).write_int(1).build();
    assert!(!matches_simple(&uid_map, &matcher, &foreign).matched);
}

#[test]
fn combination_matchers_agree_with_truth_table() {
    let uid_map = UidMap::new();
    let mut trackers: Vec<AtomMatchingTracker> = screen_matchers()
        .into_iter()
        .map(|config| match config.kind {
            AtomMatcherKind::Simple(simple) => AtomMatchingTracker::Simple(
                SimpleMatchingTracker::compile(config.id, &simple).unwrap(),
            ),
            _ => unreachable!(),
        })
        .collect();
    // Indices 0 (on) and 1 (off) feed each combination.
    for (id, operation) in [
        (10, LogicalOperation::And),
        (11, LogicalOperation::Or),
        (12, LogicalOperation::Nand),
        (13, LogicalOperation::Nor),
    ] {
        trackers.push(AtomMatchingTracker::Combination(
            CombinationMatchingTracker::new(id, operation, vec![0, 1]),
        ));
    }
    trackers.push(AtomMatchingTracker::Combination(
        CombinationMatchingTracker::new(14, LogicalOperation::Not, vec![0]),
    ));

    for state in [SCREEN_ON, SCREEN_OFF, 3] {
        let event = screen_event(100, state);
        let results = evaluate_matchers(&trackers, &uid_map, &event);

        let on = results.states[0] == MatchingState::Matched;
        let off = results.states[1] == MatchingState::Matched;
        let expect = |index: usize, value: bool| {
            assert_eq!(
                results.states[index] == MatchingState::Matched,
                value,
                "matcher {} for state {}",
                index,
                state
            );
        };
        expect(2, on && off);
        expect(3, on || off);
        expect(4, !(on && off));
        expect(5, !(on || off));
        expect(6, !on);
    }
}

/// Field paths survive an encode/decode round trip, and the last-child
/// decoration sits exactly on the deepest lane.
#[test]
fn field_encoding_round_trip() {
    use tally::event::field::{Field, MAX_LOG_DEPTH};

    for depth in 0..=MAX_LOG_DEPTH {
        for a in [1, 2, 63, 127] {
            for b in [1, 5, 127] {
                for c in [1, 9, 127] {
                    let pos = [a, b, c];
                    let mut field = Field::from_path(1, &pos, depth);
                    for (lane, expected) in pos.iter().enumerate().take(depth + 1) {
                        assert_eq!(field.pos_at_depth(lane), *expected);
                        assert!(!field.is_last_pos(lane));
                    }
                    assert_eq!(field.depth(), depth as i32);

                    field.decorate_last_pos(depth);
                    for lane in 0..=depth {
                        assert_eq!(field.is_last_pos(lane), lane == depth);
                        // Decoration does not disturb the position bits.
                        assert_eq!(field.pos_at_depth(lane), pos[lane]);
                    }
                }
            }
        }
    }
}
