//! Atom-matching trackers.
//!
//! A simple tracker filters events of one atom by descending the sorted
//! value vector: narrow the range to the addressed field, apply position
//! handling, then run the value test. A combination tracker is a boolean
//! operation over other trackers' results. Results are cached per event
//! dispatch so combination trackers never recompute a shared child.

pub mod wildcard;

use crate::core::config::{
    FieldValueMatcher, LogicalOperation, Position, SimpleAtomMatcher, ValueMatcher,
};
use crate::core::error::InvalidConfigReason;
use crate::core::types::MatchingState;
use crate::event::{is_attribution_uid_field, FieldValue, LogEvent, Value};
use crate::event::field::MAX_LOG_DEPTH;
use crate::uid::{well_known_name, well_known_uid, UidMap};
use regex::Regex;
use std::sync::Arc;
use wildcard::wildcard_match;

/// Outcome of matching one event against one simple matcher.
#[derive(Debug, Default)]
pub struct MatchResult {
    pub matched: bool,
    /// Present when a string transformation fired; downstream consumers see
    /// this event instead of the original.
    pub transformed_event: Option<Box<LogEvent>>,
}

impl MatchResult {
    fn no_match() -> Self {
        Self::default()
    }
}

/// A compiled regex replacement.
#[derive(Debug, Clone)]
pub struct StringTransform {
    regex: Regex,
    replacement: String,
}

/// Value test compiled from config, with tuple children compiled
/// recursively and regexes validated up front.
#[derive(Debug, Clone)]
pub enum CompiledValueMatcher {
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
    MatchesTuple(Vec<CompiledFieldValueMatcher>),
}

/// One field filter of a simple matcher, compiled and validated.
#[derive(Debug, Clone)]
pub struct CompiledFieldValueMatcher {
    field: i32,
    position: Option<Position>,
    value: Option<CompiledValueMatcher>,
    transform: Option<StringTransform>,
}

/// Compiles and validates a field-value matcher tree.
///
/// Rules enforced here, not at match time: ALL and ANY positions require a
/// tuple child or a string transform; a tuple matcher cannot carry its own
/// transform; tuples cannot nest past the maximum depth; replacement
/// regexes must compile.
pub fn compile_field_value_matcher(
    matcher_id: i64,
    cfg: &FieldValueMatcher,
    depth: usize,
) -> Result<CompiledFieldValueMatcher, InvalidConfigReason> {
    if depth > MAX_LOG_DEPTH {
        return Err(InvalidConfigReason::MatcherPositionMisuse(
            matcher_id,
            "tuple nesting exceeds the maximum depth",
        ));
    }

    let is_tuple = matches!(cfg.value, Some(ValueMatcher::MatchesTuple(_)));
    if matches!(cfg.position, Some(Position::All) | Some(Position::Any))
        && !is_tuple
        && cfg.replace_string.is_none()
    {
        return Err(InvalidConfigReason::MatcherPositionMisuse(
            matcher_id,
            "ALL/ANY position requires a tuple matcher or a string transform",
        ));
    }
    if is_tuple && cfg.replace_string.is_some() {
        return Err(InvalidConfigReason::MatcherPositionMisuse(
            matcher_id,
            "string transform is not allowed on a tuple matcher",
        ));
    }
    if cfg.value.is_none() && cfg.replace_string.is_none() && cfg.position.is_some() {
        return Err(InvalidConfigReason::MatcherPositionMisuse(
            matcher_id,
            "positional matcher without a value test or transform",
        ));
    }

    let transform = match &cfg.replace_string {
        Some(replacer) => Some(StringTransform {
            regex: Regex::new(&replacer.regex)
                .map_err(|_| InvalidConfigReason::MatcherInvalidRegex(matcher_id))?,
            replacement: replacer.replacement.clone(),
        }),
        None => None,
    };

    let value = match &cfg.value {
        None => None,
        Some(ValueMatcher::MatchesTuple(children)) => {
            if children.is_empty() {
                return Err(InvalidConfigReason::MatcherPositionMisuse(
                    matcher_id,
                    "empty tuple matcher",
                ));
            }
            let compiled = children
                .iter()
                .map(|c| compile_field_value_matcher(matcher_id, c, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Some(CompiledValueMatcher::MatchesTuple(compiled))
        }
        Some(other) => Some(compile_leaf_value_matcher(other)),
    };

    Ok(CompiledFieldValueMatcher {
        field: cfg.field,
        position: cfg.position,
        value,
        transform,
    })
}

fn compile_leaf_value_matcher(cfg: &ValueMatcher) -> CompiledValueMatcher {
    match cfg {
        ValueMatcher::EqBool(v) => CompiledValueMatcher::EqBool(*v),
        ValueMatcher::EqString(v) => CompiledValueMatcher::EqString(v.clone()),
        ValueMatcher::EqAnyString(v) => CompiledValueMatcher::EqAnyString(v.clone()),
        ValueMatcher::NeqAnyString(v) => CompiledValueMatcher::NeqAnyString(v.clone()),
        ValueMatcher::EqWildcardString(v) => CompiledValueMatcher::EqWildcardString(v.clone()),
        ValueMatcher::EqAnyWildcardString(v) => {
            CompiledValueMatcher::EqAnyWildcardString(v.clone())
        }
        ValueMatcher::NeqAnyWildcardString(v) => {
            CompiledValueMatcher::NeqAnyWildcardString(v.clone())
        }
        ValueMatcher::EqInt(v) => CompiledValueMatcher::EqInt(*v),
        ValueMatcher::EqAnyInt(v) => CompiledValueMatcher::EqAnyInt(v.clone()),
        ValueMatcher::NeqAnyInt(v) => CompiledValueMatcher::NeqAnyInt(v.clone()),
        ValueMatcher::LtInt(v) => CompiledValueMatcher::LtInt(*v),
        ValueMatcher::GtInt(v) => CompiledValueMatcher::GtInt(*v),
        ValueMatcher::LteInt(v) => CompiledValueMatcher::LteInt(*v),
        ValueMatcher::GteInt(v) => CompiledValueMatcher::GteInt(*v),
        ValueMatcher::LtFloat(v) => CompiledValueMatcher::LtFloat(*v),
        ValueMatcher::GtFloat(v) => CompiledValueMatcher::GtFloat(*v),
        ValueMatcher::MatchesTuple(_) => unreachable!("tuples are compiled recursively"),
    }
}

/// A compiled simple atom matcher.
#[derive(Debug, Clone)]
pub struct SimpleMatchingTracker {
    id: i64,
    atom_id: i32,
    matchers: Vec<CompiledFieldValueMatcher>,
}

impl SimpleMatchingTracker {
    pub fn compile(id: i64, cfg: &SimpleAtomMatcher) -> Result<Self, InvalidConfigReason> {
        let matchers = cfg
            .field_value_matchers
            .iter()
            .map(|m| compile_field_value_matcher(id, m, 0))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id,
            atom_id: cfg.atom_id,
            matchers,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn atom_id(&self) -> i32 {
        self.atom_id
    }
}

/// Boolean combination over other trackers, referenced by arena index.
#[derive(Debug, Clone)]
pub struct CombinationMatchingTracker {
    id: i64,
    operation: LogicalOperation,
    children: Vec<usize>,
}

impl CombinationMatchingTracker {
    pub fn new(id: i64, operation: LogicalOperation, children: Vec<usize>) -> Self {
        Self {
            id,
            operation,
            children,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

/// One atom-matching tracker in the arena.
#[derive(Debug, Clone)]
pub enum AtomMatchingTracker {
    Simple(SimpleMatchingTracker),
    Combination(CombinationMatchingTracker),
}

impl AtomMatchingTracker {
    pub fn id(&self) -> i64 {
        match self {
            AtomMatchingTracker::Simple(t) => t.id,
            AtomMatchingTracker::Combination(t) => t.id,
        }
    }

    /// Atom ids this tracker can match, collected through combinations.
    pub fn collect_atom_ids(&self, all: &[AtomMatchingTracker], out: &mut ahash::AHashSet<i32>) {
        match self {
            AtomMatchingTracker::Simple(t) => {
                out.insert(t.atom_id);
            }
            AtomMatchingTracker::Combination(t) => {
                for &child in &t.children {
                    all[child].collect_atom_ids(all, out);
                }
            }
        }
    }
}

/// Per-event-dispatch matcher results: one state and one optional
/// transformed event per tracker, in arena order.
#[derive(Debug, Default)]
pub struct MatcherResults {
    pub states: Vec<MatchingState>,
    pub transforms: Vec<Option<Arc<LogEvent>>>,
}

impl MatcherResults {
    /// The event a consumer of the given matcher should read: the
    /// transformed event when a transform fired, the original otherwise.
    pub fn event_for<'a>(&'a self, index: usize, original: &'a LogEvent) -> &'a LogEvent {
        match &self.transforms[index] {
            Some(transformed) => transformed.as_ref(),
            None => original,
        }
    }
}

/// Evaluates every tracker against one event, children before parents
/// (install guarantees child indices precede parents in the arena).
pub fn evaluate_matchers(
    trackers: &[AtomMatchingTracker],
    uid_map: &UidMap,
    event: &LogEvent,
) -> MatcherResults {
    let mut results = MatcherResults {
        states: vec![MatchingState::NotComputed; trackers.len()],
        transforms: vec![None; trackers.len()],
    };

    for (index, tracker) in trackers.iter().enumerate() {
        match tracker {
            AtomMatchingTracker::Simple(simple) => {
                if event.tag() != simple.atom_id {
                    results.states[index] = MatchingState::NotMatched;
                    continue;
                }
                let result = matches_simple(uid_map, simple, event);
                results.states[index] = if result.matched {
                    MatchingState::Matched
                } else {
                    MatchingState::NotMatched
                };
                results.transforms[index] = result.transformed_event.map(Arc::from);
            }
            AtomMatchingTracker::Combination(combination) => {
                let matched = combination_match(
                    &combination.children,
                    combination.operation,
                    &results.states,
                );
                results.states[index] = if matched {
                    MatchingState::Matched
                } else {
                    MatchingState::NotMatched
                };
            }
        }
    }
    results
}

/// Evaluates a boolean operation over child matcher results,
/// short-circuiting where possible.
pub fn combination_match(
    children: &[usize],
    operation: LogicalOperation,
    results: &[MatchingState],
) -> bool {
    match operation {
        LogicalOperation::And => children
            .iter()
            .all(|&c| results[c] == MatchingState::Matched),
        LogicalOperation::Or => children
            .iter()
            .any(|&c| results[c] == MatchingState::Matched),
        LogicalOperation::Not => results[children[0]] == MatchingState::NotMatched,
        LogicalOperation::Nand => children
            .iter()
            .any(|&c| results[c] != MatchingState::Matched),
        LogicalOperation::Nor => children
            .iter()
            .all(|&c| results[c] != MatchingState::Matched),
    }
}

/// Matches an event against a compiled simple matcher, threading any
/// transformed event through subsequent field matchers.
pub fn matches_simple(
    uid_map: &UidMap,
    simple: &SimpleMatchingTracker,
    event: &LogEvent,
) -> MatchResult {
    if event.tag() != simple.atom_id {
        return MatchResult::no_match();
    }

    let mut transformed: Option<Box<LogEvent>> = None;
    for matcher in &simple.matchers {
        let result = {
            let current: &LogEvent = transformed.as_deref().unwrap_or(event);
            let end = current.values().len();
            matches_field_value(uid_map, matcher, current, 0, end, 0)
        };
        if let Some(t) = result.transformed_event {
            transformed = Some(t);
        }
        if !result.matched {
            return MatchResult {
                matched: false,
                transformed_event: transformed,
            };
        }
    }
    MatchResult {
        matched: true,
        transformed_event: transformed,
    }
}

/// Narrows `[start, end)` to the contiguous sub-range whose position at
/// `depth` equals `target`. Values are in depth-first order, so the scan
/// can stop at the first larger position.
fn get_start_end_at_depth(
    target: i32,
    start: usize,
    end: usize,
    depth: usize,
    values: &[FieldValue],
) -> Option<(usize, usize)> {
    let mut new_start = None;
    let mut new_end = end;
    for (i, value) in values.iter().enumerate().take(end).skip(start) {
        let pos = value.field.pos_at_depth(depth);
        if pos == target {
            if new_start.is_none() {
                new_start = Some(i);
            }
            new_end = i + 1;
        } else if pos > target {
            break;
        }
    }
    new_start.map(|s| (s, new_end))
}

/// Computes the index ranges participating in matching, applying position
/// handling. Returns the ranges and the (possibly incremented) depth.
///
/// With ANY position and a tuple matcher the result holds one range per
/// sub-tree; in every other case it holds exactly one range.
fn compute_ranges(
    matcher: &CompiledFieldValueMatcher,
    values: &[FieldValue],
    start: usize,
    end: usize,
    mut depth: usize,
) -> (Vec<(usize, usize)>, usize) {
    let narrowed = get_start_end_at_depth(matcher.field, start, end, depth, values);
    let (mut start, mut end) = match narrowed {
        Some(range) => range,
        None => return (Vec::new(), depth),
    };

    let mut ranges = Vec::new();
    if let Some(position) = matcher.position {
        // A repeated field's position occupies the next lane of the path.
        depth += 1;
        if depth > MAX_LOG_DEPTH {
            return (ranges, depth);
        }
        match position {
            Position::First => {
                for i in start..end {
                    if values[i].field.pos_at_depth(depth) != 1 {
                        end = i;
                        break;
                    }
                }
                ranges.push((start, end));
            }
            Position::Last => {
                for (i, value) in values.iter().enumerate().take(end).skip(start) {
                    if value.field.is_last_pos(depth) {
                        start = i;
                        break;
                    }
                }
                ranges.push((start, end));
            }
            // ALL is handled like ANY here; it is only admitted with a
            // string transform or tuple, which was enforced at compile time.
            Position::All | Position::Any => {
                if matches!(matcher.value, Some(CompiledValueMatcher::MatchesTuple(_))) {
                    let mut current_pos = values[start].field.pos_at_depth(depth);
                    for i in start..end {
                        let pos = values[i].field.pos_at_depth(depth);
                        if pos != current_pos {
                            ranges.push((start, i));
                            start = i;
                            current_pos = pos;
                        }
                    }
                }
                ranges.push((start, end));
            }
        }
    } else {
        ranges.push((start, end));
    }

    (ranges, depth)
}

/// Applies the matcher's string transform to every string in the range,
/// cloning the event lazily on the first replacement that changes a value.
fn get_transformed_event(
    matcher: &CompiledFieldValueMatcher,
    event: &LogEvent,
    start: usize,
    end: usize,
) -> Option<Box<LogEvent>> {
    let transform = matcher.transform.as_ref()?;

    let mut transformed: Option<Box<LogEvent>> = None;
    for i in start..end {
        let current: &LogEvent = transformed.as_deref().unwrap_or(event);
        let original = match &current.values()[i].value {
            Value::Str(s) => s.clone(),
            _ => continue,
        };
        let replaced = transform
            .regex
            .replace(&original, transform.replacement.as_str());
        if replaced == original {
            continue;
        }
        let replaced = replaced.into_owned();
        let target = transformed.get_or_insert_with(|| Box::new(event.clone()));
        target.values_mut()[i].value = Value::Str(replaced);
    }
    transformed
}

fn matches_field_value(
    uid_map: &UidMap,
    matcher: &CompiledFieldValueMatcher,
    event: &LogEvent,
    start: usize,
    end: usize,
    depth: usize,
) -> MatchResult {
    if depth > MAX_LOG_DEPTH || start >= end {
        return MatchResult::no_match();
    }

    let (ranges, depth) = compute_ranges(matcher, event.values(), start, end, depth);
    if ranges.is_empty() {
        return MatchResult::no_match();
    }
    let (start, end) = ranges[0];

    let mut transformed = get_transformed_event(matcher, event, start, end);

    if let Some(CompiledValueMatcher::MatchesTuple(children)) = &matcher.value {
        // Any sub-tree in which every child matches is a match.
        let mut matched_any = false;
        for &(range_start, range_end) in &ranges {
            let mut all = true;
            for child in children {
                let result = {
                    let current: &LogEvent = transformed.as_deref().unwrap_or(event);
                    matches_field_value(uid_map, child, current, range_start, range_end, depth + 1)
                };
                if let Some(t) = result.transformed_event {
                    transformed = Some(t);
                }
                if !result.matched {
                    all = false;
                }
            }
            matched_any = matched_any || all;
        }
        return MatchResult {
            matched: matched_any,
            transformed_event: transformed,
        };
    }

    let matched = {
        let values: &[FieldValue] = match &transformed {
            Some(t) => t.values(),
            None => event.values(),
        };
        let range = &values[start..end];
        match &matcher.value {
            None => true, // transform-only matcher: the transform decided.
            Some(value_matcher) => match_values(uid_map, value_matcher, range),
        }
    };
    MatchResult {
        matched,
        transformed_event: transformed,
    }
}

/// Runs a leaf value test over a narrowed range; any matching element wins.
fn match_values(uid_map: &UidMap, matcher: &CompiledValueMatcher, range: &[FieldValue]) -> bool {
    match matcher {
        CompiledValueMatcher::EqBool(expected) => range.iter().any(|fv| match &fv.value {
            Value::Int(v) => (*v != 0) == *expected,
            Value::Long(v) => (*v != 0) == *expected,
            _ => false,
        }),
        CompiledValueMatcher::EqString(s) => {
            range.iter().any(|fv| try_match_string(uid_map, fv, s))
        }
        CompiledValueMatcher::EqAnyString(list) => range
            .iter()
            .any(|fv| list.iter().any(|s| try_match_string(uid_map, fv, s))),
        CompiledValueMatcher::NeqAnyString(list) => range
            .iter()
            .any(|fv| list.iter().all(|s| !try_match_string(uid_map, fv, s))),
        CompiledValueMatcher::EqWildcardString(pattern) => range
            .iter()
            .any(|fv| try_match_wildcard(uid_map, fv, pattern)),
        CompiledValueMatcher::EqAnyWildcardString(list) => range
            .iter()
            .any(|fv| list.iter().any(|p| try_match_wildcard(uid_map, fv, p))),
        CompiledValueMatcher::NeqAnyWildcardString(list) => range
            .iter()
            .any(|fv| list.iter().all(|p| !try_match_wildcard(uid_map, fv, p))),
        CompiledValueMatcher::EqInt(expected) => range
            .iter()
            .any(|fv| fv.value.as_long() == Some(*expected)),
        CompiledValueMatcher::EqAnyInt(list) => range
            .iter()
            .any(|fv| fv.value.as_long().is_some_and(|v| list.contains(&v))),
        CompiledValueMatcher::NeqAnyInt(list) => range
            .iter()
            .any(|fv| fv.value.as_long().is_some_and(|v| !list.contains(&v))),
        CompiledValueMatcher::LtInt(t) => {
            range.iter().any(|fv| fv.value.as_long().is_some_and(|v| v < *t))
        }
        CompiledValueMatcher::GtInt(t) => {
            range.iter().any(|fv| fv.value.as_long().is_some_and(|v| v > *t))
        }
        CompiledValueMatcher::LteInt(t) => {
            range.iter().any(|fv| fv.value.as_long().is_some_and(|v| v <= *t))
        }
        CompiledValueMatcher::GteInt(t) => {
            range.iter().any(|fv| fv.value.as_long().is_some_and(|v| v >= *t))
        }
        CompiledValueMatcher::LtFloat(t) => range.iter().any(|fv| match fv.value {
            Value::Float(v) => v < *t,
            _ => false,
        }),
        CompiledValueMatcher::GtFloat(t) => range.iter().any(|fv| match fv.value {
            Value::Float(v) => v > *t,
            _ => false,
        }),
        CompiledValueMatcher::MatchesTuple(_) => false, // handled by caller
    }
}

/// Exact string comparison; uid-annotated fields resolve through the
/// well-known table and then the package map.
fn try_match_string(uid_map: &UidMap, fv: &FieldValue, expected: &str) -> bool {
    if is_attribution_uid_field(fv) || fv.annotations.is_uid_field() {
        let uid = match fv.value {
            Value::Int(uid) => uid,
            _ => return false,
        };
        if let Some(known) = well_known_uid(expected) {
            return known == uid;
        }
        return uid_map.has_app(uid, expected);
    }
    match &fv.value {
        Value::Str(s) => s == expected,
        _ => false,
    }
}

/// Wildcard string comparison, with the same uid resolution rules.
fn try_match_wildcard(uid_map: &UidMap, fv: &FieldValue, pattern: &str) -> bool {
    if is_attribution_uid_field(fv) || fv.annotations.is_uid_field() {
        let uid = match fv.value {
            Value::Int(uid) => uid,
            _ => return false,
        };
        if let Some(name) = well_known_name(uid) {
            return wildcard_match(pattern, name);
        }
        return uid_map
            .app_names(uid)
            .iter()
            .any(|package| wildcard_match(pattern, package));
    }
    match &fv.value {
        Value::Str(s) => wildcard_match(pattern, s),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StringReplacer;

    const SCREEN_STATE_ATOM: i32 = 29;
    const WAKELOCK_ATOM: i32 = 10;

    fn screen_event(state: i32) -> LogEvent {
        LogEvent::builder(SCREEN_STATE_ATOM, 100).write_int(state).build()
    }

    fn simple(atom_id: i32, matchers: Vec<FieldValueMatcher>) -> SimpleMatchingTracker {
        SimpleMatchingTracker::compile(
            1,
            &SimpleAtomMatcher {
                atom_id,
                field_value_matchers: matchers,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_tag_only_matcher() {
        let tracker = simple(SCREEN_STATE_ATOM, vec![]);
        let uid_map = UidMap::new();
        assert!(matches_simple(&uid_map, &tracker, &screen_event(2)).matched);

        let other = LogEvent::builder(99, 100).write_int(2).build();
        assert!(!matches_simple(&uid_map, &tracker, &other).matched);
    }

    #[test]
    fn test_eq_int_matcher_widens() {
        let tracker = simple(
            SCREEN_STATE_ATOM,
            vec![FieldValueMatcher::with_value(1, ValueMatcher::EqInt(2))],
        );
        let uid_map = UidMap::new();
        assert!(matches_simple(&uid_map, &tracker, &screen_event(2)).matched);
        assert!(!matches_simple(&uid_map, &tracker, &screen_event(1)).matched);

        let long_event = LogEvent::builder(SCREEN_STATE_ATOM, 100).write_long(2).build();
        assert!(matches_simple(&uid_map, &tracker, &long_event).matched);
    }

    #[test]
    fn test_comparison_matchers() {
        let uid_map = UidMap::new();
        for (matcher, state, expected) in [
            (ValueMatcher::LtInt(2), 1, true),
            (ValueMatcher::LtInt(2), 2, false),
            (ValueMatcher::GtInt(2), 3, true),
            (ValueMatcher::LteInt(2), 2, true),
            (ValueMatcher::GteInt(2), 2, true),
            (ValueMatcher::GteInt(2), 1, false),
        ] {
            let tracker = simple(
                SCREEN_STATE_ATOM,
                vec![FieldValueMatcher::with_value(1, matcher.clone())],
            );
            assert_eq!(
                matches_simple(&uid_map, &tracker, &screen_event(state)).matched,
                expected,
                "{:?} against {}",
                matcher,
                state
            );
        }
    }

    #[test]
    fn test_eq_bool_matcher() {
        let tracker = simple(
            SCREEN_STATE_ATOM,
            vec![FieldValueMatcher::with_value(1, ValueMatcher::EqBool(true))],
        );
        let uid_map = UidMap::new();
        assert!(matches_simple(&uid_map, &tracker, &screen_event(1)).matched);
        assert!(!matches_simple(&uid_map, &tracker, &screen_event(0)).matched);
    }

    #[test]
    fn test_string_matchers() {
        let uid_map = UidMap::new();
        let event = LogEvent::builder(5, 100).write_string("com.example.app").build();

        let eq = simple(
            5,
            vec![FieldValueMatcher::with_value(
                1,
                ValueMatcher::EqString("com.example.app".into()),
            )],
        );
        assert!(matches_simple(&uid_map, &eq, &event).matched);

        let wildcard = simple(
            5,
            vec![FieldValueMatcher::with_value(
                1,
                ValueMatcher::EqWildcardString("com.example.*".into()),
            )],
        );
        assert!(matches_simple(&uid_map, &wildcard, &event).matched);

        let neq = simple(
            5,
            vec![FieldValueMatcher::with_value(
                1,
                ValueMatcher::NeqAnyString(vec!["other".into(), "com.example.app".into()]),
            )],
        );
        assert!(!matches_simple(&uid_map, &neq, &event).matched);
    }

    #[test]
    fn test_uid_string_resolution() {
        let uid_map = UidMap::new();
        uid_map.add_app(10007, "com.example.app");

        let event = LogEvent::builder(5, 100).write_uid(10007).build();
        let by_package = simple(
            5,
            vec![FieldValueMatcher::with_value(
                1,
                ValueMatcher::EqString("com.example.app".into()),
            )],
        );
        assert!(matches_simple(&uid_map, &by_package, &event).matched);

        let system_event = LogEvent::builder(5, 100).write_uid(1000).build();
        let by_aid = simple(
            5,
            vec![FieldValueMatcher::with_value(
                1,
                ValueMatcher::EqString("system".into()),
            )],
        );
        assert!(matches_simple(&uid_map, &by_aid, &system_event).matched);
        assert!(!matches_simple(&uid_map, &by_aid, &event).matched);
    }

    #[test]
    fn test_attribution_first_position() {
        let uid_map = UidMap::new();
        uid_map.add_app(111, "app.first");
        uid_map.add_app(222, "app.last");

        let event = LogEvent::builder(WAKELOCK_ATOM, 100)
            .write_attribution_chain(&[(111, "tagA"), (222, "tagB")])
            .write_int(1)
            .build();

        let first_uid = simple(
            WAKELOCK_ATOM,
            vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::First),
                value: Some(ValueMatcher::MatchesTuple(vec![
                    FieldValueMatcher::with_value(1, ValueMatcher::EqString("app.first".into())),
                ])),
                replace_string: None,
            }],
        );
        assert!(matches_simple(&uid_map, &first_uid, &event).matched);

        let first_wrong = simple(
            WAKELOCK_ATOM,
            vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::First),
                value: Some(ValueMatcher::MatchesTuple(vec![
                    FieldValueMatcher::with_value(1, ValueMatcher::EqString("app.last".into())),
                ])),
                replace_string: None,
            }],
        );
        assert!(!matches_simple(&uid_map, &first_wrong, &event).matched);
    }

    #[test]
    fn test_attribution_any_position() {
        let uid_map = UidMap::new();
        let event = LogEvent::builder(WAKELOCK_ATOM, 100)
            .write_attribution_chain(&[(111, "tagA"), (222, "tagB"), (333, "tagC")])
            .build();

        // ANY with a tuple: a sub-tree where both leaves match is required.
        let any_match = simple(
            WAKELOCK_ATOM,
            vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::Any),
                value: Some(ValueMatcher::MatchesTuple(vec![
                    FieldValueMatcher::with_value(1, ValueMatcher::EqInt(222)),
                    FieldValueMatcher::with_value(2, ValueMatcher::EqString("tagB".into())),
                ])),
                replace_string: None,
            }],
        );
        assert!(matches_simple(&uid_map, &any_match, &event).matched);

        // uid and tag from different nodes must not combine.
        let cross_node = simple(
            WAKELOCK_ATOM,
            vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::Any),
                value: Some(ValueMatcher::MatchesTuple(vec![
                    FieldValueMatcher::with_value(1, ValueMatcher::EqInt(222)),
                    FieldValueMatcher::with_value(2, ValueMatcher::EqString("tagC".into())),
                ])),
                replace_string: None,
            }],
        );
        assert!(!matches_simple(&uid_map, &cross_node, &event).matched);
    }

    #[test]
    fn test_last_position() {
        let uid_map = UidMap::new();
        let event = LogEvent::builder(WAKELOCK_ATOM, 100)
            .write_attribution_chain(&[(111, "tagA"), (333, "tagC")])
            .build();

        let last_uid = simple(
            WAKELOCK_ATOM,
            vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::Last),
                value: Some(ValueMatcher::MatchesTuple(vec![
                    FieldValueMatcher::with_value(1, ValueMatcher::EqInt(333)),
                ])),
                replace_string: None,
            }],
        );
        assert!(matches_simple(&uid_map, &last_uid, &event).matched);
    }

    #[test]
    fn test_string_transform_lazy_event() {
        let uid_map = UidMap::new();
        let event = LogEvent::builder(5, 100).write_string("wakelock-1234").build();

        // Strip the numeric suffix, then compare.
        let tracker = simple(
            5,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: Some(ValueMatcher::EqString("wakelock-".into())),
                replace_string: Some(StringReplacer {
                    regex: r"[0-9]+$".into(),
                    replacement: String::new(),
                }),
            }],
        );
        let result = matches_simple(&uid_map, &tracker, &event);
        assert!(result.matched);
        let transformed = result.transformed_event.expect("transform fired");
        assert_eq!(transformed.values()[0].value, Value::Str("wakelock-".into()));

        // A non-matching regex leaves the event untouched.
        let unchanged = LogEvent::builder(5, 100).write_string("plain").build();
        let result = matches_simple(&uid_map, &tracker, &unchanged);
        assert!(!result.matched);
        assert!(result.transformed_event.is_none());
    }

    #[test]
    fn test_transform_without_value_matcher() {
        let uid_map = UidMap::new();
        // Admissible: matches exactly when the transform changes the value.
        let tracker = simple(
            5,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: None,
                replace_string: Some(StringReplacer {
                    regex: r"[0-9]+$".into(),
                    replacement: String::new(),
                }),
            }],
        );
        let event = LogEvent::builder(5, 100).write_string("tag42").build();
        let result = matches_simple(&uid_map, &tracker, &event);
        assert!(result.matched);
        assert!(result.transformed_event.is_some());
    }

    #[test]
    fn test_invalid_position_configs() {
        // ANY without a tuple or transform fails compilation.
        let any_invalid = SimpleAtomMatcher {
            atom_id: 5,
            field_value_matchers: vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::Any),
                value: Some(ValueMatcher::EqInt(1)),
                replace_string: None,
            }],
        };
        assert!(SimpleMatchingTracker::compile(1, &any_invalid).is_err());

        // ALL with only a transform is fine.
        let all_transform = SimpleAtomMatcher {
            atom_id: 5,
            field_value_matchers: vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::All),
                value: None,
                replace_string: Some(StringReplacer {
                    regex: "x".into(),
                    replacement: "y".into(),
                }),
            }],
        };
        assert!(SimpleMatchingTracker::compile(1, &all_transform).is_ok());

        // Transform on a tuple matcher is rejected.
        let tuple_transform = SimpleAtomMatcher {
            atom_id: 5,
            field_value_matchers: vec![FieldValueMatcher {
                field: 1,
                position: Some(Position::Any),
                value: Some(ValueMatcher::MatchesTuple(vec![
                    FieldValueMatcher::with_value(1, ValueMatcher::EqInt(1)),
                ])),
                replace_string: Some(StringReplacer {
                    regex: "x".into(),
                    replacement: "y".into(),
                }),
            }],
        };
        assert!(SimpleMatchingTracker::compile(1, &tuple_transform).is_err());

        // Broken regex is rejected at compile time.
        let bad_regex = SimpleAtomMatcher {
            atom_id: 5,
            field_value_matchers: vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: None,
                replace_string: Some(StringReplacer {
                    regex: "(unclosed".into(),
                    replacement: String::new(),
                }),
            }],
        };
        assert!(matches!(
            SimpleMatchingTracker::compile(7, &bad_regex),
            Err(InvalidConfigReason::MatcherInvalidRegex(7))
        ));
    }

    #[test]
    fn test_combination_operations() {
        use MatchingState::{Matched, NotMatched};
        let results = [Matched, NotMatched, Matched];

        assert!(combination_match(&[0, 2], LogicalOperation::And, &results));
        assert!(!combination_match(&[0, 1], LogicalOperation::And, &results));
        assert!(combination_match(&[0, 1], LogicalOperation::Or, &results));
        assert!(!combination_match(&[1], LogicalOperation::Or, &results));
        assert!(combination_match(&[1], LogicalOperation::Not, &results));
        assert!(!combination_match(&[0], LogicalOperation::Not, &results));
        assert!(combination_match(&[0, 1], LogicalOperation::Nand, &results));
        assert!(!combination_match(&[0, 2], LogicalOperation::Nand, &results));
        assert!(combination_match(&[1], LogicalOperation::Nor, &results));
        assert!(!combination_match(&[0, 1], LogicalOperation::Nor, &results));
    }

    #[test]
    fn test_evaluate_matchers_caches_children() {
        let uid_map = UidMap::new();
        let on = AtomMatchingTracker::Simple(simple(
            SCREEN_STATE_ATOM,
            vec![FieldValueMatcher::with_value(1, ValueMatcher::EqInt(2))],
        ));
        let off = AtomMatchingTracker::Simple(simple(
            SCREEN_STATE_ATOM,
            vec![FieldValueMatcher::with_value(1, ValueMatcher::EqInt(1))],
        ));
        let either = AtomMatchingTracker::Combination(CombinationMatchingTracker::new(
            3,
            LogicalOperation::Or,
            vec![0, 1],
        ));

        let trackers = vec![on, off, either];
        let results = evaluate_matchers(&trackers, &uid_map, &screen_event(2));
        assert_eq!(results.states[0], MatchingState::Matched);
        assert_eq!(results.states[1], MatchingState::NotMatched);
        assert_eq!(results.states[2], MatchingState::Matched);
    }
}
