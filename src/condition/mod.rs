//! Condition trackers.
//!
//! A simple condition is a start/stop/stop-all state machine over matcher
//! firings, optionally sliced into per-dimension nesting counters. A
//! combination condition applies three-valued logic over other conditions.
//! Trackers live in an arena and reference each other by index; the
//! pipeline evaluates them in an order where children precede parents.

use crate::core::config::{LogicalOperation, SimplePredicate};
use crate::core::types::{ConditionState, ConfigKey, MatchingState};
use crate::event::field::FieldMask;
use crate::event::{filter_values, HashableDimensionKey, LogEvent};
use crate::stats::EngineStats;
use ahash::{AHashMap, AHashSet};
use tracing::warn;

/// Per-query dimension links: for each condition id, the dimension key the
/// caller wants the answer for.
pub type ConditionKey = AHashMap<i64, HashableDimensionKey>;

/// Returns the combined state of a combination condition's children.
pub fn evaluate_combination_condition(
    children: &[usize],
    operation: LogicalOperation,
    cache: &[ConditionState],
) -> ConditionState {
    let and_of = |children: &[usize]| {
        let mut state = ConditionState::True;
        for &child in children {
            match cache[child] {
                ConditionState::False => return ConditionState::False,
                ConditionState::True => {}
                _ => state = ConditionState::Unknown,
            }
        }
        state
    };
    let or_of = |children: &[usize]| {
        let mut state = ConditionState::False;
        for &child in children {
            match cache[child] {
                ConditionState::True => return ConditionState::True,
                ConditionState::False => {}
                _ => state = ConditionState::Unknown,
            }
        }
        state
    };
    match operation {
        LogicalOperation::And => and_of(children),
        LogicalOperation::Or => or_of(children),
        LogicalOperation::Not => cache[children[0]].not(),
        LogicalOperation::Nand => and_of(children).not(),
        LogicalOperation::Nor => or_of(children).not(),
    }
}

/// A start/stop/stop-all condition with optional dimension slicing.
#[derive(Debug)]
pub struct SimpleConditionTracker {
    condition_id: i64,
    index: usize,
    config_key: ConfigKey,
    start_index: Option<usize>,
    stop_index: Option<usize>,
    stop_all_index: Option<usize>,
    count_nesting: bool,
    output_dimensions: Vec<FieldMask>,
    sliced: bool,
    initial_value: ConditionState,
    /// Dimension key -> nesting counter. The default (empty) key is used
    /// when the condition is unsliced.
    sliced_state: AHashMap<HashableDimensionKey, i32>,
    changed_to_true: AHashSet<HashableDimensionKey>,
    changed_to_false: AHashSet<HashableDimensionKey>,
}

impl SimpleConditionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config_key: ConfigKey,
        condition_id: i64,
        index: usize,
        predicate: &SimplePredicate,
        start_index: Option<usize>,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        output_dimensions: Vec<FieldMask>,
    ) -> Self {
        let sliced = !output_dimensions.is_empty();
        // Unspecified initial value: false when sliced (bounds dimension
        // churn), unknown otherwise.
        let initial_value = match predicate.initial_value {
            Some(crate::core::config::InitialValue::False) => ConditionState::False,
            Some(crate::core::config::InitialValue::Unknown) => ConditionState::Unknown,
            None if sliced => ConditionState::False,
            None => ConditionState::Unknown,
        };
        Self {
            condition_id,
            index,
            config_key,
            start_index,
            stop_index,
            stop_all_index,
            count_nesting: predicate.count_nesting,
            output_dimensions,
            sliced,
            initial_value,
            sliced_state: AHashMap::new(),
            changed_to_true: AHashSet::new(),
            changed_to_false: AHashSet::new(),
        }
    }

    pub fn condition_id(&self) -> i64 {
        self.condition_id
    }

    pub fn is_sliced(&self) -> bool {
        self.sliced
    }

    pub fn output_dimensions(&self) -> &[FieldMask] {
        &self.output_dimensions
    }

    /// Carries accumulated state over from the previous generation of this
    /// condition during a config update.
    pub fn adopt_state(&mut self, old: &mut SimpleConditionTracker) {
        self.sliced_state = std::mem::take(&mut old.sliced_state);
        self.initial_value = old.initial_value;
    }

    /// Matcher indices this condition consumes.
    pub fn interested_matchers(&self) -> impl Iterator<Item = usize> + '_ {
        self.start_index
            .into_iter()
            .chain(self.stop_index)
            .chain(self.stop_all_index)
    }

    pub fn changed_to_true_dimensions(&self) -> &AHashSet<HashableDimensionKey> {
        &self.changed_to_true
    }

    pub fn changed_to_false_dimensions(&self) -> &AHashSet<HashableDimensionKey> {
        &self.changed_to_false
    }

    pub fn sliced_dimension_map(&self) -> &AHashMap<HashableDimensionKey, i32> {
        &self.sliced_state
    }

    fn handle_stop_all(&mut self, cache: &mut [ConditionState], changed: &mut [bool]) {
        // Unless the default is false and nothing was started, this is a
        // condition change.
        changed[self.index] =
            !(self.initial_value == ConditionState::False && self.sliced_state.is_empty());

        for (key, count) in &self.sliced_state {
            if *count > 0 {
                self.changed_to_false.insert(key.clone());
            }
        }

        // Everything is known stopped now; from here on the default is false.
        self.initial_value = ConditionState::False;
        self.sliced_state.clear();
        cache[self.index] = ConditionState::False;
    }

    fn hit_guard_rail(&self, new_key: &HashableDimensionKey, stats: &EngineStats) -> bool {
        if !self.sliced || self.sliced_state.contains_key(new_key) {
            return false;
        }
        if self.sliced_state.len() >= EngineStats::DIMENSION_KEY_SIZE_SOFT_LIMIT {
            let new_count = self.sliced_state.len() + 1;
            stats.note_condition_dimension_size(self.config_key, self.condition_id, new_count);
            if new_count > EngineStats::DIMENSION_KEY_SIZE_HARD_LIMIT {
                warn!(
                    condition_id = self.condition_id,
                    key = %new_key,
                    "condition dropping data for dimension key over the hard limit"
                );
                return true;
            }
        }
        false
    }

    fn handle_condition_event(
        &mut self,
        output_key: HashableDimensionKey,
        match_start: bool,
        stats: &EngineStats,
        cache_slot: &mut ConditionState,
        changed_slot: &mut bool,
    ) {
        if self.hit_guard_rail(&output_key, stats) {
            *changed_slot = false;
            *cache_slot = ConditionState::Unknown;
            return;
        }

        let mut changed = false;
        let new_condition;
        match self.sliced_state.get_mut(&output_key) {
            None => {
                // A fresh output key.
                new_condition = ConditionState::from(match_start);
                if match_start && self.initial_value != ConditionState::True {
                    self.sliced_state.insert(output_key.clone(), 1);
                    self.changed_to_true.insert(output_key);
                    changed = true;
                } else if !match_start && self.initial_value != ConditionState::False {
                    // A stop with no history is only informative when the
                    // default is not already false.
                    self.sliced_state.insert(output_key.clone(), 0);
                    self.changed_to_false.insert(output_key);
                    changed = true;
                }
            }
            Some(count) => {
                if match_start {
                    if *count == 0 {
                        changed = true;
                        self.changed_to_true.insert(output_key.clone());
                    }
                    // Incrementing past 1 is harmless without nesting; stops
                    // treat any positive count as one.
                    *count += 1;
                    new_condition = ConditionState::True;
                } else {
                    if *count > 0 {
                        if self.count_nesting {
                            *count -= 1;
                        } else {
                            *count = 0;
                        }
                        if *count == 0 {
                            self.changed_to_false.insert(output_key.clone());
                            changed = true;
                        }
                    }
                    new_condition = ConditionState::from(*count > 0);
                    if self.initial_value == ConditionState::False && *count == 0 {
                        // False-by-default conditions do not retain stopped keys.
                        self.sliced_state.remove(&output_key);
                    }
                }
            }
        }

        *changed_slot = changed;
        *cache_slot = new_condition;
    }

    /// Feeds one event's matcher results through the state machine,
    /// filling this tracker's slots in the per-event caches.
    pub fn evaluate_condition(
        &mut self,
        event: &LogEvent,
        matcher_states: &[MatchingState],
        cache: &mut [ConditionState],
        changed: &mut [bool],
        stats: &EngineStats,
    ) {
        if cache[self.index] != ConditionState::NotEvaluated {
            return;
        }
        self.changed_to_true.clear();
        self.changed_to_false.clear();

        let matched = |idx: Option<usize>| {
            idx.is_some_and(|i| {
                i < matcher_states.len() && matcher_states[i] == MatchingState::Matched
            })
        };

        if matched(self.stop_all_index) {
            self.handle_stop_all(cache, changed);
            return;
        }

        // Priority: stop_all > stop > start.
        let matched_state = if matched(self.stop_index) {
            Some(false)
        } else if matched(self.start_index) {
            Some(true)
        } else {
            None
        };

        let Some(match_start) = matched_state else {
            // Not our event: report the cached state.
            changed[self.index] = false;
            cache[self.index] = self.current_state();
            return;
        };

        let mut state_slot = self.initial_value;
        let mut changed_slot = false;
        if !self.sliced {
            self.handle_condition_event(
                HashableDimensionKey::default(),
                match_start,
                stats,
                &mut state_slot,
                &mut changed_slot,
            );
        } else {
            let output_key = filter_values(&self.output_dimensions, event.values());
            self.handle_condition_event(
                output_key,
                match_start,
                stats,
                &mut state_slot,
                &mut changed_slot,
            );
        }
        cache[self.index] = state_slot;
        changed[self.index] = changed_slot;
    }

    /// The overall state without consuming an event: true if any dimension
    /// is running, the initial value otherwise.
    fn current_state(&self) -> ConditionState {
        if self.sliced {
            if self.sliced_state.values().any(|count| *count > 0) {
                ConditionState::True
            } else {
                self.initial_value
            }
        } else {
            match self.sliced_state.get(&HashableDimensionKey::default()) {
                Some(count) => ConditionState::from(*count > 0),
                None => self.initial_value,
            }
        }
    }

    /// Answers a state query for the given dimension links.
    pub fn is_condition_met(
        &self,
        condition_key: &ConditionKey,
        is_partial_link: bool,
        cache: &mut [ConditionState],
    ) {
        if cache[self.index] != ConditionState::NotEvaluated {
            return;
        }

        let Some(query_key) = condition_key.get(&self.condition_id) else {
            let mut state = ConditionState::NotEvaluated.or(self.initial_value);
            if !self.sliced {
                if let Some(count) = self.sliced_state.get(&HashableDimensionKey::default()) {
                    state = state.or(ConditionState::from(*count > 0));
                }
            }
            cache[self.index] = state;
            return;
        };

        let mut state = ConditionState::NotEvaluated.or(self.initial_value);
        if is_partial_link {
            // The caller could not link every output dimension; any sliced
            // entry containing the partial key answers.
            for (key, count) in &self.sliced_state {
                if key.contains(query_key) {
                    state = state.or(ConditionState::from(*count > 0));
                }
            }
        } else if let Some(count) = self.sliced_state.get(query_key) {
            state = state.or(ConditionState::from(*count > 0));
        }
        cache[self.index] = state;
    }
}

/// Logical combination over other conditions.
#[derive(Debug)]
pub struct CombinationConditionTracker {
    condition_id: i64,
    index: usize,
    operation: LogicalOperation,
    children: Vec<usize>,
    sliced_children: Vec<usize>,
}

impl CombinationConditionTracker {
    pub fn new(
        condition_id: i64,
        index: usize,
        operation: LogicalOperation,
        children: Vec<usize>,
        sliced_children: Vec<usize>,
    ) -> Self {
        Self {
            condition_id,
            index,
            operation,
            children,
            sliced_children,
        }
    }

    pub fn condition_id(&self) -> i64 {
        self.condition_id
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn sliced_children(&self) -> &[usize] {
        &self.sliced_children
    }
}

/// One condition tracker in the arena.
#[derive(Debug)]
pub enum ConditionTracker {
    Simple(SimpleConditionTracker),
    Combination(CombinationConditionTracker),
}

impl ConditionTracker {
    pub fn condition_id(&self) -> i64 {
        match self {
            ConditionTracker::Simple(t) => t.condition_id,
            ConditionTracker::Combination(t) => t.condition_id,
        }
    }

    pub fn is_sliced(&self, all: &[ConditionTracker]) -> bool {
        match self {
            ConditionTracker::Simple(t) => t.sliced,
            ConditionTracker::Combination(t) => !t.sliced_children.is_empty() || {
                t.children.iter().any(|&c| all[c].is_sliced(all))
            },
        }
    }

    /// Dimensions that flipped to true during the last evaluation. Only one
    /// child of a combination can be sliced, so the first hit answers.
    pub fn changed_to_true_dimensions<'a>(
        &'a self,
        all: &'a [ConditionTracker],
    ) -> Option<&'a AHashSet<HashableDimensionKey>> {
        match self {
            ConditionTracker::Simple(t) => Some(&t.changed_to_true),
            ConditionTracker::Combination(t) => t
                .children
                .iter()
                .find_map(|&c| all[c].changed_to_true_dimensions(all)),
        }
    }

    pub fn changed_to_false_dimensions<'a>(
        &'a self,
        all: &'a [ConditionTracker],
    ) -> Option<&'a AHashSet<HashableDimensionKey>> {
        match self {
            ConditionTracker::Simple(t) => Some(&t.changed_to_false),
            ConditionTracker::Combination(t) => t
                .children
                .iter()
                .find_map(|&c| all[c].changed_to_false_dimensions(all)),
        }
    }

    /// The sliced dimension map, recursing into the single sliced child.
    pub fn sliced_dimension_map<'a>(
        &'a self,
        all: &'a [ConditionTracker],
    ) -> Option<&'a AHashMap<HashableDimensionKey, i32>> {
        match self {
            ConditionTracker::Simple(t) => {
                if t.sliced {
                    Some(&t.sliced_state)
                } else {
                    None
                }
            }
            ConditionTracker::Combination(t) => match t.sliced_children.as_slice() {
                [only] => all[*only].sliced_dimension_map(all),
                _ => None,
            },
        }
    }

    /// The output dimensions a sliced condition projects, recursing into
    /// the single sliced child of a combination.
    pub fn output_dimensions<'a>(
        &'a self,
        all: &'a [ConditionTracker],
    ) -> Option<&'a [FieldMask]> {
        match self {
            ConditionTracker::Simple(t) => {
                if t.sliced {
                    Some(&t.output_dimensions)
                } else {
                    None
                }
            }
            ConditionTracker::Combination(t) => match t.sliced_children.as_slice() {
                [only] => all[*only].output_dimensions(all),
                _ => None,
            },
        }
    }

    /// Whether this condition's output dimensions equal the given matchers.
    pub fn equal_output_dimensions(
        &self,
        all: &[ConditionTracker],
        dimensions: &[FieldMask],
    ) -> bool {
        match self {
            ConditionTracker::Simple(t) => t.output_dimensions == dimensions,
            ConditionTracker::Combination(t) => match t.sliced_children.as_slice() {
                [only] => all[*only].equal_output_dimensions(all, dimensions),
                _ => false,
            },
        }
    }
}

/// Evaluates every condition tracker against one event, children before
/// parents (install guarantees evaluation order).
pub fn evaluate_conditions(
    trackers: &mut [ConditionTracker],
    event: &LogEvent,
    matcher_states: &[MatchingState],
    cache: &mut [ConditionState],
    changed: &mut [bool],
    stats: &EngineStats,
) {
    for index in 0..trackers.len() {
        // Split so the combination arm can read children already written to
        // the shared caches without re-borrowing the arena.
        match &mut trackers[index] {
            ConditionTracker::Simple(simple) => {
                simple.evaluate_condition(event, matcher_states, cache, changed, stats);
            }
            ConditionTracker::Combination(combination) => {
                if cache[combination.index] != ConditionState::NotEvaluated {
                    continue;
                }
                cache[combination.index] = evaluate_combination_condition(
                    &combination.children,
                    combination.operation,
                    cache,
                );
                changed[combination.index] = combination
                    .children
                    .iter()
                    .any(|&child| changed[child]);
            }
        }
    }
}

/// Answers a point-in-time condition query by index.
pub fn is_condition_met(
    trackers: &[ConditionTracker],
    index: usize,
    condition_key: &ConditionKey,
    is_partial_link: bool,
    cache: &mut [ConditionState],
) {
    match &trackers[index] {
        ConditionTracker::Simple(simple) => {
            simple.is_condition_met(condition_key, is_partial_link, cache);
        }
        ConditionTracker::Combination(combination) => {
            if cache[combination.index] != ConditionState::NotEvaluated {
                return;
            }
            for &child in &combination.children {
                is_condition_met(trackers, child, condition_key, is_partial_link, cache);
            }
            cache[combination.index] = evaluate_combination_condition(
                &combination.children,
                combination.operation,
                cache,
            );
        }
    }
}

/// Read-only view over the condition arena for per-dimension re-queries
/// from metric producers.
pub struct ConditionWizard<'a> {
    trackers: &'a [ConditionTracker],
}

impl<'a> ConditionWizard<'a> {
    pub fn new(trackers: &'a [ConditionTracker]) -> Self {
        Self { trackers }
    }

    /// Queries one condition for one dimension link set.
    pub fn query(
        &self,
        index: usize,
        condition_key: &ConditionKey,
        is_partial_link: bool,
    ) -> ConditionState {
        let mut cache = vec![ConditionState::NotEvaluated; self.trackers.len()];
        is_condition_met(
            self.trackers,
            index,
            condition_key,
            is_partial_link,
            &mut cache,
        );
        cache[index]
    }
}
