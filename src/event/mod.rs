//! Typed events and the addressing scheme over their fields.
//!
//! A [`LogEvent`] is a tag id, an elapsed timestamp, and a lexically sorted
//! vector of [`FieldValue`]s. Because fields are stored in depth-first
//! order, every sub-tree at a given depth occupies a contiguous range of
//! the vector, which is what the matcher relies on for range narrowing.

pub mod field;
pub mod queue;
pub mod value;

pub use field::{Field, FieldMask};
pub use queue::{EventQueue, PushResult};
pub use value::Value;

use serde::{Deserialize, Serialize};
use std::fmt;

const NESTED_POS: u8 = 0;
const PRIMARY_POS: u8 = 1;
const EXCLUSIVE_POS: u8 = 2;
const UID_POS: u8 = 3;

/// Per-field boolean annotations packed into one byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Annotations(u8);

impl Annotations {
    fn set(&mut self, pos: u8, value: bool) {
        self.0 &= !(1 << pos);
        self.0 |= (value as u8) << pos;
    }

    fn get(&self, pos: u8) -> bool {
        (self.0 >> pos) & 1 != 0
    }

    pub fn set_nested(&mut self, nested: bool) {
        self.set(NESTED_POS, nested);
    }

    pub fn set_primary_field(&mut self, primary: bool) {
        self.set(PRIMARY_POS, primary);
    }

    pub fn set_exclusive_state(&mut self, exclusive: bool) {
        self.set(EXCLUSIVE_POS, exclusive);
    }

    pub fn set_uid_field(&mut self, uid: bool) {
        self.set(UID_POS, uid);
    }

    pub fn is_nested(&self) -> bool {
        self.get(NESTED_POS)
    }

    pub fn is_primary_field(&self) -> bool {
        self.get(PRIMARY_POS)
    }

    pub fn is_exclusive_state(&self) -> bool {
        self.get(EXCLUSIVE_POS)
    }

    pub fn is_uid_field(&self) -> bool {
        self.get(UID_POS)
    }
}

/// One addressed leaf value inside an event or a dimension key.
///
/// Equality and hashing cover the field and value only; annotations ride
/// along as metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: Field,
    pub value: Value,
    pub annotations: Annotations,
}

impl FieldValue {
    pub fn new(field: Field, value: Value) -> Self {
        Self {
            field,
            value,
            annotations: Annotations::default(),
        }
    }

    /// Runtime size estimate for report byte budgeting.
    pub fn size(&self) -> usize {
        8 + self.value.size()
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.value == other.value
    }
}

impl Eq for FieldValue {}

impl std::hash::Hash for FieldValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.field.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.field
            .cmp(&other.field)
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// True for a uid leaf inside an attribution chain: a depth-2 value whose
/// repeated parent is field 1 and whose leaf position is 1.
pub fn is_attribution_uid_field(fv: &FieldValue) -> bool {
    fv.field.depth() == 2
        && fv.field.pos_at_depth(0) == 1
        && fv.field.pos_at_depth(2) == 1
        && matches!(fv.value, Value::Int(_))
}

/// Returns the uid when the field carries one, either through an
/// attribution chain or a uid annotation.
pub fn get_uid_if_exists(fv: &FieldValue) -> Option<i32> {
    let is_uid = is_attribution_uid_field(fv) || fv.annotations.is_uid_field();
    match (&fv.value, is_uid) {
        (Value::Int(uid), true) => Some(*uid),
        _ => None,
    }
}

/// A typed event: tag, origin, monotonic elapsed timestamp, and sorted
/// field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    tag: i32,
    elapsed_timestamp_ns: i64,
    uid: i32,
    pid: i32,
    values: Vec<FieldValue>,
}

impl LogEvent {
    pub fn new(tag: i32, elapsed_timestamp_ns: i64) -> Self {
        Self {
            tag,
            elapsed_timestamp_ns,
            uid: -1,
            pid: -1,
            values: Vec::new(),
        }
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn elapsed_timestamp_ns(&self) -> i64 {
        self.elapsed_timestamp_ns
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [FieldValue] {
        &mut self.values
    }

    /// Appends a pre-encoded value; the caller keeps the sorted order.
    pub fn push_value(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    /// Estimated in-memory size of the value vector.
    pub fn size(&self) -> usize {
        self.values.iter().map(FieldValue::size).sum()
    }

    /// Starts building an event; fields are appended in declaration order,
    /// which keeps the value vector sorted.
    pub fn builder(tag: i32, elapsed_timestamp_ns: i64) -> LogEventBuilder {
        LogEventBuilder {
            event: LogEvent::new(tag, elapsed_timestamp_ns),
            next_field: 1,
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom {} @{}ns", self.tag, self.elapsed_timestamp_ns)?;
        for fv in &self.values {
            write!(f, " {}={}", fv.field, fv.value)?;
        }
        Ok(())
    }
}

/// Appends fields to a [`LogEvent`] in sorted (declaration) order.
pub struct LogEventBuilder {
    event: LogEvent,
    next_field: i32,
}

impl LogEventBuilder {
    pub fn with_origin(mut self, uid: i32, pid: i32) -> Self {
        self.event.uid = uid;
        self.event.pid = pid;
        self
    }

    fn push(&mut self, value: Value) -> &mut FieldValue {
        let field = Field::new(self.event.tag, field::get_simple_field(self.next_field));
        self.next_field += 1;
        self.event.values.push(FieldValue::new(field, value));
        self.event.values.last_mut().unwrap()
    }

    pub fn write_int(mut self, value: i32) -> Self {
        self.push(Value::Int(value));
        self
    }

    pub fn write_long(mut self, value: i64) -> Self {
        self.push(Value::Long(value));
        self
    }

    pub fn write_float(mut self, value: f32) -> Self {
        self.push(Value::Float(value));
        self
    }

    pub fn write_string(mut self, value: &str) -> Self {
        self.push(Value::Str(value.to_owned()));
        self
    }

    /// Writes an int field annotated as carrying a uid.
    pub fn write_uid(mut self, uid: i32) -> Self {
        self.push(Value::Int(uid)).annotations.set_uid_field(true);
        self
    }

    /// Writes an exclusive-state int field, optionally nested.
    pub fn write_state(mut self, value: i32, nested: bool) -> Self {
        let fv = self.push(Value::Int(value));
        fv.annotations.set_exclusive_state(true);
        fv.annotations.set_nested(nested);
        self
    }

    /// Writes a primary-field int used for state-key correlation.
    pub fn write_primary(mut self, value: i32) -> Self {
        self.push(Value::Int(value)).annotations.set_primary_field(true);
        self
    }

    /// Writes an attribution chain of `(uid, tag)` nodes as a depth-2
    /// repeated structure, applying last-child decorations.
    pub fn write_attribution_chain(mut self, nodes: &[(i32, &str)]) -> Self {
        let chain_field = self.next_field;
        self.next_field += 1;
        let node_count = nodes.len();
        for (node_idx, (uid, tag_name)) in nodes.iter().enumerate() {
            let node_pos = node_idx as i32 + 1;
            let is_last_node = node_idx + 1 == node_count;

            let mut uid_field =
                Field::from_path(self.event.tag, &[chain_field, node_pos, 1], 2);
            let mut tag_field =
                Field::from_path(self.event.tag, &[chain_field, node_pos, 2], 2);
            if is_last_node {
                uid_field.decorate_last_pos(1);
                tag_field.decorate_last_pos(1);
            }
            tag_field.decorate_last_pos(2);

            let mut uid_value = FieldValue::new(uid_field, Value::Int(*uid));
            uid_value.annotations.set_uid_field(true);
            self.event.values.push(uid_value);
            self.event
                .values
                .push(FieldValue::new(tag_field, Value::Str((*tag_name).to_owned())));
        }
        self
    }

    pub fn build(self) -> LogEvent {
        self.event
    }
}

/// An ordered vector of field values usable as a map key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashableDimensionKey {
    values: Vec<FieldValue>,
}

impl HashableDimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Vec<FieldValue> {
        &mut self.values
    }

    pub fn add_value(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every value of `that` appears in `self`; the basis for
    /// partial-link condition queries.
    pub fn contains(&self, that: &HashableDimensionKey) -> bool {
        that.values.iter().all(|v| self.values.contains(v))
    }
}

impl fmt::Display for HashableDimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.is_empty() {
            return write!(f, "(default)");
        }
        for fv in &self.values {
            write!(f, "[{}:{}]", fv.field, fv.value)?;
        }
        Ok(())
    }
}

/// The full output key of a metric: the projection over the event's fields
/// plus the current values of the states the metric is sliced by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDimensionKey {
    dimension_key_in_what: HashableDimensionKey,
    state_values_key: HashableDimensionKey,
}

impl MetricDimensionKey {
    pub fn new(
        dimension_key_in_what: HashableDimensionKey,
        state_values_key: HashableDimensionKey,
    ) -> Self {
        Self {
            dimension_key_in_what,
            state_values_key,
        }
    }

    pub fn dimension_key_in_what(&self) -> &HashableDimensionKey {
        &self.dimension_key_in_what
    }

    pub fn state_values_key(&self) -> &HashableDimensionKey {
        &self.state_values_key
    }

    pub fn state_values_key_mut(&mut self) -> &mut HashableDimensionKey {
        &mut self.state_values_key
    }
}

impl fmt::Display for MetricDimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            self.dimension_key_in_what, self.state_values_key
        )
    }
}

/// Projects an event's values through translated dimension matchers,
/// stripping position decorations so equal logical dimensions collide.
pub fn filter_values(matchers: &[FieldMask], values: &[FieldValue]) -> HashableDimensionKey {
    let mut output = HashableDimensionKey::default();
    for matcher in matchers {
        for value in values {
            if value.field.matches(matcher) {
                let mut projected = value.clone();
                projected
                    .field
                    .set_field(value.field.field() & matcher.mask());
                output.add_value(projected);
            }
        }
    }
    output
}
