//! Compact field addressing and the mask-based matcher.
//!
//! A leaf inside a structured atom is addressed by two 32-bit words: the
//! atom tag and a path word split into four 8-bit lanes,
//! `[depth][pos@0][pos@1][pos@2]`. Positions are 1-based; the high bit of a
//! position lane marks the last child at that level. Matching a field
//! against a matcher is a single AND plus an equality check, which keeps the
//! per-field cost of the hot path at a couple of instructions.

use crate::core::config::{FieldMatcher as FieldMatcherConfig, Position};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of repeated-structure levels below the atom root.
pub const MAX_LOG_DEPTH: usize = 2;
/// High bit of a position lane: last child at that level.
pub const LAST_BIT_MASK: i32 = 0x80;
/// Clears the last-child decoration from a position lane.
pub const CLEAR_LAST_BIT: i32 = 0x7f;
/// Clears every position lane covered by positional matchers; two matchers
/// equal under this mask differ only in position decorations.
pub const CLEAR_ALL_POSITION_MATCHER_MASK: i32 = 0xffff_00ffu32 as i32;

/// Encodes a position path into a field word.
///
/// Lanes `0..=depth` are written; `include_depth` also writes the depth into
/// the top lane (matcher masks leave it out and OR in `0xff` instead).
pub fn encode_field(pos: &[i32; 3], depth: usize, include_depth: bool) -> i32 {
    let mut field = 0i32;
    for (i, p) in pos.iter().enumerate().take(depth + 1) {
        let shift = 8 * (MAX_LOG_DEPTH - i);
        field |= p << shift;
    }
    if include_depth {
        field |= (depth as i32) << 24;
    }
    field
}

/// Encodes per-lane mask bytes into a matcher mask word. The depth lane is
/// always fully compared.
pub fn encode_matcher_mask(mask: &[i32; 3], depth: usize) -> i32 {
    encode_field(mask, depth, false) | (0xff00_0000u32 as i32)
}

/// The field word for a leaf with the given field number at depth 0.
pub fn get_simple_field(field: i32) -> i32 {
    field << 16
}

/// Address of one leaf value: atom tag plus encoded path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Field {
    tag: i32,
    field: i32,
}

impl Field {
    pub fn new(tag: i32, field: i32) -> Self {
        Self { tag, field }
    }

    /// Builds a field from a position path at the given depth.
    pub fn from_path(tag: i32, pos: &[i32; 3], depth: usize) -> Self {
        Self {
            tag,
            field: encode_field(pos, depth, true),
        }
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn field(&self) -> i32 {
        self.field
    }

    pub fn set_field(&mut self, field: i32) {
        self.field = field;
    }

    pub fn set_tag(&mut self, tag: i32) {
        self.tag = tag;
    }

    pub fn depth(&self) -> i32 {
        self.field >> 24
    }

    /// The path truncated to the given depth, with deeper lanes zeroed.
    pub fn path(&self, depth: usize) -> i32 {
        if depth > MAX_LOG_DEPTH {
            return 0;
        }
        let field = self.field & 0x00ff_ffff;
        field & (-1i32 << (8 * (MAX_LOG_DEPTH - depth)))
    }

    /// The path of the enclosing sub-tree, one level up.
    pub fn prefix(&self, depth: usize) -> i32 {
        if depth == 0 {
            0
        } else {
            self.path(depth - 1)
        }
    }

    /// Position lane at `depth` including the last-child decoration.
    pub fn raw_pos_at_depth(&self, depth: usize) -> i32 {
        let field = self.field & 0x00ff_ffff;
        let shift = 8 * (MAX_LOG_DEPTH - depth);
        (field >> shift) & 0xff
    }

    /// Position lane at `depth` with the decoration cleared.
    pub fn pos_at_depth(&self, depth: usize) -> i32 {
        self.raw_pos_at_depth(depth) & CLEAR_LAST_BIT
    }

    /// Whether the element is (or descends from) the last child at `depth`.
    pub fn is_last_pos(&self, depth: usize) -> bool {
        let mask = LAST_BIT_MASK << (8 * (MAX_LOG_DEPTH - depth));
        (self.field & 0x00ff_ffff) & mask != 0
    }

    /// Whether the lane at `depth` is the any-position wildcard (all zeros).
    pub fn is_any_pos_matcher(&self, depth: usize) -> bool {
        self.depth() >= depth as i32 && self.raw_pos_at_depth(depth) == 0
    }

    /// Whether the lane at `depth` is the last-position wildcard (`0x80`).
    pub fn is_last_pos_matcher(&self, depth: usize) -> bool {
        self.depth() >= depth as i32 && self.raw_pos_at_depth(depth) == LAST_BIT_MASK
    }

    /// Sets the last-child decoration on the lane at `depth`.
    pub fn decorate_last_pos(&mut self, depth: usize) {
        self.field |= LAST_BIT_MASK << (8 * (MAX_LOG_DEPTH - depth));
    }

    /// Mask-and-compare against a matcher, with a second attempt ignoring
    /// the position lane when the matcher carries the all-position intent.
    pub fn matches(&self, matcher: &FieldMask) -> bool {
        if self.tag != matcher.field.tag {
            return false;
        }
        if (self.field & matcher.mask) == matcher.field.field {
            return true;
        }
        if matcher.has_all_position_matcher()
            && (self.field & (matcher.mask & CLEAR_ALL_POSITION_MATCHER_MASK))
                == matcher.field.field
        {
            return true;
        }
        false
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#010x}", self.tag, self.field as u32)
    }
}

/// A leaf matcher: a field pattern plus the mask selecting which bits of a
/// candidate field participate in the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMask {
    field: Field,
    mask: i32,
}

impl FieldMask {
    pub fn new(field: Field, mask: i32) -> Self {
        Self { field, mask }
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn mask(&self) -> i32 {
        self.mask
    }

    pub fn raw_mask_at_depth(&self, depth: usize) -> i32 {
        let masked = self.mask & 0x00ff_ffff;
        let shift = 8 * (MAX_LOG_DEPTH - depth);
        (masked >> shift) & 0xff
    }

    /// All-position intent at depth 1: value lane 0 under a full lane mask.
    pub fn has_all_position_matcher(&self) -> bool {
        self.field.depth() >= 1
            && self.field.raw_pos_at_depth(1) == 0
            && self.raw_mask_at_depth(1) == CLEAR_LAST_BIT
    }

    pub fn has_first_position_matcher(&self) -> bool {
        self.field.depth() >= 1 && self.field.raw_pos_at_depth(1) == 1
    }

    pub fn has_last_position_matcher(&self) -> bool {
        self.field.depth() >= 1 && self.field.is_last_pos_matcher(1)
    }

    /// Equality over everything but the position-decoration lanes.
    pub fn is_equal_without_position_bits(&self, that: &FieldMask) -> bool {
        (self.field.field() & CLEAR_ALL_POSITION_MATCHER_MASK)
            == (that.field.field() & CLEAR_ALL_POSITION_MATCHER_MASK)
    }
}

/// Matcher for a plain leaf field at depth 0.
pub fn simple_matcher(tag: i32, field: i32) -> FieldMask {
    FieldMask::new(
        Field::new(tag, get_simple_field(field)),
        0xff7f_0000u32 as i32,
    )
}

/// Matcher for the first uid in an attribution chain of the given atom.
pub fn first_uid_matcher(atom_id: i32) -> FieldMask {
    let pos = [1, 1, 1];
    FieldMask::new(Field::from_path(atom_id, &pos, 2), 0xff7f_7f7fu32 as i32)
}

/// Removes matchers that differ from an earlier one only in position
/// decorations; the surviving, more general matcher subsumes them.
pub fn dedup_field_matchers(matchers: &[FieldMask]) -> Vec<FieldMask> {
    let mut deduped: Vec<FieldMask> = Vec::with_capacity(matchers.len());
    for matcher in matchers {
        if !deduped
            .iter()
            .any(|kept| matcher.is_equal_without_position_bits(kept))
        {
            deduped.push(*matcher);
        }
    }
    deduped
}

/// Flattens a config field-matcher tree into leaf matchers with encoded
/// masks. The root's `field` is the atom tag; its children address fields.
pub fn translate_field_matcher(config: &FieldMatcherConfig, output: &mut Vec<FieldMask>) {
    let mut pos = [1i32, 1, 1];
    let mut mask = [CLEAR_LAST_BIT; 3];
    for child in &config.children {
        translate_node(config.field, child, 0, &mut pos, &mut mask, output);
    }
}

fn translate_node(
    tag: i32,
    node: &FieldMatcherConfig,
    mut depth: usize,
    pos: &mut [i32; 3],
    mask: &mut [i32; 3],
    output: &mut Vec<FieldMask>,
) {
    if depth > MAX_LOG_DEPTH {
        return;
    }
    pos[depth] = node.field;
    mask[depth] = CLEAR_LAST_BIT;

    if let Some(position) = node.position {
        depth += 1;
        if depth > MAX_LOG_DEPTH {
            return;
        }
        match position {
            Position::All => {
                pos[depth] = 0x00;
                mask[depth] = CLEAR_LAST_BIT;
            }
            Position::Any => {
                pos[depth] = 0x01;
                mask[depth] = 0x00;
            }
            Position::First => {
                pos[depth] = 0x01;
                mask[depth] = CLEAR_LAST_BIT;
            }
            Position::Last => {
                pos[depth] = LAST_BIT_MASK;
                mask[depth] = LAST_BIT_MASK;
            }
        }
    }

    if node.children.is_empty() {
        output.push(FieldMask::new(
            Field::from_path(tag, pos, depth),
            encode_matcher_mask(mask, depth),
        ));
    } else {
        depth += 1;
        if depth > MAX_LOG_DEPTH {
            return;
        }
        for child in &node.children {
            translate_node(tag, child, depth, pos, mask, output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_simple_field() {
        // Depth-0 leaf for field 2: lane 0 only, depth byte zero.
        let pos = [2, 1, 1];
        assert_eq!(encode_field(&pos, 0, true), 0x0002_0000);
        assert_eq!(get_simple_field(2), 0x0002_0000);
    }

    #[test]
    fn test_encode_nested_field() {
        // attribution_node[2].tag with node 2 last: decorations applied after.
        let pos = [1, 2, 2];
        let mut field = Field::from_path(10, &pos, 2);
        assert_eq!(field.field(), 0x0201_0202);
        field.decorate_last_pos(1);
        field.decorate_last_pos(2);
        assert_eq!(field.field(), 0x0201_8282);
        assert_eq!(field.depth(), 2);
        assert_eq!(field.pos_at_depth(1), 2);
        assert_eq!(field.pos_at_depth(2), 2);
        assert!(field.is_last_pos(1));
        assert!(field.is_last_pos(2));
    }

    #[test]
    fn test_path_round_trip() {
        // Encoding then reading back positions is lossless for all small
        // paths at every depth.
        for depth in 0..=MAX_LOG_DEPTH {
            for a in 1..=5 {
                for b in 1..=5 {
                    for c in 1..=5 {
                        let pos = [a, b, c];
                        let field = Field::from_path(1, &pos, depth);
                        for (d, expected) in pos.iter().enumerate().take(depth + 1) {
                            assert_eq!(field.pos_at_depth(d), *expected);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_prefix() {
        let pos = [1, 2, 3];
        let field = Field::from_path(1, &pos, 2);
        assert_eq!(field.prefix(2), 0x0001_0200);
        assert_eq!(field.prefix(1), 0x0001_0000);
        assert_eq!(field.prefix(0), 0);
    }

    #[test]
    fn test_simple_matcher_matches() {
        let matcher = simple_matcher(10, 2);
        let field = Field::new(10, get_simple_field(2));
        assert!(field.matches(&matcher));

        let wrong_tag = Field::new(11, get_simple_field(2));
        assert!(!wrong_tag.matches(&matcher));

        let wrong_field = Field::new(10, get_simple_field(3));
        assert!(!wrong_field.matches(&matcher));
    }

    #[test]
    fn test_first_and_last_position_matchers() {
        let first = first_uid_matcher(10);
        assert!(first.has_first_position_matcher());

        // uid of the first attribution node.
        let mut field = Field::from_path(10, &[1, 1, 1], 2);
        assert!(field.matches(&first));

        // uid of the second node does not match FIRST.
        let second = Field::from_path(10, &[1, 2, 1], 2);
        assert!(!second.matches(&first));

        // LAST matcher: value 0x80 under mask 0x80 at lane 1.
        let last = FieldMask::new(
            Field::new(10, 0x0201_8001u32 as i32),
            0xff7f_807fu32 as i32,
        );
        assert!(last.has_last_position_matcher());
        assert!(!field.matches(&last));
        field.decorate_last_pos(1);
        assert!(field.matches(&last));
    }

    #[test]
    fn test_all_position_matcher_matches_any_index() {
        // ALL: value lane 0, mask lane 0x7f; the fallback comparison strips
        // the position lane.
        let all = FieldMask::new(Field::new(10, 0x0201_0001), 0xff7f_7f7fu32 as i32);
        assert!(all.has_all_position_matcher());
        for node in 1..=3 {
            let field = Field::from_path(10, &[1, node, 1], 2);
            assert!(field.matches(&all), "node {} should match ALL", node);
        }
    }

    #[test]
    fn test_dedup_field_matchers() {
        let first = first_uid_matcher(10);
        let last = FieldMask::new(
            Field::new(10, 0x0201_8001u32 as i32),
            0xff7f_807fu32 as i32,
        );
        let other = simple_matcher(10, 2);
        let deduped = dedup_field_matchers(&[first, last, other]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], first);
        assert_eq!(deduped[1], other);
    }

    #[test]
    fn test_translate_field_matcher() {
        use crate::core::config::FieldMatcher as Cfg;

        // atom 10, attribution chain in field 1, FIRST position, uid leaf.
        let config = Cfg {
            field: 10,
            position: None,
            children: vec![Cfg {
                field: 1,
                position: Some(Position::First),
                children: vec![Cfg::leaf(1)],
            }],
        };
        let mut out = Vec::new();
        translate_field_matcher(&config, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], first_uid_matcher(10));
    }

    #[test]
    fn test_translate_last_position() {
        use crate::core::config::FieldMatcher as Cfg;

        let config = Cfg {
            field: 10,
            position: None,
            children: vec![Cfg {
                field: 1,
                position: Some(Position::Last),
                children: vec![Cfg::leaf(1)],
            }],
        };
        let mut out = Vec::new();
        translate_field_matcher(&config, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field().field(), 0x0201_8001u32 as i32);
        assert_eq!(out[0].mask(), 0xff7f_807fu32 as i32);
    }
}
