//! Per-operation tables that give shared and cyclic values exactly one
//! wire encoding.
//!
//! A table lives for a single encode or a single decode and is never
//! reused. Indices are assigned in order of first appearance during
//! traversal; the decode side replays the same order from the byte
//! stream, so the table itself is never transmitted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::value::Value;

/// Outcome of looking up a composite on the encode side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// First sighting. The value now owns this index and must be
    /// emitted in full.
    Assigned(usize),
    /// The value was already emitted under this index; emit a
    /// back-reference instead.
    Seen(usize),
}

/// Encode-side table keyed by handle identity.
#[derive(Debug, Default)]
pub(crate) struct EncodeRefs {
    indices: HashMap<usize, usize>,
}

impl EncodeRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit(&mut self, identity: usize) -> Slot {
        let next = self.indices.len();
        match self.indices.entry(identity) {
            Entry::Occupied(entry) => Slot::Seen(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(next);
                Slot::Assigned(next)
            }
        }
    }
}

/// Decode-side table: shared values in the order their encodings first
/// appeared in the stream.
#[derive(Debug, Default)]
pub(crate) struct DecodeRefs {
    values: Vec<Value>,
}

impl DecodeRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Cloned handle for `index`, or `None` for a slot that has not
    /// been assigned yet. Forward references are not legal in this
    /// protocol, so `None` is always a caller error to report.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.get(index).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn indices_follow_first_appearance() {
        let a = Value::map(vec![]);
        let b = Value::list(vec![]);
        let mut refs = EncodeRefs::new();
        assert_eq!(refs.visit(a.identity().unwrap()), Slot::Assigned(0));
        assert_eq!(refs.visit(b.identity().unwrap()), Slot::Assigned(1));
        assert_eq!(refs.visit(a.identity().unwrap()), Slot::Seen(0));
        assert_eq!(refs.visit(b.identity().unwrap()), Slot::Seen(1));
    }

    #[test]
    fn structurally_equal_values_are_not_merged() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = Value::list(vec![Value::Int(1)]);
        let mut refs = EncodeRefs::new();
        assert_eq!(refs.visit(a.identity().unwrap()), Slot::Assigned(0));
        assert_eq!(refs.visit(b.identity().unwrap()), Slot::Assigned(1));
    }

    #[test]
    fn unassigned_slot_is_none() {
        let mut refs = DecodeRefs::new();
        assert!(refs.get(0).is_none());
        refs.push(Value::map(vec![]));
        assert!(refs.get(0).is_some());
        assert!(refs.get(1).is_none());
    }
}
