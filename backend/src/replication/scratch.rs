//! Per-worker scratch table
//!
//! One scratch object per worker slot, built before any trial runs and
//! reused for every trial that slot executes. Expensive setup (cloning a
//! model, allocating buffers) is paid once per slot instead of once per
//! trial, and slots never share mutable state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a worker slot within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Arena of scratch objects keyed by [`SlotId`]
///
/// # Example
/// ```
/// use replicate_core_rs::{ScratchTable, SlotId};
///
/// let mut table = ScratchTable::build(3, |slot| vec![slot.index(); 4]);
/// assert_eq!(table.len(), 3);
///
/// for (slot, buf) in table.slots_mut() {
///     buf.push(slot.index() * 10);
/// }
/// assert_eq!(table.get(SlotId(2)).unwrap().last(), Some(&20));
/// ```
#[derive(Debug, Clone)]
pub struct ScratchTable<S> {
    slots: Vec<S>,
}

impl<S> ScratchTable<S> {
    /// Call `factory` once per slot, in slot order
    pub fn build(slots: usize, mut factory: impl FnMut(SlotId) -> S) -> Self {
        Self {
            slots: (0..slots).map(|i| factory(SlotId(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: SlotId) -> Option<&S> {
        self.slots.get(slot.0)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut S> {
        self.slots.get_mut(slot.0)
    }

    /// Disjoint mutable access to every slot, for handing out to workers
    pub fn slots_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut S)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, scratch)| (SlotId(i), scratch))
    }

    pub fn into_inner(self) -> Vec<S> {
        self.slots
    }
}
