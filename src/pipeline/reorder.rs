//! Holds completed frames until every earlier frame id has resolved.

use std::collections::BTreeMap;

use crate::frame::FrameId;

pub struct ReorderBuffer<T> {
    next_expected: FrameId,
    pending: BTreeMap<FrameId, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    /// Buffer expecting frame 1 first.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: FrameId) -> Self {
        Self {
            next_expected: first,
            pending: BTreeMap::new(),
        }
    }

    /// Hold `item` for `frame_id`. Returns false, and keeps nothing, for an
    /// id that was already delivered or is already held.
    pub fn insert(&mut self, frame_id: FrameId, item: T) -> bool {
        if frame_id < self.next_expected || self.pending.contains_key(&frame_id) {
            return false;
        }
        self.pending.insert(frame_id, item);
        true
    }

    /// Next item in frame order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<(FrameId, T)> {
        let item = self.pending.remove(&self.next_expected)?;
        let id = self.next_expected;
        self.next_expected += 1;
        Some((id, item))
    }

    /// Everything still held, in frame order, skipping gaps.
    pub fn drain_all(&mut self) -> Vec<(FrameId, T)> {
        let drained: Vec<(FrameId, T)> = std::mem::take(&mut self.pending).into_iter().collect();
        if let Some((last, _)) = drained.last() {
            self.next_expected = last + 1;
        }
        drained
    }

    pub fn next_expected(&self) -> FrameId {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
