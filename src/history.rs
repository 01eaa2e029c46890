//! Bounded undo/redo over whole-composition snapshots.

use crate::model::Composition;
use std::collections::VecDeque;

/// Number of edits that can be undone.
pub const MAX_HISTORY_SIZE: usize = 10;

/// The composition as it was before an edit.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub composition: Composition,

    /// Name of the edit that followed, for log messages.
    pub description: &'static str,
}

impl StateSnapshot {
    pub fn new(composition: &Composition, description: &'static str) -> Self {
        Self {
            composition: composition.clone(),
            description,
        }
    }
}

/// Undo and redo rings, newest at the back.
///
/// Recording an edit discards the redo ring. Each ring holds at most
/// [`MAX_HISTORY_SIZE`] snapshots; the oldest falls off the front.
#[derive(Debug, Default)]
pub struct HistoryManager {
    undo: VecDeque<StateSnapshot>,
    redo: VecDeque<StateSnapshot>,
}

fn push_bounded(ring: &mut VecDeque<StateSnapshot>, snapshot: StateSnapshot) {
    if ring.len() == MAX_HISTORY_SIZE {
        ring.pop_front();
    }
    ring.push_back(snapshot);
}

impl HistoryManager {
    pub fn new() -> Self {
        Self {
            undo: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            redo: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    /// Records the state taken before an edit.
    pub fn push_undo(&mut self, snapshot: StateSnapshot) {
        self.redo.clear();
        push_bounded(&mut self.undo, snapshot);
    }

    /// Swaps `current` with the newest undo snapshot, keeping `current` for
    /// redo. Returns the undone edit's description, or None (and leaves
    /// `current` alone) if there is nothing to undo.
    pub fn undo(&mut self, current: &mut Composition) -> Option<&'static str> {
        let snapshot = self.undo.pop_back()?;
        Some(swap_into(current, snapshot, &mut self.redo))
    }

    /// Reverse of [`undo`](Self::undo). The redo ring survives.
    pub fn redo(&mut self, current: &mut Composition) -> Option<&'static str> {
        let snapshot = self.redo.pop_back()?;
        Some(swap_into(current, snapshot, &mut self.undo))
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Forgets everything, e.g. after a different composition is installed.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    #[cfg(test)]
    fn undo_count(&self) -> usize {
        self.undo.len()
    }
}

/// Installs `snapshot` as the current composition and pushes what it
/// replaced onto `other`.
fn swap_into(
    current: &mut Composition,
    snapshot: StateSnapshot,
    other: &mut VecDeque<StateSnapshot>,
) -> &'static str {
    let replaced = std::mem::replace(current, snapshot.composition);
    push_bounded(
        other,
        StateSnapshot {
            composition: replaced,
            description: snapshot.description,
        },
    );
    snapshot.description
}
