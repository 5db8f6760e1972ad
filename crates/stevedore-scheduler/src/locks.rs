//! Lock table — reference-counted run-spec locks.
//!
//! Owned exclusively by the scheduler core's single worker; never
//! shared, never synchronized. An entry is absent iff its count is
//! zero, so every stored count is at least one.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use stevedore_core::RunSpecId;

/// Reference-counted locks over run spec ids.
#[derive(Debug, Default)]
pub struct LockTable {
    counts: BTreeMap<RunSpecId, u32>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire all of `ids` iff none is currently locked, then run `f`.
    ///
    /// Returns `None` without mutating anything when any id is held.
    pub fn with_lock_for<R>(
        &mut self,
        ids: &BTreeSet<RunSpecId>,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        if ids.iter().any(|id| self.counts.contains_key(id)) {
            return None;
        }
        self.add_locks(ids.iter().cloned());
        Some(f())
    }

    /// Unconditionally increment the count of every id.
    pub fn add_locks(&mut self, ids: impl IntoIterator<Item = RunSpecId>) {
        for id in ids {
            *self.counts.entry(id).or_insert(0) += 1;
        }
    }

    /// Decrement one id's count, deleting the entry at zero.
    pub fn remove_lock(&mut self, id: &RunSpecId) {
        match self.counts.get_mut(id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.counts.remove(id);
            }
            None => warn!(run_spec = %id, "lock release for unlocked run spec"),
        }
    }

    /// Decrement every id's count.
    pub fn remove_locks<'a>(&mut self, ids: impl IntoIterator<Item = &'a RunSpecId>) {
        for id in ids {
            self.remove_lock(id);
        }
    }

    pub fn is_locked(&self, id: &RunSpecId) -> bool {
        self.counts.contains_key(id)
    }

    /// Drop every lock (leadership loss).
    pub fn clear(&mut self) {
        if !self.counts.is_empty() {
            debug!(locks = self.counts.len(), "clearing lock table");
        }
        self.counts.clear();
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Every stored count, for invariant assertions.
    #[cfg(test)]
    fn counts(&self) -> &BTreeMap<RunSpecId, u32> {
        &self.counts
    }
}
