//! Atomic multi-entity locking.
//!
//! [`EntityLockManager::acquire`] locks a whole set of entity ids in one step:
//! it waits until *none* of the requested ids is held and then marks all of
//! them held together. A transaction never holds a subset of its ids while
//! waiting for the rest, so two commits touching overlapping sets cannot
//! deadlock on each other regardless of the order they list their ids in.
//!
//! The returned [`EntityLock`] is a scoped guard: dropping it releases every
//! id it holds, on every exit path including unwinding.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::entity::EntityId;

// ---------------------------------------------------------------------------
// EntityLockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockState {
    held: Mutex<HashSet<EntityId>>,
    released: Condvar,
}

/// Hands out [`EntityLock`]s over sets of entity ids.
#[derive(Debug, Clone, Default)]
pub struct EntityLockManager {
    state: Arc<LockState>,
}

impl EntityLockManager {
    /// Create a manager with nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every id in `ids` is free, then hold them all.
    pub fn acquire(&self, ids: impl IntoIterator<Item = EntityId>) -> EntityLock {
        let ids: Vec<EntityId> = {
            let mut ids: Vec<EntityId> = ids.into_iter().filter(|id| !id.is_null()).collect();
            ids.sort();
            ids.dedup();
            ids
        };

        let mut held = self.state.held.lock();
        while ids.iter().any(|id| held.contains(id)) {
            self.state.released.wait(&mut held);
        }
        held.extend(ids.iter().copied());
        drop(held);

        tracing::trace!(count = ids.len(), "entity lock acquired");
        EntityLock {
            state: Arc::clone(&self.state),
            ids,
        }
    }

    /// Whether `id` is currently held by some lock.
    pub fn is_locked(&self, id: EntityId) -> bool {
        self.state.held.lock().contains(&id)
    }

    /// Number of ids currently held across all locks.
    pub fn held_count(&self) -> usize {
        self.state.held.lock().len()
    }
}

// ---------------------------------------------------------------------------
// EntityLock
// ---------------------------------------------------------------------------

/// A held set of entity ids. Released on drop.
#[derive(Debug)]
pub struct EntityLock {
    state: Arc<LockState>,
    ids: Vec<EntityId>,
}

impl EntityLock {
    /// Ids held by this lock, ascending.
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    /// Extend the lock with freshly allocated ids.
    ///
    /// Blocks while any of `ids` is held by another lock. The ids this lock
    /// already holds stay held while it waits, which is safe because every
    /// other lock is taken all at once and never waits while holding.
    pub fn adopt(&mut self, ids: impl IntoIterator<Item = EntityId>) {
        let mut fresh: Vec<EntityId> = ids
            .into_iter()
            .filter(|id| !id.is_null() && !self.ids.contains(id))
            .collect();
        fresh.sort();
        fresh.dedup();
        if fresh.is_empty() {
            return;
        }

        let mut held = self.state.held.lock();
        while fresh.iter().any(|id| held.contains(id)) {
            self.state.released.wait(&mut held);
        }
        held.extend(fresh.iter().copied());
        drop(held);

        self.ids.extend(fresh);
        self.ids.sort();
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut held = self.state.held.lock();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.state.released.notify_all();
        tracing::trace!(count = self.ids.len(), "entity lock released");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
