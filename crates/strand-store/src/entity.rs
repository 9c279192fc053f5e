//! Entity identifiers and allocation.
//!
//! An [`EntityId`] is a 64-bit handle. Id `0` is reserved as the "no entity"
//! sentinel ([`EntityId::NULL`]); real ids are handed out monotonically from
//! `1` and are never recycled, so a stale id can never alias a newer entity.
//!
//! An entity *exists* only while it owns at least one component in the
//! [`ComponentTable`](crate::table::ComponentTable). Allocating an id does not
//! create anything by itself.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// An opaque entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// The "no entity" sentinel.
    pub const NULL: EntityId = EntityId(0);

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the [`NULL`](Self::NULL) sentinel.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityIdAllocator
// ---------------------------------------------------------------------------

/// Hands out fresh [`EntityId`]s.
///
/// The allocator has its own lock, independent of the entity lock, held only
/// for the duration of an allocation.
#[derive(Debug)]
pub struct EntityIdAllocator {
    next: Mutex<u64>,
}

impl EntityIdAllocator {
    /// Create an allocator whose first id is `1`.
    pub fn new() -> Self {
        Self { next: Mutex::new(1) }
    }

    /// Allocate one fresh id.
    pub fn allocate(&self) -> EntityId {
        let mut next = self.next.lock();
        let id = EntityId(*next);
        *next += 1;
        id
    }

    /// Allocate `count` consecutive fresh ids under a single lock acquisition.
    pub fn allocate_many(&self, count: usize) -> Vec<EntityId> {
        let mut next = self.next.lock();
        let start = *next;
        *next += count as u64;
        (start..start + count as u64).map(EntityId).collect()
    }

    /// The id the next call to [`allocate`](Self::allocate) will return.
    pub fn peek_next(&self) -> EntityId {
        EntityId(*self.next.lock())
    }

    /// Whether `id` has ever been handed out by this allocator.
    pub fn is_allocated(&self, id: EntityId) -> bool {
        !id.is_null() && id.0 < *self.next.lock()
    }
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_unique_ids() {
        let alloc = EntityIdAllocator::new();
        let mut ids: Vec<EntityId> = (0..100).map(|_| alloc.allocate()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| !id.is_null()));
    }

    #[test]
    fn first_id_is_one() {
        let alloc = EntityIdAllocator::new();
        assert_eq!(alloc.peek_next(), EntityId::from_raw(1));
        assert_eq!(alloc.allocate(), EntityId::from_raw(1));
        assert_eq!(alloc.peek_next(), EntityId::from_raw(2));
    }

    #[test]
    fn allocate_many_is_contiguous() {
        let alloc = EntityIdAllocator::new();
        alloc.allocate();
        let ids = alloc.allocate_many(3);
        assert_eq!(
            ids,
            vec![
                EntityId::from_raw(2),
                EntityId::from_raw(3),
                EntityId::from_raw(4)
            ]
        );
        assert_eq!(alloc.allocate(), EntityId::from_raw(5));
    }

    #[test]
    fn is_allocated_tracks_handed_out_ids() {
        let alloc = EntityIdAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.is_allocated(e));
        assert!(!alloc.is_allocated(EntityId::NULL));
        assert!(!alloc.is_allocated(alloc.peek_next()));
    }

    #[test]
    fn concurrent_allocation_never_duplicates() {
        let alloc = EntityIdAllocator::new();
        let mut all = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..250).map(|_| alloc.allocate()).collect::<Vec<_>>()))
                .collect();
            for h in handles {
                all.extend(h.join().unwrap());
            }
        });
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn null_sentinel() {
        assert!(EntityId::NULL.is_null());
        assert_eq!(EntityId::NULL.to_raw(), 0);
        assert_eq!(format!("{}", EntityId::from_raw(7)), "#7");
    }
}
