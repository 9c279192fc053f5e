//! Incrementally maintained membership indexes.
//!
//! A [`ComponentIndex`] is the set of entities whose composition satisfies an
//! [`IndexFilter`]: every required type present, no excluded type present.
//! Indexes are declared on the store builder and kept current by one
//! `index:<name>` interceptor each, running at
//! [`TransactionStage::UpdateIndexes`](crate::pipeline::TransactionStage::UpdateIndexes)
//! while the commit still holds the entity lock.
//!
//! Membership is copy-on-write. Readers clone the current `Arc` snapshot and
//! iterate it without holding anything; the update path takes the index's own
//! mutex, and only for commits that touched a type the index tracks.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::component::{ComponentSet, ComponentTypeId};
use crate::entity::EntityId;
use crate::entity_ref::EntityRef;
use crate::pipeline::{TransactionContext, TransactionInterceptor};
use crate::state::CommitSet;
use crate::table::ComponentTable;
use crate::TransactionError;

// ---------------------------------------------------------------------------
// IndexFilter
// ---------------------------------------------------------------------------

/// Composition predicate of an index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFilter {
    required: ComponentSet,
    excluded: ComponentSet,
}

impl IndexFilter {
    /// A filter that matches nothing until types are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Members must carry `ty`.
    pub fn require(mut self, ty: ComponentTypeId) -> Self {
        self.required.insert(ty);
        self
    }

    /// Members must not carry `ty`.
    pub fn exclude(mut self, ty: ComponentTypeId) -> Self {
        self.excluded.insert(ty);
        self
    }

    /// Required types.
    pub fn required(&self) -> &ComponentSet {
        &self.required
    }

    /// Excluded types.
    pub fn excluded(&self) -> &ComponentSet {
        &self.excluded
    }

    /// Every type whose presence affects the filter.
    pub fn tracked(&self) -> ComponentSet {
        self.required.iter().chain(self.excluded.iter()).collect()
    }

    /// Whether neither required nor excluded types were given.
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.excluded.is_empty()
    }

    /// Inclusion predicate over a composition.
    pub fn matches(&self, composition: &ComponentSet) -> bool {
        !composition.is_empty()
            && composition.is_superset(&self.required)
            && !composition.intersects(&self.excluded)
    }
}

// ---------------------------------------------------------------------------
// ComponentIndex
// ---------------------------------------------------------------------------

/// A derived set of entity ids matching an [`IndexFilter`].
#[derive(Debug)]
pub struct ComponentIndex {
    name: String,
    filter: IndexFilter,
    tracked: ComponentSet,
    members: RwLock<Arc<HashSet<EntityId>>>,
    update: Mutex<()>,
}

impl ComponentIndex {
    pub(crate) fn new(name: &str, filter: IndexFilter) -> Self {
        let tracked = filter.tracked();
        Self {
            name: name.to_owned(),
            filter,
            tracked,
            members: RwLock::new(Arc::new(HashSet::new())),
            update: Mutex::new(()),
        }
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filter this index maintains.
    pub fn filter(&self) -> &IndexFilter {
        &self.filter
    }

    /// Whether `entity` is currently a member. Pending and null references
    /// are never members.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        let id = entity.id();
        !id.is_null() && self.members.read().contains(&id)
    }

    /// The current membership set. Later commits don't affect the snapshot.
    pub fn snapshot(&self) -> Arc<HashSet<EntityId>> {
        Arc::clone(&self.members.read())
    }

    /// Members of the current snapshot in ascending id order.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.snapshot().iter().copied().collect();
        ids.sort();
        ids
    }

    /// Iterate members of the current snapshot as concrete references.
    pub fn iter(&self) -> impl Iterator<Item = EntityRef> {
        self.ids().into_iter().map(EntityRef::Concrete)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether the index has no members.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Relevance pre-check: did the commit touch a type this index tracks?
    pub fn is_relevant(&self, touched: &ComponentSet) -> bool {
        touched.intersects(&self.tracked)
    }

    /// Re-test `ids` against the table. Returns `(added, removed)` counts.
    ///
    /// Must run while the caller holds the entity lock over `ids`, so the
    /// compositions read here are the post-commit ones.
    pub(crate) fn refresh(&self, table: &ComponentTable, ids: &[EntityId]) -> (usize, usize) {
        let _guard = self.update.lock();
        let current = self.snapshot();
        let mut next: Option<HashSet<EntityId>> = None;
        let (mut added, mut removed) = (0, 0);

        for &id in ids {
            let member = self.filter.matches(&table.composition(id));
            let present = next.as_ref().unwrap_or(&*current).contains(&id);
            if member == present {
                continue;
            }
            let set = next.get_or_insert_with(|| (*current).clone());
            if member {
                set.insert(id);
                added += 1;
            } else {
                set.remove(&id);
                removed += 1;
            }
        }

        if let Some(set) = next {
            *self.members.write() = Arc::new(set);
        }
        (added, removed)
    }
}

// ---------------------------------------------------------------------------
// UpdateIndexInterceptor
// ---------------------------------------------------------------------------

/// Keeps one index current. Registered as `index:<name>`.
pub struct UpdateIndexInterceptor {
    index: Arc<ComponentIndex>,
    table: Arc<ComponentTable>,
}

impl UpdateIndexInterceptor {
    pub fn new(index: Arc<ComponentIndex>, table: Arc<ComponentTable>) -> Self {
        Self { index, table }
    }
}

impl TransactionInterceptor for UpdateIndexInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        let Some(set) = context.attachment::<CommitSet>() else {
            return Ok(());
        };
        if !self.index.is_relevant(&set.changed_component_types()) {
            return Ok(());
        }
        let (added, removed) = self.index.refresh(&self.table, &set.entity_ids());
        tracing::trace!(
            index = %self.index.name(),
            added,
            removed,
            "index refreshed"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
