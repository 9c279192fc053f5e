//! Transaction-scoped staging state.
//!
//! A transaction caches every component it touches in a [`CacheEntry`] that
//! holds the staged value and an [`Action`] describing what commit must do to
//! the table. Entries are grouped per entity: [`EntityState`] for entities
//! that already have an id, [`NewEntityState`] for entities created inside
//! the transaction. The whole lot is a [`CommitSet`], which is also what the
//! commit pipeline receives as an attachment.
//!
//! # Action transitions
//!
//! Actions collapse so that commit only ever sees the *net* effect:
//!
//! | current  | add      | remove   | mutable access |
//! |----------|----------|----------|----------------|
//! | `None`   | `Add`    | `Remove` | `Update`       |
//! | `Add`    | --       | `None`   | `Add`          |
//! | `Update` | --       | `Remove` | `Update`       |
//! | `Remove` | `Update` | --       | --             |
//!
//! "--" cells are precondition violations rejected before the transition.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::component::{BoxedComponent, ComponentSet, ComponentTypeId, ComponentValue};
use crate::entity::EntityId;
use crate::entity_ref::{EntityRef, ProxyRef};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What commit must do with a cached component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    /// Read only; nothing to write.
    None,
    /// Insert into the table (absent there).
    Add,
    /// Overwrite the table's value (present there).
    Update,
    /// Delete from the table (present there).
    Remove,
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A staged (entity, component type) record.
#[derive(Debug)]
pub struct CacheEntry {
    component: Option<BoxedComponent>,
    action: Action,
}

impl CacheEntry {
    /// An entry mirroring what the table held when first read.
    pub(crate) fn loaded(component: Option<BoxedComponent>) -> Self {
        Self {
            component,
            action: Action::None,
        }
    }

    /// The staged value, if the component is present in the staged view.
    pub fn component(&self) -> Option<&dyn ComponentValue> {
        self.component.as_deref()
    }

    pub(crate) fn component_mut(&mut self) -> Option<&mut BoxedComponent> {
        self.component.as_mut()
    }

    /// Pending action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Whether the component is present in the staged view.
    pub fn is_present(&self) -> bool {
        self.component.is_some()
    }

    /// Stage `value` into an absent slot.
    ///
    /// Caller guarantees `!self.is_present()`.
    pub(crate) fn stage_add(&mut self, value: BoxedComponent) {
        debug_assert!(!self.is_present());
        self.action = match self.action {
            Action::Remove => Action::Update,
            _ => Action::Add,
        };
        self.component = Some(value);
    }

    /// Stage removal of a present component and hand back its staged value.
    ///
    /// Caller guarantees `self.is_present()`.
    pub(crate) fn stage_remove(&mut self) -> Option<BoxedComponent> {
        self.action = match self.action {
            Action::Add => Action::None,
            _ => Action::Remove,
        };
        self.component.take()
    }

    /// Record that the caller took mutable access to a present component.
    pub(crate) fn mark_updated(&mut self) {
        if self.action == Action::None && self.is_present() {
            self.action = Action::Update;
        }
    }
}

fn set_for(entries: &BTreeMap<ComponentTypeId, CacheEntry>, action: Action) -> ComponentSet {
    entries
        .iter()
        .filter(|(_, entry)| entry.action == action)
        .map(|(ty, _)| *ty)
        .collect()
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// Staged state of one pre-existing entity.
#[derive(Debug)]
pub struct EntityState {
    id: EntityId,
    expected_revision: u64,
    committed_revision: Option<u64>,
    pub(crate) components: BTreeMap<ComponentTypeId, CacheEntry>,
}

impl EntityState {
    pub(crate) fn new(id: EntityId, expected_revision: u64) -> Self {
        Self {
            id,
            expected_revision,
            committed_revision: None,
            components: BTreeMap::new(),
        }
    }

    /// Entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Table revision observed when the transaction first touched the entity.
    pub fn expected_revision(&self) -> u64 {
        self.expected_revision
    }

    /// Revision after this transaction's commit applied, once it has.
    pub fn committed_revision(&self) -> Option<u64> {
        self.committed_revision
    }

    pub(crate) fn set_committed_revision(&mut self, revision: u64) {
        self.committed_revision = Some(revision);
    }

    /// Cached entries by component type.
    pub fn entries(&self) -> impl Iterator<Item = (ComponentTypeId, &CacheEntry)> {
        self.components.iter().map(|(ty, entry)| (*ty, entry))
    }

    /// Components this transaction adds.
    pub fn added(&self) -> ComponentSet {
        set_for(&self.components, Action::Add)
    }

    /// Components this transaction modifies.
    pub fn updated(&self) -> ComponentSet {
        set_for(&self.components, Action::Update)
    }

    /// Components this transaction removes.
    pub fn removed(&self) -> ComponentSet {
        set_for(&self.components, Action::Remove)
    }

    /// Whether commit will write anything for this entity.
    pub fn has_changes(&self) -> bool {
        self.components.values().any(|e| e.action != Action::None)
    }
}

// ---------------------------------------------------------------------------
// NewEntityState
// ---------------------------------------------------------------------------

/// Staged state of an entity created inside the transaction.
#[derive(Debug)]
pub struct NewEntityState {
    proxy: ProxyRef,
    assigned: Option<EntityId>,
    committed_revision: Option<u64>,
    pub(crate) components: BTreeMap<ComponentTypeId, CacheEntry>,
}

impl NewEntityState {
    pub(crate) fn new(proxy: ProxyRef) -> Self {
        Self {
            proxy,
            assigned: None,
            committed_revision: None,
            components: BTreeMap::new(),
        }
    }

    /// The proxy handed out to the caller for this entity.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::Proxy(self.proxy.clone())
    }

    pub(crate) fn proxy(&self) -> &ProxyRef {
        &self.proxy
    }

    /// Id assigned during commit, if the entity was materialized.
    pub fn assigned_id(&self) -> Option<EntityId> {
        self.assigned
    }

    pub(crate) fn assign(&mut self, id: EntityId) {
        self.assigned = Some(id);
    }

    /// Revision after commit applied, once it has.
    pub fn committed_revision(&self) -> Option<u64> {
        self.committed_revision
    }

    pub(crate) fn set_committed_revision(&mut self, revision: u64) {
        self.committed_revision = Some(revision);
    }

    /// Cached entries by component type.
    pub fn entries(&self) -> impl Iterator<Item = (ComponentTypeId, &CacheEntry)> {
        self.components.iter().map(|(ty, entry)| (*ty, entry))
    }

    /// Components that will be written when the entity is materialized.
    pub fn added(&self) -> ComponentSet {
        set_for(&self.components, Action::Add)
    }

    /// Number of components staged on the entity.
    pub fn staged_count(&self) -> usize {
        self.components.values().filter(|e| e.is_present()).count()
    }
}

// ---------------------------------------------------------------------------
// CommitSet
// ---------------------------------------------------------------------------

/// Everything a transaction has staged.
#[derive(Debug, Default)]
pub struct CommitSet {
    transaction: u64,
    pub(crate) entities: BTreeMap<EntityId, EntityState>,
    pub(crate) new_entities: Vec<NewEntityState>,
}

impl CommitSet {
    pub(crate) fn new(transaction: u64) -> Self {
        Self {
            transaction,
            entities: BTreeMap::new(),
            new_entities: Vec::new(),
        }
    }

    /// Id of the transaction round this set belongs to.
    pub fn transaction_id(&self) -> u64 {
        self.transaction
    }

    /// Pre-existing entities touched by the transaction, by id.
    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    /// Entities created by the transaction, in creation order.
    pub fn new_entities(&self) -> &[NewEntityState] {
        &self.new_entities
    }

    /// Ids of touched pre-existing entities plus ids assigned to new ones so
    /// far, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.extend(self.new_entities.iter().filter_map(|n| n.assigned));
        ids.sort();
        ids
    }

    /// Component types this commit writes (any non-`None` action).
    pub fn changed_component_types(&self) -> ComponentSet {
        let existing = self.entities.values().flat_map(|s| {
            s.components
                .iter()
                .filter(|(_, e)| e.action != Action::None)
                .map(|(ty, _)| *ty)
        });
        let created = self.new_entities.iter().flat_map(|s| {
            s.components
                .iter()
                .filter(|(_, e)| e.action != Action::None)
                .map(|(ty, _)| *ty)
        });
        existing.chain(created).collect()
    }

    /// Whether commit has anything to write or any entity to materialize.
    pub fn has_changes(&self) -> bool {
        self.entities.values().any(EntityState::has_changes)
            || self.new_entities.iter().any(|n| n.staged_count() > 0)
    }

    /// Whether the transaction touched nothing at all.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.new_entities.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Marker(u8);

    impl Component for Marker {}

    fn boxed(v: u8) -> BoxedComponent {
        Box::new(Marker(v))
    }

    #[test]
    fn add_then_remove_collapses_to_none() {
        let mut entry = CacheEntry::loaded(None);
        entry.stage_add(boxed(1));
        assert_eq!(entry.action(), Action::Add);
        entry.stage_remove();
        assert_eq!(entry.action(), Action::None);
        assert!(!entry.is_present());
    }

    #[test]
    fn remove_then_add_collapses_to_update() {
        let mut entry = CacheEntry::loaded(Some(boxed(1)));
        entry.stage_remove();
        assert_eq!(entry.action(), Action::Remove);
        entry.stage_add(boxed(2));
        assert_eq!(entry.action(), Action::Update);
        assert!(entry.is_present());
    }

    #[test]
    fn update_then_remove_is_remove() {
        let mut entry = CacheEntry::loaded(Some(boxed(1)));
        entry.mark_updated();
        assert_eq!(entry.action(), Action::Update);
        entry.stage_remove();
        assert_eq!(entry.action(), Action::Remove);
    }

    #[test]
    fn mutable_access_keeps_add() {
        let mut entry = CacheEntry::loaded(None);
        entry.stage_add(boxed(1));
        entry.mark_updated();
        assert_eq!(entry.action(), Action::Add);
    }

    #[test]
    fn mutable_access_on_absent_is_noop() {
        let mut entry = CacheEntry::loaded(None);
        entry.mark_updated();
        assert_eq!(entry.action(), Action::None);
    }

    #[test]
    fn entity_state_groups_by_action() {
        let a = ComponentTypeId(0);
        let b = ComponentTypeId(1);
        let c = ComponentTypeId(2);
        let mut state = EntityState::new(EntityId::from_raw(1), 3);
        state.components.insert(a, CacheEntry::loaded(None));
        state.components.get_mut(&a).unwrap().stage_add(boxed(1));
        state.components.insert(b, CacheEntry::loaded(Some(boxed(2))));
        state.components.get_mut(&b).unwrap().mark_updated();
        state.components.insert(c, CacheEntry::loaded(Some(boxed(3))));
        state.components.get_mut(&c).unwrap().stage_remove();

        assert_eq!(state.added().as_slice(), &[a]);
        assert_eq!(state.updated().as_slice(), &[b]);
        assert_eq!(state.removed().as_slice(), &[c]);
        assert!(state.has_changes());
        assert_eq!(state.expected_revision(), 3);
    }

    #[test]
    fn read_only_commit_set_has_no_changes() {
        let mut set = CommitSet::new(1);
        let mut state = EntityState::new(EntityId::from_raw(4), 1);
        state
            .components
            .insert(ComponentTypeId(0), CacheEntry::loaded(Some(boxed(1))));
        set.entities.insert(state.id(), state);
        assert!(!set.is_empty());
        assert!(!set.has_changes());
        assert!(set.changed_component_types().is_empty());
        assert_eq!(set.entity_ids(), vec![EntityId::from_raw(4)]);
    }
}
