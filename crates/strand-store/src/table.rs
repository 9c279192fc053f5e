//! The physical component table.
//!
//! [`ComponentTable`] keeps one map per component type from [`EntityId`] to
//! the stored value, plus a per-entity revision counter. It has no
//! transactional semantics of its own:
//!
//! - Each per-type map is independently synchronized. Nothing here makes a
//!   change spanning several component types atomic; that is the job of the
//!   transaction pipeline, which holds the entity lock while it applies a
//!   commit.
//! - Every value handed out is a fresh copy, so callers can never mutate
//!   stored state in place.
//! - An entity exists exactly while at least one per-type map holds a value
//!   for it. Removing the last component deletes the entity.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::component::{BoxedComponent, ComponentSet, ComponentTypeId};
use crate::entity::{EntityId, EntityIdAllocator};

type ComponentMap = HashMap<EntityId, BoxedComponent>;

// ---------------------------------------------------------------------------
// ComponentTable
// ---------------------------------------------------------------------------

/// Per-component-type storage plus entity revisions and id allocation.
#[derive(Debug)]
pub struct ComponentTable {
    /// Indexed by `ComponentTypeId::index()`.
    stores: Vec<RwLock<ComponentMap>>,
    /// Revision per entity. Entities never committed have revision 0. The
    /// counter survives deletion so it only ever moves forward.
    revisions: RwLock<HashMap<EntityId, u64>>,
    ids: EntityIdAllocator,
}

impl ComponentTable {
    /// Create a table with storage for `component_types` registered types.
    pub fn new(component_types: usize) -> Self {
        Self {
            stores: (0..component_types)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            revisions: RwLock::new(HashMap::new()),
            ids: EntityIdAllocator::new(),
        }
    }

    fn store(&self, ty: ComponentTypeId) -> Option<&RwLock<ComponentMap>> {
        self.stores.get(ty.index())
    }

    // -- per-component operations -------------------------------------------

    /// A copy of the component of type `ty` on `id`, if present.
    pub fn get(&self, id: EntityId, ty: ComponentTypeId) -> Option<BoxedComponent> {
        self.store(ty)?
            .read()
            .get(&id)
            .map(|value| value.clone_boxed())
    }

    /// Whether `id` has a component of type `ty`.
    pub fn contains(&self, id: EntityId, ty: ComponentTypeId) -> bool {
        self.store(ty)
            .map(|store| store.read().contains_key(&id))
            .unwrap_or(false)
    }

    /// Store `value` as a new component. Returns `false` (and stores nothing)
    /// if `id` already has a component of type `ty`.
    pub fn add(&self, id: EntityId, ty: ComponentTypeId, value: BoxedComponent) -> bool {
        let Some(store) = self.store(ty) else {
            return false;
        };
        let mut map = store.write();
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, value);
        true
    }

    /// Replace an existing component. Returns `false` (and stores nothing) if
    /// `id` has no component of type `ty`.
    pub fn update(&self, id: EntityId, ty: ComponentTypeId, value: BoxedComponent) -> bool {
        let Some(store) = self.store(ty) else {
            return false;
        };
        match store.write().get_mut(&id) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Remove and return the component of type `ty` on `id`.
    pub fn remove(&self, id: EntityId, ty: ComponentTypeId) -> Option<BoxedComponent> {
        self.store(ty)?.write().remove(&id)
    }

    /// Remove every component of `id`, deleting the entity.
    pub fn remove_all(&self, id: EntityId) -> Vec<(ComponentTypeId, BoxedComponent)> {
        self.stores
            .iter()
            .enumerate()
            .filter_map(|(idx, store)| {
                store
                    .write()
                    .remove(&id)
                    .map(|value| (ComponentTypeId(idx as u32), value))
            })
            .collect()
    }

    /// Copies of every stored component of type `ty`.
    ///
    /// The iterator walks a snapshot taken when it was created; concurrent
    /// commits are not reflected in it.
    pub fn component_iter(
        &self,
        ty: ComponentTypeId,
    ) -> impl Iterator<Item = (EntityId, BoxedComponent)> {
        let snapshot: Vec<(EntityId, BoxedComponent)> = match self.store(ty) {
            Some(store) => store
                .read()
                .iter()
                .map(|(id, value)| (*id, value.clone_boxed()))
                .collect(),
            None => Vec::new(),
        };
        snapshot.into_iter()
    }

    // -- per-entity operations ----------------------------------------------

    /// Ids of every existing entity, ascending. Weakly consistent snapshot.
    pub fn entity_id_iter(&self) -> impl Iterator<Item = EntityId> {
        let mut ids = BTreeSet::new();
        for store in &self.stores {
            ids.extend(store.read().keys().copied());
        }
        ids.into_iter()
    }

    /// Number of existing entities.
    pub fn entity_count(&self) -> usize {
        self.entity_id_iter().count()
    }

    /// Whether `id` currently exists (has at least one component).
    pub fn is_available(&self, id: EntityId) -> bool {
        self.stores.iter().any(|store| store.read().contains_key(&id))
    }

    /// Component types currently attached to `id`.
    pub fn composition(&self, id: EntityId) -> ComponentSet {
        self.stores
            .iter()
            .enumerate()
            .filter(|(_, store)| store.read().contains_key(&id))
            .map(|(idx, _)| ComponentTypeId(idx as u32))
            .collect()
    }

    // -- revisions ------------------------------------------------------------

    /// Current revision of `id` (0 if it was never committed).
    pub fn entity_revision(&self, id: EntityId) -> u64 {
        self.revisions.read().get(&id).copied().unwrap_or(0)
    }

    /// Advance the revision of `id` by one and return the new value.
    ///
    /// Called exactly once per successful commit that changes the entity.
    pub fn increment_revision(&self, id: EntityId) -> u64 {
        let mut revisions = self.revisions.write();
        let revision = revisions.entry(id).or_insert(0);
        *revision += 1;
        *revision
    }

    // -- id allocation --------------------------------------------------------

    /// Allocate one fresh entity id.
    pub fn create_entity_id(&self) -> EntityId {
        self.ids.allocate()
    }

    /// Allocate `count` fresh entity ids at once.
    pub fn create_entity_ids(&self, count: usize) -> Vec<EntityId> {
        self.ids.allocate_many(count)
    }

    /// The id the next allocation will return.
    pub fn next_entity_id(&self) -> EntityId {
        self.ids.peek_next()
    }

    /// Whether `id` was ever allocated by this table.
    pub fn is_allocated(&self, id: EntityId) -> bool {
        self.ids.is_allocated(id)
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
    struct Name(String);

    impl Component for Name {}

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    impl Component for Health {}

    const NAME: ComponentTypeId = ComponentTypeId(0);
    const HEALTH: ComponentTypeId = ComponentTypeId(1);

    fn name(value: &str) -> BoxedComponent {
        Box::new(Name(value.to_owned()))
    }

    fn read_name(table: &ComponentTable, id: EntityId) -> Option<Name> {
        table
            .get(id, NAME)
            .and_then(|c| c.as_any().downcast_ref::<Name>().cloned())
    }

    #[test]
    fn add_only_when_absent() {
        let table = ComponentTable::new(2);
        let e = table.create_entity_id();
        assert!(table.add(e, NAME, name("fred")));
        assert!(!table.add(e, NAME, name("other")));
        assert_eq!(read_name(&table, e), Some(Name("fred".into())));
    }

    #[test]
    fn update_only_when_present() {
        let table = ComponentTable::new(2);
        let e = table.create_entity_id();
        assert!(!table.update(e, NAME, name("fred")));
        assert!(!table.is_available(e));
        table.add(e, NAME, name("fred"));
        assert!(table.update(e, NAME, name("george")));
        assert_eq!(read_name(&table, e), Some(Name("george".into())));
    }

    #[test]
    fn get_returns_defensive_copy() {
        let table = ComponentTable::new(2);
        let e = table.create_entity_id();
        table.add(e, NAME, name("fred"));

        let mut copy = table.get(e, NAME).unwrap();
        copy.as_any_mut().downcast_mut::<Name>().unwrap().0 = "mutated".into();
        assert_eq!(read_name(&table, e), Some(Name("fred".into())));
    }

    #[test]
    fn removing_last_component_deletes_entity() {
        let table = ComponentTable::new(2);
        let e = table.create_entity_id();
        table.add(e, NAME, name("fred"));
        table.add(e, HEALTH, Box::new(Health(10)));
        assert_eq!(table.entity_count(), 1);

        assert!(table.remove(e, NAME).is_some());
        assert!(table.is_available(e));
        assert!(table.remove(e, HEALTH).is_some());
        assert!(!table.is_available(e));
        assert_eq!(table.entity_count(), 0);
        assert!(table.remove(e, HEALTH).is_none());
    }

    #[test]
    fn remove_all_returns_every_component() {
        let table = ComponentTable::new(2);
        let e = table.create_entity_id();
        table.add(e, NAME, name("fred"));
        table.add(e, HEALTH, Box::new(Health(10)));
        let removed = table.remove_all(e);
        assert_eq!(removed.len(), 2);
        assert!(!table.is_available(e));
    }

    #[test]
    fn composition_and_iterators() {
        let table = ComponentTable::new(2);
        let a = table.create_entity_id();
        let b = table.create_entity_id();
        table.add(a, NAME, name("a"));
        table.add(b, NAME, name("b"));
        table.add(b, HEALTH, Box::new(Health(1)));

        assert_eq!(table.composition(a).as_slice(), &[NAME]);
        assert_eq!(table.composition(b).as_slice(), &[NAME, HEALTH]);
        assert_eq!(table.entity_id_iter().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(table.component_iter(HEALTH).count(), 1);
        assert_eq!(table.component_iter(NAME).count(), 2);
    }

    #[test]
    fn revisions_only_move_forward() {
        let table = ComponentTable::new(1);
        let e = table.create_entity_id();
        assert_eq!(table.entity_revision(e), 0);
        assert_eq!(table.increment_revision(e), 1);
        assert_eq!(table.increment_revision(e), 2);
        table.add(e, NAME, name("x"));
        table.remove_all(e);
        assert_eq!(table.entity_revision(e), 2);
    }

    #[test]
    fn unknown_component_type_is_rejected() {
        let table = ComponentTable::new(1);
        let e = table.create_entity_id();
        assert!(!table.add(e, HEALTH, Box::new(Health(1))));
        assert!(table.get(e, HEALTH).is_none());
        assert!(!table.contains(e, HEALTH));
    }
}
