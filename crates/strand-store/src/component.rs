//! Component type registration, type-erased component values, and metadata.
//!
//! Every component type used by a store must be registered in a
//! [`ComponentRegistry`] before the store is built. Registration produces a
//! [`ComponentTypeId`] that keys the component table, transaction caches and
//! index filters.
//!
//! The registry plays the part of the component manager: it knows how to copy
//! a component (every read out of the table is a defensive copy), how to move
//! it to and from JSON (load-time data and journals), and which of its fields
//! are [`EntityRef`]s that must be resolved when a transaction commits. The
//! last point is driven by a static descriptor table declared on the type
//! itself ([`Component::ENTITY_REFS`]) rather than by runtime reflection.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entity_ref::EntityRef;
use crate::StoreError;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A typed data record that can be attached to an entity.
///
/// At most one instance of each component type is attached to an entity.
///
/// ```
/// use strand_store::prelude::*;
///
/// #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// struct Follows {
///     leader: EntityRef,
///     distance: f32,
/// }
///
/// fn leader(f: &mut Follows) -> &mut EntityRef {
///     &mut f.leader
/// }
///
/// impl Component for Follows {
///     const ENTITY_REFS: &'static [EntityRefField<Self>] =
///         &[EntityRefField::new("leader", leader)];
/// }
/// ```
pub trait Component:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Fields of this type that hold an [`EntityRef`].
    ///
    /// On commit, any of these that still point through a proxy are replaced
    /// with the proxy's resolved target.
    const ENTITY_REFS: &'static [EntityRefField<Self>] = &[];
}

/// Accessor for one [`EntityRef`]-typed field of a component.
pub struct EntityRefField<T> {
    name: &'static str,
    access: fn(&mut T) -> &mut EntityRef,
}

impl<T> EntityRefField<T> {
    /// Describe the field `name`, reached through `access`.
    pub const fn new(name: &'static str, access: fn(&mut T) -> &mut EntityRef) -> Self {
        Self { name, access }
    }

    /// Field name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Type-erased component values
// ---------------------------------------------------------------------------

/// Object-safe view of a [`Component`], used wherever values of different
/// component types share a container.
pub trait ComponentValue: Send + Sync + fmt::Debug {
    /// Deep copy.
    fn clone_boxed(&self) -> BoxedComponent;
    /// Upcast for typed access.
    fn as_any(&self) -> &dyn Any;
    /// Upcast for typed mutable access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Upcast for typed extraction by value.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    /// Serialize to JSON.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
    /// Replace proxies in declared entity-reference fields with their resolved
    /// targets. Returns how many fields changed.
    fn resolve_entity_refs(&mut self) -> usize;
}

/// A boxed, type-erased component value.
pub type BoxedComponent = Box<dyn ComponentValue>;

impl<T: Component> ComponentValue for T {
    fn clone_boxed(&self) -> BoxedComponent {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn resolve_entity_refs(&mut self) -> usize {
        let mut changed = 0;
        for field in T::ENTITY_REFS {
            let slot = (field.access)(self);
            if let EntityRef::Proxy(proxy) = slot {
                let target = proxy.target();
                if !target.is_pending() {
                    *slot = target;
                    changed += 1;
                }
            }
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Dense index of this type, suitable for indexing per-type arrays.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// A sorted, duplicate-free set of component types.
///
/// Used for entity compositions, index filters and lifecycle event payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentSet(Vec<ComponentTypeId>);

impl ComponentSet {
    /// Empty set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: ComponentTypeId) -> bool {
        match self.0.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, id);
                true
            }
        }
    }

    /// Remove `id`. Returns `false` if it was not present.
    pub fn remove(&mut self, id: ComponentTypeId) -> bool {
        match self.0.binary_search(&id) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Membership test.
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Whether every member of `other` is in `self`.
    pub fn is_superset(&self, other: &ComponentSet) -> bool {
        other.0.iter().all(|id| self.contains(*id))
    }

    /// Whether the two sets share at least one member.
    pub fn intersects(&self, other: &ComponentSet) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.0.iter().any(|id| large.contains(*id))
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.0.iter().copied()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Members as a sorted slice.
    pub fn as_slice(&self) -> &[ComponentTypeId] {
        &self.0
    }
}

impl FromIterator<ComponentTypeId> for ComponentSet {
    fn from_iter<I: IntoIterator<Item = ComponentTypeId>>(iter: I) -> Self {
        let mut ids: Vec<_> = iter.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self(ids)
    }
}

impl Extend<ComponentTypeId> for ComponentSet {
    fn extend<I: IntoIterator<Item = ComponentTypeId>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

type DeserializeFn = fn(&serde_json::Value) -> Result<BoxedComponent, serde_json::Error>;

fn deserialize_boxed<T: Component>(
    value: &serde_json::Value,
) -> Result<BoxedComponent, serde_json::Error> {
    let typed: T = T::deserialize(value)?;
    Ok(Box::new(typed))
}

/// Metadata about a registered component type.
#[derive(Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    /// Rust type name, for diagnostics.
    pub type_name: &'static str,
    /// Names of the fields listed in [`Component::ENTITY_REFS`].
    pub entity_ref_fields: Vec<&'static str>,
    deserialize: DeserializeFn,
}

impl ComponentInfo {
    /// Build a component value of this type from JSON.
    pub fn deserialize(&self, value: &serde_json::Value) -> Result<BoxedComponent, String> {
        (self.deserialize)(value).map_err(|e| e.to_string())
    }

    /// Whether values of this type may hold entity references.
    pub fn has_entity_refs(&self) -> bool {
        !self.entity_ref_fields.is_empty()
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("entity_ref_fields", &self.entity_ref_fields)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// A type can only be registered once; subsequent registrations of the same
/// Rust `TypeId` return the existing [`ComponentTypeId`]. Names must be unique.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentTypeId for dedup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId for lookup by string name (load-time data).
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by ComponentTypeId.0.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under the given `name`.
    ///
    /// If the type has already been registered, the existing
    /// [`ComponentTypeId`] is returned and `name` is ignored.
    pub fn register<T: Component>(&mut self, name: &str) -> Result<ComponentTypeId, StoreError> {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return Ok(existing);
        }
        if self.by_name.contains_key(name) {
            return Err(StoreError::DuplicateComponentName {
                name: name.to_owned(),
            });
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            type_id: rust_type_id,
            type_name: std::any::type_name::<T>(),
            entity_ref_fields: T::ENTITY_REFS.iter().map(|f| f.name()).collect(),
            deserialize: deserialize_boxed::<T>,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        tracing::debug!(component = name, id = id.0, "registered component type");
        Ok(id)
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by Rust `TypeId`.
    pub fn lookup_type_id(&self, type_id: TypeId) -> Option<ComponentTypeId> {
        self.by_type.get(&type_id).copied()
    }

    /// Look up a component type by its registered string name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Registered name of `id`, or `"<unregistered>"`.
    pub fn name_of(&self, id: ComponentTypeId) -> &str {
        self.get_info(id)
            .map(|info| info.name.as_str())
            .unwrap_or("<unregistered>")
    }

    /// All registered type ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.infos.iter().map(|info| info.id)
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of component values used to create an entity in one step.
///
/// Adding a second value of the same type replaces the first.
#[derive(Debug, Default)]
pub struct ComponentBundle {
    entries: Vec<(TypeId, &'static str, BoxedComponent)>,
}

impl ComponentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`add`](Self::add).
    pub fn with<T: Component>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    /// Add a component to the bundle.
    pub fn add<T: Component>(&mut self, value: T) {
        let type_id = TypeId::of::<T>();
        self.entries.retain(|(existing, _, _)| *existing != type_id);
        self.entries
            .push((type_id, std::any::type_name::<T>(), Box::new(value)));
    }

    /// Number of components in the bundle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_parts(self) -> Vec<(TypeId, &'static str, BoxedComponent)> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
