//! Entity references with redirectable proxies.
//!
//! An [`EntityRef`] is the handle callers hold on to. It is one of:
//!
//! - [`EntityRef::Null`] -- no entity.
//! - [`EntityRef::Concrete`] -- a fixed reference to a materialized entity id.
//! - [`EntityRef::Proxy`] -- a shared, swappable indirection. Every operation
//!   on a proxy delegates to its current target. Equality and hashing use the
//!   identity of the proxy itself, never its target, so a proxy stays a stable
//!   map key while it is redirected.
//!
//! Proxies are how a transaction hands out a reference to an entity before it
//! has an id: [`Transaction::create_entity`](crate::transaction::Transaction::create_entity)
//! returns a proxy in the *pending* state, commit redirects it to the concrete
//! entity (or to `Null` if the entity ended up with no components), and
//! rollback redirects it to `Null`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::component::Component;
use crate::entity::EntityId;
use crate::transaction::Transaction;
use crate::TransactionError;

// ---------------------------------------------------------------------------
// PendingEntity
// ---------------------------------------------------------------------------

/// A new entity staged inside one specific transaction, not yet assigned an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PendingEntity {
    /// Unique id of the owning transaction round.
    pub transaction: u64,
    /// Slot of the entity in that transaction's new-entity list.
    pub slot: usize,
}

#[derive(Debug, Clone)]
enum ProxyTarget {
    Pending(PendingEntity),
    Redirected(EntityRef),
}

// ---------------------------------------------------------------------------
// ProxyRef
// ---------------------------------------------------------------------------

/// Shared, redirectable indirection behind [`EntityRef::Proxy`].
#[derive(Clone)]
pub struct ProxyRef(Arc<RwLock<ProxyTarget>>);

impl ProxyRef {
    pub(crate) fn pending(pending: PendingEntity) -> Self {
        Self(Arc::new(RwLock::new(ProxyTarget::Pending(pending))))
    }

    fn redirected(target: EntityRef) -> Self {
        Self(Arc::new(RwLock::new(ProxyTarget::Redirected(target))))
    }

    /// Point this proxy at `target`.
    ///
    /// Proxy targets are flattened, so chains of proxies never build up.
    /// Redirecting a proxy to itself is ignored.
    pub fn redirect(&self, target: EntityRef) {
        let target = target.flatten();
        if let EntityRef::Proxy(other) = &target {
            if Arc::ptr_eq(&self.0, &other.0) {
                return;
            }
        }
        *self.0.write() = ProxyTarget::Redirected(target);
    }

    /// The proxy's current target with nested proxies followed.
    ///
    /// A proxy that is still pending resolves to itself.
    pub fn target(&self) -> EntityRef {
        match &*self.0.read() {
            ProxyTarget::Pending(_) => EntityRef::Proxy(self.clone()),
            ProxyTarget::Redirected(target) => target.flatten(),
        }
    }

    pub(crate) fn pending_entity(&self) -> Option<PendingEntity> {
        match &*self.0.read() {
            ProxyTarget::Pending(p) => Some(*p),
            ProxyTarget::Redirected(EntityRef::Proxy(inner)) => inner.pending_entity(),
            ProxyTarget::Redirected(_) => None,
        }
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for ProxyRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ProxyRef {}

impl fmt::Debug for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.read() {
            ProxyTarget::Pending(p) => write!(f, "Proxy(pending {}:{})", p.transaction, p.slot),
            ProxyTarget::Redirected(target) => write!(f, "Proxy(-> {target:?})"),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityRef
// ---------------------------------------------------------------------------

/// A handle to an entity. See the [module docs](self).
#[derive(Clone, Default)]
pub enum EntityRef {
    /// No entity.
    #[default]
    Null,
    /// A materialized entity.
    Concrete(EntityId),
    /// A redirectable indirection.
    Proxy(ProxyRef),
}

impl EntityRef {
    /// A concrete reference to `id`. The null id yields [`EntityRef::Null`].
    pub fn concrete(id: EntityId) -> Self {
        if id.is_null() {
            EntityRef::Null
        } else {
            EntityRef::Concrete(id)
        }
    }

    /// A fresh proxy initially pointing at `target`.
    pub fn proxy(target: EntityRef) -> Self {
        EntityRef::Proxy(ProxyRef::redirected(target.flatten()))
    }

    /// Follow proxies to a `Null` or `Concrete` reference. A pending proxy
    /// resolves to itself.
    pub fn flatten(&self) -> EntityRef {
        match self {
            EntityRef::Proxy(proxy) => proxy.target(),
            other => other.clone(),
        }
    }

    /// The id this reference currently resolves to, or [`EntityId::NULL`] when
    /// it resolves to nothing (or to an entity that has no id yet).
    pub fn id(&self) -> EntityId {
        match self.flatten() {
            EntityRef::Concrete(id) => id,
            _ => EntityId::NULL,
        }
    }

    /// Whether this reference currently resolves to `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self.flatten(), EntityRef::Null)
    }

    /// Whether this reference points at an entity that is still staged in an
    /// uncommitted transaction.
    pub fn is_pending(&self) -> bool {
        self.pending_entity().is_some()
    }

    pub(crate) fn pending_entity(&self) -> Option<PendingEntity> {
        match self {
            EntityRef::Proxy(proxy) => proxy.pending_entity(),
            _ => None,
        }
    }

    // -- delegating operations ------------------------------------------------

    /// See [`Transaction::exists`].
    pub fn exists(&self, tx: &mut Transaction) -> Result<bool, TransactionError> {
        tx.exists(self)
    }

    /// See [`Transaction::get_component`].
    pub fn get_component<T: Component>(
        &self,
        tx: &mut Transaction,
    ) -> Result<Option<T>, TransactionError> {
        tx.get_component::<T>(self)
    }

    /// See [`Transaction::add_component`].
    pub fn add_component<'t, T: Component>(
        &self,
        tx: &'t mut Transaction,
        value: T,
    ) -> Result<&'t mut T, TransactionError> {
        tx.add_component(self, value)
    }

    /// See [`Transaction::remove_component`].
    pub fn remove_component<T: Component>(
        &self,
        tx: &mut Transaction,
    ) -> Result<T, TransactionError> {
        tx.remove_component::<T>(self)
    }

    /// See [`Transaction::delete_entity`].
    pub fn delete(&self, tx: &mut Transaction) -> Result<(), TransactionError> {
        tx.delete_entity(self)
    }
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        EntityRef::concrete(id)
    }
}

impl From<&EntityRef> for EntityRef {
    fn from(entity: &EntityRef) -> Self {
        entity.clone()
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EntityRef::Null, EntityRef::Null) => true,
            (EntityRef::Concrete(a), EntityRef::Concrete(b)) => a == b,
            (EntityRef::Proxy(a), EntityRef::Proxy(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            EntityRef::Null => 0u8.hash(state),
            EntityRef::Concrete(id) => {
                1u8.hash(state);
                id.hash(state);
            }
            EntityRef::Proxy(proxy) => {
                2u8.hash(state);
                proxy.addr().hash(state);
            }
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Null => f.write_str("EntityRef::Null"),
            EntityRef::Concrete(id) => write!(f, "EntityRef({id})"),
            EntityRef::Proxy(proxy) => write!(f, "EntityRef({proxy:?})"),
        }
    }
}

/// Serialized as the resolved raw id (`0` for null or unresolved).
impl Serialize for EntityRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.id().to_raw())
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u64::deserialize(deserializer)?;
        Ok(EntityRef::concrete(EntityId::from_raw(raw)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
