//! Transactions: the only way to read or write the store.
//!
//! A [`Transaction`] is an owned handle obtained from
//! [`EntityStore::begin`](crate::store::EntityStore::begin). It is `Send` but
//! every operation takes `&mut self`, so one handle is only ever used by one
//! thread at a time.
//!
//! Reads go through a per-transaction cache. The first time a transaction
//! touches a pre-existing entity it records the entity's table revision (the
//! *expected revision*) before reading anything, then loads components lazily
//! as they are asked for. Writes only change the cache, following the action
//! collapse rules in [`crate::state`]. Preconditions (adding over a present
//! component, removing an absent one) are evaluated against that staged view,
//! never against the table.
//!
//! [`commit`](Transaction::commit) hands the staged [`CommitSet`] to the store's
//! pipeline. [`rollback`](Transaction::rollback) discards it. Either way the
//! handle becomes inactive and can be reused with [`begin`](Transaction::begin).
//! Dropping an active handle rolls it back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::component::{Component, ComponentBundle, ComponentSet, ComponentTypeId};
use crate::entity::EntityId;
use crate::entity_ref::{EntityRef, PendingEntity, ProxyRef};
use crate::interceptors::{verify_revisions, TableWritten};
use crate::lock::EntityLock;
use crate::pipeline::{TransactionContext, TransactionStage};
use crate::state::{CacheEntry, CommitSet, EntityState, NewEntityState};
use crate::store::StoreShared;
use crate::TransactionError;

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

fn next_transaction_id() -> u64 {
    NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// CommitSummary
// ---------------------------------------------------------------------------

/// What a successful commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    /// Id of the committed transaction round.
    pub transaction: u64,
    /// Ids assigned to new entities, in creation order.
    pub created: Vec<EntityId>,
    /// Pre-existing entities changed that still exist.
    pub updated: usize,
    /// Pre-existing entities whose last component was removed.
    pub deleted: usize,
}

impl CommitSummary {
    /// Whether the commit changed nothing in the table.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated == 0 && self.deleted == 0
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Where an entity reference lands inside this transaction.
#[derive(Debug, Clone, Copy)]
enum Target {
    Existing(EntityId),
    New(usize),
}

/// A staging area for reads and writes, committed or rolled back atomically.
pub struct Transaction {
    shared: Arc<StoreShared>,
    staged: CommitSet,
    active: bool,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<StoreShared>) -> Self {
        Self {
            shared,
            staged: CommitSet::new(next_transaction_id()),
            active: true,
        }
    }

    // -- lifecycle ------------------------------------------------------------

    /// Id of the current round. Unique across the process.
    pub fn id(&self) -> u64 {
        self.staged.transaction_id()
    }

    /// Whether the handle has an open transaction.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Open a new round on a finished handle.
    pub fn begin(&mut self) -> Result<(), TransactionError> {
        if self.active {
            return Err(TransactionError::TransactionAlreadyActive);
        }
        self.staged = CommitSet::new(next_transaction_id());
        self.active = true;
        Ok(())
    }

    /// Everything staged so far.
    pub fn commit_set(&self) -> &CommitSet {
        &self.staged
    }

    /// Apply the staged changes.
    ///
    /// On a revision conflict nothing is applied and the error is
    /// [`TransactionError::Conflict`]; retrying in a fresh round is valid. The
    /// cache is cleared and the handle deactivated whatever the outcome.
    pub fn commit(&mut self) -> Result<CommitSummary, TransactionError> {
        self.ensure_active()?;
        self.active = false;
        let set = std::mem::take(&mut self.staged);
        let transaction = set.transaction_id();
        if set.is_empty() {
            tracing::trace!(transaction, "nothing staged, commit is a no-op");
            return Ok(CommitSummary {
                transaction,
                ..CommitSummary::default()
            });
        }
        run_commit(&self.shared, set)
    }

    /// Discard the staged changes. Never fails; a no-op when inactive.
    ///
    /// References to entities created in this round resolve to `Null`
    /// afterwards.
    pub fn rollback(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let set = std::mem::take(&mut self.staged);
        let transaction = set.transaction_id();
        let mut context = TransactionContext::new();
        context.attach(set);
        run_rollback(&self.shared, &mut context);
        tracing::debug!(transaction, "transaction rolled back");
    }

    // -- entities -------------------------------------------------------------

    /// Stage a new entity. The returned proxy resolves once commit assigns an
    /// id, or to `Null` if the entity ends up with no components.
    pub fn create_entity(&mut self) -> Result<EntityRef, TransactionError> {
        self.ensure_active()?;
        let proxy = ProxyRef::pending(PendingEntity {
            transaction: self.id(),
            slot: self.staged.new_entities.len(),
        });
        self.staged
            .new_entities
            .push(NewEntityState::new(proxy.clone()));
        Ok(EntityRef::Proxy(proxy))
    }

    /// Stage a new entity carrying every component of `bundle`.
    pub fn create_entity_with(
        &mut self,
        bundle: ComponentBundle,
    ) -> Result<EntityRef, TransactionError> {
        self.ensure_active()?;
        let mut values = Vec::with_capacity(bundle.len());
        for (type_id, type_name, value) in bundle.into_parts() {
            let ty = self
                .shared
                .registry
                .lookup_type_id(type_id)
                .ok_or(TransactionError::UnregisteredType { type_name })?;
            values.push((ty, value));
        }

        let entity = self.create_entity()?;
        if let Some(state) = self.staged.new_entities.last_mut() {
            for (ty, value) in values {
                state
                    .components
                    .entry(ty)
                    .or_insert_with(|| CacheEntry::loaded(None))
                    .stage_add(value);
            }
        }
        Ok(entity)
    }

    /// Whether `entity` exists in this transaction's view: it has at least
    /// one component. Null and never-allocated references don't exist.
    pub fn exists(&mut self, entity: impl Into<EntityRef>) -> Result<bool, TransactionError> {
        self.ensure_active()?;
        match self.target(&entity.into()) {
            Ok(target) => Ok(!self.composition(target).is_empty()),
            Err(TransactionError::NullEntity | TransactionError::InvalidEntity(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Component types attached to `entity` in this transaction's view.
    pub fn entity_composition(
        &mut self,
        entity: impl Into<EntityRef>,
    ) -> Result<ComponentSet, TransactionError> {
        self.ensure_active()?;
        let target = self.target(&entity.into())?;
        Ok(self.composition(target))
    }

    /// Stage removal of every component of `entity`, deleting it on commit.
    pub fn delete_entity(&mut self, entity: impl Into<EntityRef>) -> Result<(), TransactionError> {
        self.ensure_active()?;
        let target = self.target(&entity.into())?;
        for ty in self.composition(target).iter() {
            self.entry(target, ty).stage_remove();
        }
        Ok(())
    }

    // -- typed components -----------------------------------------------------

    /// A copy of `entity`'s `T`, if present.
    pub fn get_component<T: Component>(
        &mut self,
        entity: impl Into<EntityRef>,
    ) -> Result<Option<T>, TransactionError> {
        self.ensure_active()?;
        let ty = self.component_type::<T>()?;
        let target = self.target(&entity.into())?;
        Ok(self
            .entry(target, ty)
            .component()
            .and_then(|value| value.as_any().downcast_ref::<T>())
            .cloned())
    }

    /// Mutable access to the staged `T`. Taking it marks the component as
    /// updated, so commit writes it back and bumps the revision.
    pub fn get_component_mut<T: Component>(
        &mut self,
        entity: impl Into<EntityRef>,
    ) -> Result<Option<&mut T>, TransactionError> {
        self.ensure_active()?;
        let ty = self.component_type::<T>()?;
        let target = self.target(&entity.into())?;
        let entry = self.entry(target, ty);
        entry.mark_updated();
        Ok(entry
            .component_mut()
            .and_then(|value| value.as_any_mut().downcast_mut::<T>()))
    }

    /// Stage `value` as `entity`'s `T`.
    ///
    /// Fails with [`TransactionError::ComponentAlreadyExists`] if the staged
    /// view already holds a `T`.
    pub fn add_component<T: Component>(
        &mut self,
        entity: impl Into<EntityRef>,
        value: T,
    ) -> Result<&mut T, TransactionError> {
        self.ensure_active()?;
        let entity = entity.into();
        let ty = self.component_type::<T>()?;
        let target = self.target(&entity)?;
        if self.entry(target, ty).is_present() {
            return Err(TransactionError::ComponentAlreadyExists {
                component: self.component_name(ty),
                entity,
            });
        }

        let entry = self.entry(target, ty);
        entry.stage_add(Box::new(value));
        entry
            .component_mut()
            .and_then(|value| value.as_any_mut().downcast_mut::<T>())
            .ok_or_else(|| TransactionError::InvariantViolation {
                entity: entity.id(),
                component: std::any::type_name::<T>().to_owned(),
                details: "staged value has unexpected type".to_owned(),
            })
    }

    /// Stage removal of `entity`'s `T` and return its staged value.
    ///
    /// Fails with [`TransactionError::ComponentDoesNotExist`] if the staged
    /// view holds no `T`.
    pub fn remove_component<T: Component>(
        &mut self,
        entity: impl Into<EntityRef>,
    ) -> Result<T, TransactionError> {
        self.ensure_active()?;
        let entity = entity.into();
        let ty = self.component_type::<T>()?;
        let target = self.target(&entity)?;
        if !self.entry(target, ty).is_present() {
            return Err(TransactionError::ComponentDoesNotExist {
                component: self.component_name(ty),
                entity,
            });
        }

        self.entry(target, ty)
            .stage_remove()
            .and_then(|value| value.into_any().downcast::<T>().ok())
            .map(|value| *value)
            .ok_or_else(|| TransactionError::InvariantViolation {
                entity: entity.id(),
                component: std::any::type_name::<T>().to_owned(),
                details: "staged value has unexpected type".to_owned(),
            })
    }

    // -- JSON components ------------------------------------------------------

    /// Stage a component given by registered name and JSON data.
    pub fn add_component_json(
        &mut self,
        entity: impl Into<EntityRef>,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), TransactionError> {
        self.ensure_active()?;
        let entity = entity.into();
        let ty = self.component_by_name(name)?;
        let target = self.target(&entity)?;
        if self.entry(target, ty).is_present() {
            return Err(TransactionError::ComponentAlreadyExists {
                component: name.to_owned(),
                entity,
            });
        }

        let value = self
            .shared
            .registry
            .get_info(ty)
            .ok_or_else(|| self.unknown_component(name))?
            .deserialize(value)
            .map_err(|details| TransactionError::ComponentDeserialization {
                component: name.to_owned(),
                details,
            })?;
        self.entry(target, ty).stage_add(value);
        Ok(())
    }

    /// The staged component called `name`, as JSON.
    pub fn get_component_json(
        &mut self,
        entity: impl Into<EntityRef>,
        name: &str,
    ) -> Result<Option<serde_json::Value>, TransactionError> {
        self.ensure_active()?;
        let ty = self.component_by_name(name)?;
        let target = self.target(&entity.into())?;
        self.entry(target, ty)
            .component()
            .map(|value| value.to_json())
            .transpose()
            .map_err(|err| TransactionError::ComponentSerialization {
                component: name.to_owned(),
                details: err.to_string(),
            })
    }

    // -- internals ------------------------------------------------------------

    fn ensure_active(&self) -> Result<(), TransactionError> {
        if self.active {
            Ok(())
        } else {
            Err(TransactionError::NoActiveTransaction)
        }
    }

    fn component_type<T: Component>(&self) -> Result<ComponentTypeId, TransactionError> {
        self.shared
            .registry
            .lookup::<T>()
            .ok_or(TransactionError::UnregisteredType {
                type_name: std::any::type_name::<T>(),
            })
    }

    fn component_by_name(&self, name: &str) -> Result<ComponentTypeId, TransactionError> {
        self.shared
            .registry
            .lookup_by_name(name)
            .ok_or_else(|| self.unknown_component(name))
    }

    fn unknown_component(&self, name: &str) -> TransactionError {
        TransactionError::UnknownComponent {
            name: name.to_owned(),
            registered: self.shared.registry.registered_names().join(", "),
        }
    }

    fn component_name(&self, ty: ComponentTypeId) -> String {
        self.shared.registry.name_of(ty).to_owned()
    }

    fn target(&self, entity: &EntityRef) -> Result<Target, TransactionError> {
        match entity.flatten() {
            EntityRef::Null => Err(TransactionError::NullEntity),
            EntityRef::Concrete(id) if self.shared.table.is_allocated(id) => {
                Ok(Target::Existing(id))
            }
            EntityRef::Concrete(id) => Err(TransactionError::InvalidEntity(id)),
            EntityRef::Proxy(proxy) => match proxy.pending_entity() {
                Some(pending)
                    if pending.transaction == self.id()
                        && pending.slot < self.staged.new_entities.len() =>
                {
                    Ok(Target::New(pending.slot))
                }
                _ => Err(TransactionError::ForeignEntity(entity.clone())),
            },
        }
    }

    /// The cache entry for `(target, ty)`, loading it on first use.
    fn entry(&mut self, target: Target, ty: ComponentTypeId) -> &mut CacheEntry {
        let table = &self.shared.table;
        match target {
            Target::Existing(id) => self
                .staged
                .entities
                .entry(id)
                .or_insert_with(|| EntityState::new(id, table.entity_revision(id)))
                .components
                .entry(ty)
                .or_insert_with(|| CacheEntry::loaded(table.get(id, ty))),
            Target::New(slot) => self.staged.new_entities[slot]
                .components
                .entry(ty)
                .or_insert_with(|| CacheEntry::loaded(None)),
        }
    }

    /// Composition in the staged view: cached entries override the table.
    fn composition(&mut self, target: Target) -> ComponentSet {
        let table = &self.shared.table;
        match target {
            Target::Existing(id) => {
                let state = self
                    .staged
                    .entities
                    .entry(id)
                    .or_insert_with(|| EntityState::new(id, table.entity_revision(id)));
                let mut composition = table.composition(id);
                for (ty, entry) in state.entries() {
                    if entry.is_present() {
                        composition.insert(ty);
                    } else {
                        composition.remove(ty);
                    }
                }
                composition
            }
            Target::New(slot) => self.staged.new_entities[slot]
                .entries()
                .filter(|(_, entry)| entry.is_present())
                .map(|(ty, _)| ty)
                .collect(),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("active", &self.active)
            .field("entities", &self.staged.entities.len())
            .field("new_entities", &self.staged.new_entities.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pipeline driver
// ---------------------------------------------------------------------------

const LOCKED_STAGES: [TransactionStage; 4] = [
    TransactionStage::ObtainLocks,
    TransactionStage::VerifyCommit,
    TransactionStage::ProcessCommit,
    TransactionStage::UpdateIndexes,
];

fn run_commit(shared: &StoreShared, set: CommitSet) -> Result<CommitSummary, TransactionError> {
    let transaction = set.transaction_id();
    let mut context = TransactionContext::new();

    if shared.config.verify_before_lock {
        if let Err(conflict) = verify_revisions(&shared.table, &set) {
            tracing::warn!(
                transaction,
                entity = %conflict.entity,
                expected = conflict.expected,
                actual = conflict.actual,
                "commit rejected before locking"
            );
            context.attach(set);
            run_rollback(shared, &mut context);
            return Err(conflict.into());
        }
    }

    context.attach(set);
    let pipeline = &shared.pipeline;
    let mut failure = None;
    for &stage in &LOCKED_STAGES {
        if let Err(error) = pipeline.run(stage, &mut context) {
            failure = Some((stage, error));
            break;
        }
    }

    // Writes that already reached the table are kept. Settle the indexes and
    // proxies against them while the lock is still held.
    let partial = failure.is_some() && context.has::<TableWritten>();
    if partial {
        settle_partial_commit(shared, &context);
    }

    let released = pipeline.run(TransactionStage::ReleaseLocks, &mut context);
    // Whatever the release stage did, no lock outlives this point.
    drop(context.detach::<EntityLock>());

    if let Some((stage, error)) = failure {
        if let Err(release_error) = released {
            tracing::error!(transaction, error = %release_error, "lock release failed");
        }
        if partial {
            tracing::error!(transaction, %stage, %error, "commit failed after writing to the table");
            return Err(TransactionError::PartiallyApplied {
                stage,
                cause: Box::new(error),
            });
        }
        run_rollback(shared, &mut context);
        tracing::debug!(transaction, %error, "commit failed");
        return Err(error);
    }
    if let Err(error) = released {
        tracing::error!(transaction, %error, "lock release failed after changes were applied");
    }

    if let Err(error) = pipeline.run(TransactionStage::PostCommit, &mut context) {
        tracing::error!(transaction, %error, "post-commit interceptor failed after changes were applied");
    }

    let summary = context
        .detach::<CommitSummary>()
        .unwrap_or_else(|| CommitSummary {
            transaction,
            ..CommitSummary::default()
        });
    tracing::debug!(
        transaction,
        created = ?summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        "transaction committed"
    );
    Ok(summary)
}

/// Refresh every index for the commit's entities and point the proxies of new
/// entities that never reached the table at `Null`.
fn settle_partial_commit(shared: &StoreShared, context: &TransactionContext) {
    let Some(set) = context.attachment::<CommitSet>() else {
        return;
    };
    let ids = set.entity_ids();
    for index in &shared.indexes {
        index.refresh(&shared.table, &ids);
    }
    for state in set.new_entities() {
        let landed = state
            .assigned_id()
            .is_some_and(|id| shared.table.is_available(id));
        if !landed {
            state.proxy().redirect(EntityRef::Null);
        }
    }
}

fn run_rollback(shared: &StoreShared, context: &mut TransactionContext) {
    if let Err(error) = shared.pipeline.run(TransactionStage::Rollback, context) {
        tracing::error!(%error, "rollback interceptor failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
