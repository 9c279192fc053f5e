//! The built-in commit interceptors.
//!
//! | stage           | name               | job                                  |
//! |-----------------|--------------------|--------------------------------------|
//! | `ObtainLocks`   | `entity-lock`      | lock every touched pre-existing id   |
//! | `VerifyCommit`  | `verify-revisions` | compare expected and table revisions |
//! | `ProcessCommit` | `apply-commit`     | materialize new entities, write      |
//! | `UpdateIndexes` | `index:<name>`     | see [`crate::index`]                 |
//! | `ReleaseLocks`  | `entity-unlock`    | drop the entity lock                 |
//! | `PostCommit`    | `lifecycle-events` | see [`crate::lifecycle`]             |
//! | `Rollback`      | `wipe`             | point new-entity proxies at `Null`   |
//!
//! `Rollback` only runs while the table is untouched. Once `apply-commit` has
//! attached [`TableWritten`], a failing commit keeps its writes instead.
//!
//! They share state through two attachments: the transaction's [`CommitSet`]
//! and the [`EntityLock`] taken at `ObtainLocks`. Custom interceptors can be
//! ordered against them by name.

use std::sync::Arc;

use crate::component::{BoxedComponent, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::entity_ref::EntityRef;
use crate::lock::{EntityLock, EntityLockManager};
use crate::pipeline::{TransactionContext, TransactionInterceptor};
use crate::state::{Action, CacheEntry, CommitSet};
use crate::table::ComponentTable;
use crate::transaction::CommitSummary;
use crate::{ConflictError, TransactionError};

/// Name of the lock-acquisition interceptor.
pub const ENTITY_LOCK: &str = "entity-lock";
/// Name of the revision verification interceptor.
pub const VERIFY_REVISIONS: &str = "verify-revisions";
/// Name of the interceptor that writes the commit to the table.
pub const APPLY_COMMIT: &str = "apply-commit";
/// Name of the lock-release interceptor.
pub const ENTITY_UNLOCK: &str = "entity-unlock";
/// Name of the lifecycle event interceptor.
pub const LIFECYCLE_EVENTS: &str = "lifecycle-events";
/// Name of the rollback interceptor.
pub const WIPE: &str = "wipe";

/// Interceptor name for the index called `index`.
pub fn index_interceptor_name(index: &str) -> String {
    format!("index:{index}")
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

/// Acquires one [`EntityLock`] over every pre-existing entity the transaction
/// touched and attaches it to the context.
pub struct EntityLockInterceptor {
    locks: EntityLockManager,
}

impl EntityLockInterceptor {
    pub fn new(locks: EntityLockManager) -> Self {
        Self { locks }
    }
}

impl TransactionInterceptor for EntityLockInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        let Some(set) = context.attachment::<CommitSet>() else {
            return Ok(());
        };
        let ids: Vec<EntityId> = set.entities.keys().copied().collect();
        let lock = self.locks.acquire(ids);
        tracing::trace!(
            transaction = set.transaction_id(),
            held = lock.ids().len(),
            "entities locked"
        );
        context.attach(lock);
        Ok(())
    }
}

/// Detaches and releases the [`EntityLock`].
pub struct EntityUnlockInterceptor;

impl TransactionInterceptor for EntityUnlockInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        if let Some(lock) = context.detach::<EntityLock>() {
            lock.release();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Check that every touched pre-existing entity is still at the revision the
/// transaction observed. Read-only entities are checked too.
pub fn verify_revisions(table: &ComponentTable, set: &CommitSet) -> Result<(), ConflictError> {
    for state in set.entities() {
        let actual = table.entity_revision(state.id());
        if actual != state.expected_revision() {
            return Err(ConflictError {
                entity: state.id(),
                expected: state.expected_revision(),
                actual,
            });
        }
    }
    Ok(())
}

/// Authoritative revision check, run while the entity lock is held.
pub struct VerifyRevisionsInterceptor {
    table: Arc<ComponentTable>,
}

impl VerifyRevisionsInterceptor {
    pub fn new(table: Arc<ComponentTable>) -> Self {
        Self { table }
    }
}

impl TransactionInterceptor for VerifyRevisionsInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        let Some(set) = context.attachment::<CommitSet>() else {
            return Ok(());
        };
        verify_revisions(&self.table, set).map_err(|conflict| {
            tracing::warn!(
                transaction = set.transaction_id(),
                entity = %conflict.entity,
                expected = conflict.expected,
                actual = conflict.actual,
                "commit conflict"
            );
            TransactionError::Conflict(conflict)
        })
    }
}

// ---------------------------------------------------------------------------
// Commit application
// ---------------------------------------------------------------------------

/// Writes a verified [`CommitSet`] to the table in two phases and attaches a
/// [`CommitSummary`].
///
/// Phase A allocates ids for new entities that ended up with at least one
/// component, adds those ids to the entity lock, redirects every new-entity
/// proxy (to its id, or to `Null` when the entity stayed empty) and resolves
/// proxies embedded in staged component values.
///
/// Phase B issues one table operation per non-`None` cache entry and bumps
/// each changed entity's revision exactly once. The table refusing an
/// operation means it disagrees with a verified transaction under lock, which
/// is reported as [`TransactionError::InvariantViolation`].
///
/// As soon as one write lands, a [`TableWritten`] marker is attached, even if
/// a later write fails. From then on the commit can no longer be rolled back.
pub struct ApplyCommitInterceptor {
    table: Arc<ComponentTable>,
    registry: Arc<ComponentRegistry>,
}

impl ApplyCommitInterceptor {
    pub fn new(table: Arc<ComponentTable>, registry: Arc<ComponentRegistry>) -> Self {
        Self { table, registry }
    }

    fn materialize(&self, set: &mut CommitSet, lock: Option<&mut EntityLock>) {
        let slots: Vec<usize> = set
            .new_entities
            .iter()
            .enumerate()
            .filter(|(_, state)| state.staged_count() > 0)
            .map(|(slot, _)| slot)
            .collect();
        let ids = self.table.create_entity_ids(slots.len());
        if let Some(lock) = lock {
            lock.adopt(ids.iter().copied());
        }

        for (&slot, &id) in slots.iter().zip(&ids) {
            set.new_entities[slot].assign(id);
        }
        for state in &set.new_entities {
            let target = match state.assigned_id() {
                Some(id) => EntityRef::Concrete(id),
                None => EntityRef::Null,
            };
            state.proxy().redirect(target);
        }

        let staged = set
            .entities
            .values_mut()
            .flat_map(|state| state.components.values_mut())
            .chain(
                set.new_entities
                    .iter_mut()
                    .flat_map(|state| state.components.values_mut()),
            );
        for entry in staged {
            if matches!(entry.action(), Action::Add | Action::Update) {
                if let Some(value) = entry.component_mut() {
                    value.resolve_entity_refs();
                }
            }
        }
    }

    fn violation(&self, entity: EntityId, ty: ComponentTypeId, details: &str) -> TransactionError {
        let component = self.registry.name_of(ty).to_owned();
        tracing::error!(%entity, component = %component, details, "commit invariant violated");
        TransactionError::InvariantViolation {
            entity,
            component,
            details: details.to_owned(),
        }
    }

    fn staged_value(
        &self,
        entity: EntityId,
        ty: ComponentTypeId,
        entry: &CacheEntry,
    ) -> Result<BoxedComponent, TransactionError> {
        entry
            .component()
            .map(|value| value.clone_boxed())
            .ok_or_else(|| self.violation(entity, ty, "staged write has no value"))
    }

    fn write(
        &self,
        entity: EntityId,
        ty: ComponentTypeId,
        entry: &CacheEntry,
    ) -> Result<(), TransactionError> {
        match entry.action() {
            Action::None => Ok(()),
            Action::Add => {
                let value = self.staged_value(entity, ty, entry)?;
                if self.table.add(entity, ty, value) {
                    Ok(())
                } else {
                    Err(self.violation(entity, ty, "add rejected, component already present"))
                }
            }
            Action::Update => {
                let value = self.staged_value(entity, ty, entry)?;
                if self.table.update(entity, ty, value) {
                    Ok(())
                } else {
                    Err(self.violation(entity, ty, "update rejected, component absent"))
                }
            }
            Action::Remove => match self.table.remove(entity, ty) {
                Some(_) => Ok(()),
                None => Err(self.violation(entity, ty, "remove rejected, component absent")),
            },
        }
    }

    fn apply(
        &self,
        set: &mut CommitSet,
        lock: Option<&mut EntityLock>,
        written: &mut bool,
    ) -> Result<CommitSummary, TransactionError> {
        self.materialize(set, lock);

        let mut summary = CommitSummary {
            transaction: set.transaction_id(),
            ..CommitSummary::default()
        };

        for state in set.entities.values_mut() {
            if !state.has_changes() {
                continue;
            }
            let id = state.id();
            for (&ty, entry) in &state.components {
                self.write(id, ty, entry)?;
                *written |= entry.action() != Action::None;
            }
            state.set_committed_revision(self.table.increment_revision(id));
            if self.table.is_available(id) {
                summary.updated += 1;
            } else {
                summary.deleted += 1;
            }
        }

        for state in set.new_entities.iter_mut() {
            let Some(id) = state.assigned_id() else {
                continue;
            };
            for (&ty, entry) in &state.components {
                self.write(id, ty, entry)?;
                *written |= entry.action() != Action::None;
            }
            state.set_committed_revision(self.table.increment_revision(id));
            summary.created.push(id);
        }

        Ok(summary)
    }
}

impl TransactionInterceptor for ApplyCommitInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        let Some(mut set) = context.detach::<CommitSet>() else {
            return Ok(());
        };
        let mut written = false;
        let result = self.apply(&mut set, context.attachment_mut::<EntityLock>(), &mut written);
        context.attach(set);
        if written {
            context.attach(TableWritten);
        }
        context.attach(result?);
        Ok(())
    }
}

/// Attachment marking that [`ApplyCommitInterceptor`] changed the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableWritten;

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Redirects every new-entity proxy of a discarded transaction to `Null`.
pub struct WipeInterceptor;

impl TransactionInterceptor for WipeInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        if let Some(set) = context.attachment::<CommitSet>() {
            for state in set.new_entities() {
                state.proxy().redirect(EntityRef::Null);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
