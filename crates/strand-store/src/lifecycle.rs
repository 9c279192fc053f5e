//! Lifecycle notifications derived from committed changes.
//!
//! After a commit has been applied and its locks released, the
//! `lifecycle-events` interceptor diffs the [`CommitSet`] and sends up to three
//! [`LifecycleEvent`]s per changed entity to the installed [`EventSystem`]:
//! `Added` for net-new components, `Changed` for net-modified ones and
//! `Removed` for net-deleted ones, always in that order. Components that were
//! added and removed again inside the same transaction have no net effect and
//! produce nothing.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::component::ComponentSet;
use crate::entity_ref::EntityRef;
use crate::pipeline::{TransactionContext, TransactionInterceptor};
use crate::state::CommitSet;
use crate::TransactionError;

/// Which group of component deltas an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LifecycleKind {
    Added,
    Changed,
    Removed,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleKind::Added => "added",
            LifecycleKind::Changed => "changed",
            LifecycleKind::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// One notification about one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    /// Concrete reference to the entity.
    pub entity: EntityRef,
    /// The entity's revision after the commit.
    pub revision: u64,
    /// The component types this event reports. Never empty.
    pub components: ComponentSet,
}

/// Receiver of lifecycle notifications.
///
/// Called after the commit's locks are released, on the committing thread.
/// Implementations may begin their own transactions.
pub trait EventSystem: Send + Sync {
    fn send(&self, event: &LifecycleEvent);
}

impl<F> EventSystem for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn send(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// The events a committed [`CommitSet`] produces, in emission order.
///
/// Pre-existing entities come first in ascending id order, followed by new
/// entities in creation order. Entities without a committed revision were not
/// applied and are skipped.
pub fn lifecycle_events(set: &CommitSet) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();

    for state in set.entities() {
        let Some(revision) = state.committed_revision() else {
            continue;
        };
        let entity = EntityRef::Concrete(state.id());
        let groups = [
            (LifecycleKind::Added, state.added()),
            (LifecycleKind::Changed, state.updated()),
            (LifecycleKind::Removed, state.removed()),
        ];
        for (kind, components) in groups {
            if !components.is_empty() {
                events.push(LifecycleEvent {
                    kind,
                    entity: entity.clone(),
                    revision,
                    components,
                });
            }
        }
    }

    for state in set.new_entities() {
        let (Some(id), Some(revision)) = (state.assigned_id(), state.committed_revision()) else {
            continue;
        };
        let components = state.added();
        if !components.is_empty() {
            events.push(LifecycleEvent {
                kind: LifecycleKind::Added,
                entity: EntityRef::Concrete(id),
                revision,
                components,
            });
        }
    }

    events
}

/// Sends [`lifecycle_events`] to an [`EventSystem`]. Registered as
/// `lifecycle-events` at `PostCommit`.
pub struct LifecycleEventInterceptor {
    events: Arc<dyn EventSystem>,
}

impl LifecycleEventInterceptor {
    pub fn new(events: Arc<dyn EventSystem>) -> Self {
        Self { events }
    }
}

impl TransactionInterceptor for LifecycleEventInterceptor {
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        let Some(set) = context.attachment::<CommitSet>() else {
            return Ok(());
        };
        let events = lifecycle_events(set);
        tracing::trace!(
            transaction = set.transaction_id(),
            count = events.len(),
            "sending lifecycle events"
        );
        for event in &events {
            self.events.send(event);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
