//! Strand Store -- an in-process, transactional entity/component store.
//!
//! Entities are opaque ids; components are typed records attached to them, at
//! most one per type. All access goes through optimistic-concurrency
//! [`Transaction`](transaction::Transaction)s: reads are cached inside the
//! transaction with the revision observed on first touch, writes are staged,
//! and [`commit`](transaction::Transaction::commit) runs a staged pipeline
//! that locks the touched entities, re-verifies their revisions, applies the
//! net changes to the table, maintains indexes and finally emits lifecycle
//! events.
//!
//! # Quick Start
//!
//! ```
//! use strand_store::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Name(String);
//!
//! impl Component for Name {}
//!
//! let mut builder = EntityStoreBuilder::new();
//! builder.register_component::<Name>("name").unwrap();
//! let store = builder.build().unwrap();
//!
//! let mut tx = store.begin();
//! let fred = tx.create_entity().unwrap();
//! tx.add_component(&fred, Name("Fred".into())).unwrap();
//! tx.commit().unwrap();
//!
//! let mut tx = store.begin();
//! assert_eq!(tx.get_component::<Name>(&fred).unwrap(), Some(Name("Fred".into())));
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod entity;
pub mod entity_ref;
pub mod index;
pub mod interceptors;
pub mod lifecycle;
pub mod lock;
pub mod pipeline;
pub mod state;
pub mod store;
pub mod table;
pub mod transaction;

use crate::entity::EntityId;
use crate::entity_ref::EntityRef;
use crate::pipeline::{PipelineError, TransactionStage};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Broad class of a [`TransactionError`], telling the caller whether a retry
/// can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Misuse at the call site. Retrying without changing the code won't help.
    Precondition,
    /// Another transaction committed first. Retry with a fresh transaction.
    Conflict,
    /// The table and the transaction disagree while the lock is held. A bug.
    Fatal,
}

/// An entity's revision moved between first touch and commit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("revision conflict on entity {entity}: expected {expected}, found {actual}")]
pub struct ConflictError {
    pub entity: EntityId,
    pub expected: u64,
    pub actual: u64,
}

/// Errors produced by transaction operations and commits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The handle has no open transaction (never begun, or already finished).
    #[error("no active transaction")]
    NoActiveTransaction,

    /// `begin` was called on a handle that is still active.
    #[error("transaction is already active")]
    TransactionAlreadyActive,

    /// The component is already present in the transaction's staged view.
    #[error("component '{component}' already exists on {entity:?}")]
    ComponentAlreadyExists {
        entity: EntityRef,
        component: String,
    },

    /// The component is absent from the transaction's staged view.
    #[error("component '{component}' does not exist on {entity:?}")]
    ComponentDoesNotExist {
        entity: EntityRef,
        component: String,
    },

    /// A component name that was never registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// A Rust type used as a component that was never registered.
    #[error("type '{type_name}' is not a registered component")]
    UnregisteredType { type_name: &'static str },

    /// The operation targeted `EntityRef::Null`.
    #[error("operation on a null entity reference")]
    NullEntity,

    /// The id was never allocated by this store.
    #[error("entity {0} was never allocated")]
    InvalidEntity(EntityId),

    /// The reference points at an entity staged in a different transaction.
    #[error("{0:?} belongs to another transaction")]
    ForeignEntity(EntityRef),

    /// JSON data could not be turned into a component value.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserialization { component: String, details: String },

    /// A component value could not be written as JSON.
    #[error("failed to serialize component '{component}': {details}")]
    ComponentSerialization { component: String, details: String },

    /// Optimistic-concurrency conflict detected at commit.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// The table rejected a write the transaction had verified.
    #[error("invariant violation on entity {entity} ({component}): {details}")]
    InvariantViolation {
        entity: EntityId,
        component: String,
        details: String,
    },

    /// A custom interceptor aborted the commit.
    #[error("interceptor '{name}' failed: {message}")]
    Interceptor { name: String, message: String },

    /// A stage failed after the table had already been written. The writes
    /// stay and indexes were brought up to date; retrying would apply them
    /// twice.
    #[error("commit partially applied, {stage} failed: {cause}")]
    PartiallyApplied {
        stage: TransactionStage,
        cause: Box<TransactionError>,
    },
}

impl TransactionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Conflict(_) => ErrorKind::Conflict,
            TransactionError::InvariantViolation { .. }
            | TransactionError::PartiallyApplied { .. } => ErrorKind::Fatal,
            _ => ErrorKind::Precondition,
        }
    }

    /// Whether retrying in a fresh transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Errors produced while configuring and building a store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Two component types registered under the same name.
    #[error("component name '{name}' is already registered")]
    DuplicateComponentName { name: String },

    /// An index filter names a component type the registry doesn't know.
    #[error("index '{index}' references unregistered component {component}")]
    UnknownComponent { index: String, component: String },

    /// An index filter with no required and no excluded types.
    #[error("index '{index}' has an empty filter")]
    EmptyIndexFilter { index: String },

    /// The interceptor configuration could not be ordered.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{
        Component, ComponentBundle, ComponentInfo, ComponentRegistry, ComponentSet,
        ComponentTypeId, EntityRefField,
    };
    pub use crate::entity::EntityId;
    pub use crate::entity_ref::EntityRef;
    pub use crate::index::{ComponentIndex, IndexFilter};
    pub use crate::lifecycle::{EventSystem, LifecycleEvent, LifecycleKind};
    pub use crate::pipeline::{
        Placement, TransactionContext, TransactionInterceptor, TransactionStage,
    };
    pub use crate::store::{EntityStore, EntityStoreBuilder, StoreConfig};
    pub use crate::transaction::{CommitSummary, Transaction};
    pub use crate::{ConflictError, ErrorKind, StoreError, TransactionError};
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Name(String);

    impl Component for Name {}

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    impl Component for Health {}

    fn setup_store() -> EntityStore {
        let mut builder = EntityStoreBuilder::new();
        builder.register_component::<Name>("name").unwrap();
        builder.register_component::<Health>("health").unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn error_kinds() {
        let conflict = TransactionError::Conflict(ConflictError {
            entity: EntityId::from_raw(1),
            expected: 1,
            actual: 2,
        });
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_retryable());

        assert_eq!(TransactionError::NullEntity.kind(), ErrorKind::Precondition);
        assert!(!TransactionError::NoActiveTransaction.is_retryable());

        let fatal = TransactionError::InvariantViolation {
            entity: EntityId::from_raw(1),
            component: "name".into(),
            details: "add rejected".into(),
        };
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert!(!fatal.is_retryable());

        let partial = TransactionError::PartiallyApplied {
            stage: TransactionStage::UpdateIndexes,
            cause: Box::new(TransactionError::Interceptor {
                name: "audit".into(),
                message: "disk full".into(),
            }),
        };
        assert_eq!(partial.kind(), ErrorKind::Fatal);
        assert_eq!(
            partial.to_string(),
            "commit partially applied, UPDATE_INDEXES failed: interceptor 'audit' failed: disk full"
        );
    }

    #[test]
    fn conflict_message_names_entity_and_revisions() {
        let err = TransactionError::from(ConflictError {
            entity: EntityId::from_raw(7),
            expected: 3,
            actual: 4,
        });
        assert_eq!(
            err.to_string(),
            "revision conflict on entity #7: expected 3, found 4"
        );
    }

    #[test]
    fn create_read_update_delete() {
        let store = setup_store();

        let e = store
            .create_entity(
                ComponentBundle::new()
                    .with(Name("a".into()))
                    .with(Health(10)),
            )
            .unwrap();
        let id = e.id();
        assert!(!id.is_null());
        assert_eq!(store.entity_revision(id), 1);

        let mut tx = store.begin();
        tx.get_component_mut::<Health>(&e).unwrap().unwrap().0 = 5;
        tx.commit().unwrap();
        assert_eq!(store.entity_revision(id), 2);

        let mut tx = store.begin();
        assert_eq!(tx.get_component::<Health>(&e).unwrap(), Some(Health(5)));
        tx.delete_entity(&e).unwrap();
        let summary = tx.commit().unwrap();
        assert_eq!(summary.deleted, 1);

        assert_eq!(store.entity_count(), 0);
        assert!(store.get_entity(id).is_null());
        assert_eq!(store.entity_revision(id), 3);
    }

    #[test]
    fn store_handle_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EntityStore>();
        fn assert_send<T: Send>() {}
        assert_send::<Transaction>();
    }
}
