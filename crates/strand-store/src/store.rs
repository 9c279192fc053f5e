//! The entity store: shared state, configuration and the builder.
//!
//! [`EntityStoreBuilder`] collects component registrations, index
//! declarations, an optional [`EventSystem`] and custom interceptors, then
//! assembles the immutable [`TransactionPipeline`] once in
//! [`build`](EntityStoreBuilder::build). The resulting [`EntityStore`] is a
//! cheap `Arc` handle that can be cloned into every thread that needs it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentBundle, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::entity_ref::EntityRef;
use crate::index::{ComponentIndex, IndexFilter, UpdateIndexInterceptor};
use crate::interceptors::{
    self, ApplyCommitInterceptor, EntityLockInterceptor, EntityUnlockInterceptor,
    VerifyRevisionsInterceptor, WipeInterceptor,
};
use crate::lifecycle::{EventSystem, LifecycleEventInterceptor};
use crate::lock::EntityLockManager;
use crate::pipeline::{
    PipelineBuilder, Placement, TransactionInterceptor, TransactionPipeline, TransactionStage,
};
use crate::table::ComponentTable;
use crate::transaction::Transaction;
use crate::{StoreError, TransactionError};

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Tunables for an [`EntityStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How many times [`EntityStore::transact`] re-runs a closure whose commit
    /// hit a revision conflict.
    pub max_commit_retries: u32,
    /// Compare revisions once without holding the entity lock before entering
    /// the pipeline, so doomed commits fail without contending.
    pub verify_before_lock: bool,
    /// Install the `lifecycle-events` interceptor when an event system is set.
    pub emit_lifecycle_events: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 8,
            verify_before_lock: true,
            emit_lifecycle_events: true,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreShared
// ---------------------------------------------------------------------------

/// State shared by every handle and transaction of one store.
pub(crate) struct StoreShared {
    pub(crate) registry: Arc<ComponentRegistry>,
    pub(crate) table: Arc<ComponentTable>,
    pub(crate) locks: EntityLockManager,
    pub(crate) pipeline: TransactionPipeline,
    pub(crate) indexes: Vec<Arc<ComponentIndex>>,
    pub(crate) config: StoreConfig,
}

// ---------------------------------------------------------------------------
// EntityStoreBuilder
// ---------------------------------------------------------------------------

struct CustomInterceptor {
    stage: TransactionStage,
    name: String,
    interceptor: Arc<dyn TransactionInterceptor>,
    placement: Placement,
}

/// Configures and builds an [`EntityStore`].
#[derive(Default)]
pub struct EntityStoreBuilder {
    registry: ComponentRegistry,
    indexes: Vec<Arc<ComponentIndex>>,
    events: Option<Arc<dyn EventSystem>>,
    custom: Vec<CustomInterceptor>,
    config: StoreConfig,
}

impl EntityStoreBuilder {
    /// Create a builder with no components, indexes or interceptors and the
    /// default [`StoreConfig`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under a unique `name`.
    pub fn register_component<T: Component>(
        &mut self,
        name: &str,
    ) -> Result<ComponentTypeId, StoreError> {
        self.registry.register::<T>(name)
    }

    /// The registry as configured so far.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Declare an index. The returned handle stays current once the store is
    /// built.
    pub fn add_index(
        &mut self,
        name: &str,
        filter: IndexFilter,
    ) -> Result<Arc<ComponentIndex>, StoreError> {
        if filter.is_empty() {
            return Err(StoreError::EmptyIndexFilter {
                index: name.to_owned(),
            });
        }
        if let Some(unknown) = filter
            .tracked()
            .iter()
            .find(|ty| self.registry.get_info(*ty).is_none())
        {
            return Err(StoreError::UnknownComponent {
                index: name.to_owned(),
                component: format!("{unknown:?}"),
            });
        }
        let index = Arc::new(ComponentIndex::new(name, filter));
        self.indexes.push(Arc::clone(&index));
        Ok(index)
    }

    /// Install the receiver of lifecycle events.
    pub fn event_system(&mut self, events: Arc<dyn EventSystem>) -> &mut Self {
        self.events = Some(events);
        self
    }

    /// Register a custom interceptor. Within its stage it runs after the
    /// built-in interceptors unless `placement` says otherwise.
    pub fn interceptor(
        &mut self,
        stage: TransactionStage,
        name: &str,
        interceptor: Arc<dyn TransactionInterceptor>,
        placement: Placement,
    ) -> &mut Self {
        self.custom.push(CustomInterceptor {
            stage,
            name: name.to_owned(),
            interceptor,
            placement,
        });
        self
    }

    /// Replace the configuration.
    pub fn config(&mut self, config: StoreConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Assemble the pipeline and create the store.
    pub fn build(self) -> Result<EntityStore, StoreError> {
        let registry = Arc::new(self.registry);
        let table = Arc::new(ComponentTable::new(registry.len()));
        let locks = EntityLockManager::new();

        let mut pipeline = PipelineBuilder::new();
        pipeline
            .register(
                TransactionStage::ObtainLocks,
                interceptors::ENTITY_LOCK,
                Arc::new(EntityLockInterceptor::new(locks.clone())),
                Placement::new(),
            )
            .register(
                TransactionStage::VerifyCommit,
                interceptors::VERIFY_REVISIONS,
                Arc::new(VerifyRevisionsInterceptor::new(Arc::clone(&table))),
                Placement::new(),
            )
            .register(
                TransactionStage::ProcessCommit,
                interceptors::APPLY_COMMIT,
                Arc::new(ApplyCommitInterceptor::new(
                    Arc::clone(&table),
                    Arc::clone(&registry),
                )),
                Placement::new(),
            )
            .register(
                TransactionStage::ReleaseLocks,
                interceptors::ENTITY_UNLOCK,
                Arc::new(EntityUnlockInterceptor),
                Placement::new(),
            )
            .register(
                TransactionStage::Rollback,
                interceptors::WIPE,
                Arc::new(WipeInterceptor),
                Placement::new(),
            );

        for index in &self.indexes {
            pipeline.register(
                TransactionStage::UpdateIndexes,
                &interceptors::index_interceptor_name(index.name()),
                Arc::new(UpdateIndexInterceptor::new(
                    Arc::clone(index),
                    Arc::clone(&table),
                )),
                Placement::new(),
            );
        }

        if let Some(events) = self.events.filter(|_| self.config.emit_lifecycle_events) {
            pipeline.register(
                TransactionStage::PostCommit,
                interceptors::LIFECYCLE_EVENTS,
                Arc::new(LifecycleEventInterceptor::new(events)),
                Placement::new(),
            );
        }

        for custom in self.custom {
            pipeline.register(
                custom.stage,
                &custom.name,
                custom.interceptor,
                custom.placement,
            );
        }

        let pipeline = pipeline.build()?;
        tracing::debug!(
            components = registry.len(),
            indexes = self.indexes.len(),
            ?pipeline,
            "entity store built"
        );

        Ok(EntityStore {
            shared: Arc::new(StoreShared {
                registry,
                table,
                locks,
                pipeline,
                indexes: self.indexes,
                config: self.config,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// A transactional entity/component store. Cloning shares the same store.
#[derive(Clone)]
pub struct EntityStore {
    shared: Arc<StoreShared>,
}

impl EntityStore {
    /// Open a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.shared))
    }

    /// Create and commit one entity carrying `bundle`, in its own
    /// transaction. An empty bundle yields `Null`.
    pub fn create_entity(&self, bundle: ComponentBundle) -> Result<EntityRef, TransactionError> {
        let mut tx = self.begin();
        let entity = tx.create_entity_with(bundle)?;
        tx.commit()?;
        Ok(entity.flatten())
    }

    /// A concrete reference to `id` if it currently exists, else `Null`.
    pub fn get_entity(&self, id: EntityId) -> EntityRef {
        if self.shared.table.is_available(id) {
            EntityRef::Concrete(id)
        } else {
            EntityRef::Null
        }
    }

    /// Every existing entity, ascending. The snapshot is weakly consistent:
    /// commits running concurrently may or may not be reflected.
    pub fn all_entities(&self) -> impl Iterator<Item = EntityRef> {
        self.shared.table.entity_id_iter().map(EntityRef::Concrete)
    }

    /// The id the next materialized entity will receive.
    pub fn get_next_id(&self) -> EntityId {
        self.shared.table.next_entity_id()
    }

    /// Number of existing entities.
    pub fn entity_count(&self) -> usize {
        self.shared.table.entity_count()
    }

    /// Committed revision of `id` (0 if never committed).
    pub fn entity_revision(&self, id: EntityId) -> u64 {
        self.shared.table.entity_revision(id)
    }

    /// The component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.shared.registry
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// All declared indexes.
    pub fn indexes(&self) -> &[Arc<ComponentIndex>] {
        &self.shared.indexes
    }

    /// The index called `name`.
    pub fn index(&self, name: &str) -> Option<&Arc<ComponentIndex>> {
        self.shared.indexes.iter().find(|index| index.name() == name)
    }

    /// The assembled pipeline.
    pub fn pipeline(&self) -> &TransactionPipeline {
        &self.shared.pipeline
    }

    /// Whether a commit currently holds a lock on `id`.
    pub fn is_locked(&self, id: EntityId) -> bool {
        self.shared.locks.is_locked(id)
    }

    /// Run `work` in a fresh transaction and commit it, retrying the whole
    /// closure on revision conflicts up to
    /// [`StoreConfig::max_commit_retries`] times.
    pub fn transact<R>(
        &self,
        mut work: impl FnMut(&mut Transaction) -> Result<R, TransactionError>,
    ) -> Result<R, TransactionError> {
        let max_retries = self.shared.config.max_commit_retries;
        let mut attempt = 0;
        loop {
            let mut tx = self.begin();
            let outcome = work(&mut tx).and_then(|value| tx.commit().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, %error, "retrying transaction after conflict");
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.entity_count())
            .field("components", &self.shared.registry.len())
            .field("indexes", &self.shared.indexes.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
