//! The commit/rollback pipeline.
//!
//! A commit runs a fixed sequence of [`TransactionStage`]s. Each stage holds an
//! ordered list of [`TransactionInterceptor`]s that cooperate through typed
//! attachments on a shared [`TransactionContext`]. Locking, verification,
//! table writes, index maintenance and lifecycle events are all interceptors,
//! so cross-cutting behavior can be added without touching the transaction or
//! the table.
//!
//! The pipeline is assembled once by [`PipelineBuilder`] and is immutable
//! afterwards. Interceptors declare `after`/`before` constraints against other
//! interceptors of the same stage; [`PipelineBuilder::build`] resolves each
//! stage's order with a stable topological sort (registration order breaks
//! ties) and rejects duplicates, unknown names and cycles up front.
//!
//! Interceptor contract: an interceptor must tolerate a missing attachment
//! (the transaction touched nothing it cares about) and must not assume it is
//! the only interceptor in its stage.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::TransactionError;

// ---------------------------------------------------------------------------
// TransactionStage
// ---------------------------------------------------------------------------

/// A named point in the commit or rollback sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionStage {
    /// Acquire the entity lock over every entity the transaction touched.
    ObtainLocks,
    /// Re-check expected revisions while the lock is held.
    VerifyCommit,
    /// Materialize new entities and apply staged changes to the table.
    ProcessCommit,
    /// Re-test index membership of touched entities.
    UpdateIndexes,
    /// Release the entity lock. Runs on every exit path once locks were taken.
    ReleaseLocks,
    /// After unlock: lifecycle notifications.
    PostCommit,
    /// Discard staged state instead of committing.
    Rollback,
}

impl TransactionStage {
    /// Every stage, in execution order (`Rollback` last).
    pub const ALL: [TransactionStage; 7] = [
        TransactionStage::ObtainLocks,
        TransactionStage::VerifyCommit,
        TransactionStage::ProcessCommit,
        TransactionStage::UpdateIndexes,
        TransactionStage::ReleaseLocks,
        TransactionStage::PostCommit,
        TransactionStage::Rollback,
    ];

    /// Stages a successful commit runs through, in order.
    pub const COMMIT: [TransactionStage; 6] = [
        TransactionStage::ObtainLocks,
        TransactionStage::VerifyCommit,
        TransactionStage::ProcessCommit,
        TransactionStage::UpdateIndexes,
        TransactionStage::ReleaseLocks,
        TransactionStage::PostCommit,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStage::ObtainLocks => "OBTAIN_LOCKS",
            TransactionStage::VerifyCommit => "VERIFY_COMMIT",
            TransactionStage::ProcessCommit => "PROCESS_COMMIT",
            TransactionStage::UpdateIndexes => "UPDATE_INDEXES",
            TransactionStage::ReleaseLocks => "RELEASE_LOCKS",
            TransactionStage::PostCommit => "POST_COMMIT",
            TransactionStage::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// TransactionContext
// ---------------------------------------------------------------------------

/// Per-transaction association list of attachments keyed by type.
#[derive(Default)]
pub struct TransactionContext {
    attachments: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl TransactionContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `value`, returning any previous attachment of the same type.
    pub fn attach<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.attachments
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// The attachment of type `T`, if any.
    pub fn attachment<T: Any + Send>(&self) -> Option<&T> {
        self.attachments
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Mutable access to the attachment of type `T`, if any.
    pub fn attachment_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.attachments
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// The attachment of type `T`, created with `init` if absent.
    pub fn get_or_attach<T: Any + Send>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        let slot = self
            .attachments
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(init()));
        match slot.downcast_mut::<T>() {
            Some(value) => value,
            // The map is keyed by `TypeId::of::<T>()`, so the slot always holds a `T`.
            None => unreachable!("attachment keyed by TypeId holds a different type"),
        }
    }

    /// Remove and return the attachment of type `T`.
    pub fn detach<T: Any + Send>(&mut self) -> Option<T> {
        self.attachments
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Whether an attachment of type `T` is present.
    pub fn has<T: Any + Send>(&self) -> bool {
        self.attachments.contains_key(&TypeId::of::<T>())
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TransactionInterceptor
// ---------------------------------------------------------------------------

/// A unit of commit-time behavior run at one stage.
pub trait TransactionInterceptor: Send + Sync {
    /// Run against the transaction's context. An error aborts the commit.
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError>;
}

impl<F> TransactionInterceptor for F
where
    F: Fn(&mut TransactionContext) -> Result<(), TransactionError> + Send + Sync,
{
    fn intercept(&self, context: &mut TransactionContext) -> Result<(), TransactionError> {
        self(context)
    }
}

/// Ordering constraints for an interceptor within its stage.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    after: Vec<String>,
    before: Vec<String>,
}

impl Placement {
    /// No constraints: runs in registration order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run after the interceptor named `name`.
    pub fn after(mut self, name: &str) -> Self {
        self.after.push(name.to_owned());
        self
    }

    /// Run before the interceptor named `name`.
    pub fn before(mut self, name: &str) -> Self {
        self.before.push(name.to_owned());
        self
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Errors detected while assembling a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Two interceptors in the same stage share a name.
    #[error("duplicate interceptor '{name}' in stage {stage}")]
    DuplicateInterceptor {
        stage: TransactionStage,
        name: String,
    },

    /// A constraint references an interceptor not registered in the stage.
    #[error("interceptor '{name}' in stage {stage} is ordered against unknown interceptor '{dependency}'")]
    UnknownDependency {
        stage: TransactionStage,
        name: String,
        dependency: String,
    },

    /// The constraints of a stage form a cycle.
    #[error("ordering constraints in stage {stage} form a cycle through [{}]", names.join(", "))]
    Cycle {
        stage: TransactionStage,
        names: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

struct Registration {
    name: String,
    interceptor: Arc<dyn TransactionInterceptor>,
    placement: Placement,
}

/// Collects interceptor registrations and resolves them into a
/// [`TransactionPipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: HashMap<TransactionStage, Vec<Registration>>,
}

impl PipelineBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `interceptor` under `name` at `stage`.
    pub fn register(
        &mut self,
        stage: TransactionStage,
        name: &str,
        interceptor: Arc<dyn TransactionInterceptor>,
        placement: Placement,
    ) -> &mut Self {
        self.stages.entry(stage).or_default().push(Registration {
            name: name.to_owned(),
            interceptor,
            placement,
        });
        self
    }

    /// Resolve every stage's execution order.
    pub fn build(self) -> Result<TransactionPipeline, PipelineError> {
        let mut stages: Vec<Vec<NamedInterceptor>> =
            (0..TransactionStage::ALL.len()).map(|_| Vec::new()).collect();
        for (stage, registrations) in self.stages {
            stages[stage.slot()] = order_stage(stage, registrations)?;
        }
        Ok(TransactionPipeline { stages })
    }
}

/// Stable topological sort (Kahn) of one stage's registrations.
fn order_stage(
    stage: TransactionStage,
    registrations: Vec<Registration>,
) -> Result<Vec<NamedInterceptor>, PipelineError> {
    let count = registrations.len();
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(count);
    for (idx, reg) in registrations.iter().enumerate() {
        if position.insert(reg.name.as_str(), idx).is_some() {
            return Err(PipelineError::DuplicateInterceptor {
                stage,
                name: reg.name.clone(),
            });
        }
    }

    // successors[a] contains b when a must run before b.
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut in_degree = vec![0usize; count];
    for (idx, reg) in registrations.iter().enumerate() {
        let lookup = |dependency: &String| {
            position
                .get(dependency.as_str())
                .copied()
                .ok_or_else(|| PipelineError::UnknownDependency {
                    stage,
                    name: reg.name.clone(),
                    dependency: dependency.clone(),
                })
        };
        for dep in &reg.placement.after {
            let before_idx = lookup(dep)?;
            successors[before_idx].push(idx);
            in_degree[idx] += 1;
        }
        for dep in &reg.placement.before {
            let after_idx = lookup(dep)?;
            successors[idx].push(after_idx);
            in_degree[after_idx] += 1;
        }
    }

    let mut order = Vec::with_capacity(count);
    let mut done = vec![false; count];
    while order.len() < count {
        let next = (0..count).find(|&idx| !done[idx] && in_degree[idx] == 0);
        let Some(idx) = next else {
            let names = (0..count)
                .filter(|&idx| !done[idx])
                .map(|idx| registrations[idx].name.clone())
                .collect();
            return Err(PipelineError::Cycle { stage, names });
        };
        done[idx] = true;
        order.push(idx);
        for &succ in &successors[idx] {
            in_degree[succ] -= 1;
        }
    }

    let mut slots: Vec<Option<Registration>> = registrations.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .map(|reg| NamedInterceptor {
            name: reg.name,
            interceptor: reg.interceptor,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// TransactionPipeline
// ---------------------------------------------------------------------------

struct NamedInterceptor {
    name: String,
    interceptor: Arc<dyn TransactionInterceptor>,
}

/// The immutable, fully ordered set of interceptors for every stage.
pub struct TransactionPipeline {
    /// Indexed by stage slot.
    stages: Vec<Vec<NamedInterceptor>>,
}

impl TransactionPipeline {
    /// Run every interceptor of `stage` in order, stopping at the first error.
    pub fn run(
        &self,
        stage: TransactionStage,
        context: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        for entry in &self.stages[stage.slot()] {
            tracing::trace!(%stage, interceptor = %entry.name, "running interceptor");
            entry.interceptor.intercept(context)?;
        }
        Ok(())
    }

    /// Names of the interceptors of `stage`, in execution order.
    pub fn interceptor_names(&self, stage: TransactionStage) -> Vec<&str> {
        self.stages[stage.slot()]
            .iter()
            .map(|entry| entry.name.as_str())
            .collect()
    }
}

impl fmt::Debug for TransactionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for stage in TransactionStage::ALL {
            map.entry(&stage, &self.interceptor_names(stage));
        }
        map.finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
