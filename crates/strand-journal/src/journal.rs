//! Lifecycle journal recording every committed entity change.
//!
//! The [`LifecycleJournal`] is installed on an
//! [`EntityStoreBuilder`](strand_store::store::EntityStoreBuilder) as the
//! store's event system. Each [`LifecycleEvent`] the store emits after a commit
//! becomes one [`LifecycleRecord`], stamped with a journal-wide sequence number
//! and with component types translated to their registered names.
//!
//! The journal is shared between the committing threads and its readers, so
//! queries return owned records rather than borrowing the log.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use strand_journal::LifecycleJournal;
//! use strand_store::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health(u32);
//! impl Component for Health {}
//!
//! let mut builder = EntityStoreBuilder::new();
//! builder.register_component::<Health>("health").unwrap();
//! let journal = Arc::new(LifecycleJournal::new(builder.registry()));
//! builder.event_system(journal.clone());
//! let store = builder.build().unwrap();
//!
//! let entity = store.create_entity(ComponentBundle::new().with(Health(10))).unwrap();
//!
//! assert_eq!(journal.len(), 1);
//! let records = journal.records_for_entity(entity.id());
//! assert_eq!(records[0].kind, LifecycleKind::Added);
//! assert_eq!(records[0].component_names, vec!["health".to_owned()]);
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use strand_store::component::{ComponentRegistry, ComponentTypeId};
use strand_store::entity::EntityId;
use strand_store::lifecycle::{EventSystem, LifecycleEvent, LifecycleKind};

// ---------------------------------------------------------------------------
// LifecycleRecord
// ---------------------------------------------------------------------------

/// One recorded lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Position in the journal, starting at 0. Keeps counting across
    /// [`LifecycleJournal::clear`].
    pub sequence: u64,
    pub kind: LifecycleKind,
    pub entity_id: EntityId,
    /// Revision of the entity after the commit that produced this record.
    pub revision: u64,
    /// Registered names of the reported component types, in type order.
    pub component_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// LifecycleJournal
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct JournalState {
    next_sequence: u64,
    records: Vec<LifecycleRecord>,
}

/// Accumulates [`LifecycleRecord`]s from a store's commits and answers queries
/// over them.
#[derive(Debug)]
pub struct LifecycleJournal {
    /// Registered names indexed by [`ComponentTypeId::index`].
    names: Vec<String>,
    state: Mutex<JournalState>,
}

impl LifecycleJournal {
    /// Create an empty journal that names components as `registry` does.
    ///
    /// Names are copied, so register every component before creating the
    /// journal. Types registered later are recorded as `#<index>`.
    pub fn new(registry: &ComponentRegistry) -> Self {
        let mut names = Vec::with_capacity(registry.len());
        for id in registry.ids() {
            if names.len() <= id.index() {
                names.resize(id.index() + 1, String::new());
            }
            names[id.index()] = registry.name_of(id).to_owned();
        }
        Self {
            names,
            state: Mutex::new(JournalState::default()),
        }
    }

    fn component_name(&self, id: ComponentTypeId) -> String {
        match self.names.get(id.index()) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("#{}", id.index()),
        }
    }

    /// Append a record for `event`.
    pub fn record(&self, event: &LifecycleEvent) {
        let component_names = event
            .components
            .iter()
            .map(|id| self.component_name(id))
            .collect();
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        tracing::trace!(
            sequence,
            kind = %event.kind,
            entity = %event.entity.id(),
            revision = event.revision,
            "journaled lifecycle event"
        );
        state.records.push(LifecycleRecord {
            sequence,
            kind: event.kind,
            entity_id: event.entity.id(),
            revision: event.revision,
            component_names,
        });
    }

    /// Drop every record. Sequence numbers are not reused.
    pub fn clear(&self) {
        self.state.lock().records.clear();
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns `true` if no records are held.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// All records in the order they were received.
    pub fn records(&self) -> Vec<LifecycleRecord> {
        self.state.lock().records.clone()
    }

    /// Records about `entity`, oldest first.
    pub fn records_for_entity(&self, entity: EntityId) -> Vec<LifecycleRecord> {
        self.filtered(|record| record.entity_id == entity)
    }

    /// Records that report the component registered as `name`.
    pub fn records_for_component(&self, name: &str) -> Vec<LifecycleRecord> {
        self.filtered(|record| record.component_names.iter().any(|n| n == name))
    }

    /// Records of one kind.
    pub fn records_of_kind(&self, kind: LifecycleKind) -> Vec<LifecycleRecord> {
        self.filtered(|record| record.kind == kind)
    }

    /// The held records as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.state.lock().records)
    }

    fn filtered(&self, keep: impl Fn(&LifecycleRecord) -> bool) -> Vec<LifecycleRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|record| keep(record))
            .cloned()
            .collect()
    }
}

impl EventSystem for LifecycleJournal {
    fn send(&self, event: &LifecycleEvent) {
        self.record(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
