//! End-to-end scenarios for the transactional store.
//!
//! Each test drives the public API only: transactions, indexes and lifecycle
//! events, the way an application would.

use std::sync::Arc;

use parking_lot::Mutex;
use strand_store::prelude::*;

// ---------------------------------------------------------------------------
// Test component types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Named {
    name: String,
}

impl Component for Named {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Location {
    x: i32,
    y: i32,
}

impl Component for Location {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Physics {
    mass: u32,
}

impl Component for Physics {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Owner {
    owner: EntityRef,
}

fn owner_field(o: &mut Owner) -> &mut EntityRef {
    &mut o.owner
}

impl Component for Owner {
    const ENTITY_REFS: &'static [EntityRefField<Self>] =
        &[EntityRefField::new("owner", owner_field)];
}

fn named(name: &str) -> Named {
    Named {
        name: name.to_owned(),
    }
}

type EventLog = Arc<Mutex<Vec<LifecycleEvent>>>;

struct Fixture {
    store: EntityStore,
    physical: Arc<ComponentIndex>,
    events: EventLog,
    location: ComponentTypeId,
    physics: ComponentTypeId,
    named: ComponentTypeId,
}

/// Route store logs to the test harness; `RUST_LOG=strand_store=trace` shows
/// every pipeline stage.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn fixture() -> Fixture {
    init_tracing();
    let mut builder = EntityStoreBuilder::new();
    let named = builder.register_component::<Named>("named").unwrap();
    let location = builder.register_component::<Location>("location").unwrap();
    let physics = builder.register_component::<Physics>("physics").unwrap();
    builder.register_component::<Owner>("owner").unwrap();

    let physical = builder
        .add_index(
            "physical",
            IndexFilter::new().require(location).require(physics),
        )
        .unwrap();

    let events: EventLog = Arc::default();
    let sink = Arc::clone(&events);
    builder.event_system(Arc::new(move |event: &LifecycleEvent| {
        sink.lock().push(event.clone())
    }));

    Fixture {
        store: builder.build().unwrap(),
        physical,
        events,
        location,
        physics,
        named,
    }
}

fn kinds(events: &EventLog) -> Vec<LifecycleKind> {
    events.lock().iter().map(|e| e.kind).collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn scenario_a_committed_component_is_visible_later() {
    let f = fixture();

    let mut t1 = f.store.begin();
    let fred = t1.create_entity().unwrap();
    t1.add_component(&fred, named("Fred")).unwrap();
    t1.commit().unwrap();

    let mut t2 = f.store.begin();
    assert_eq!(t2.get_component::<Named>(&fred).unwrap(), Some(named("Fred")));
    assert_eq!(
        t2.get_component::<Named>(fred.id()).unwrap(),
        Some(named("Fred"))
    );
}

#[test]
fn scenario_b_stale_commit_conflicts_without_partial_apply() {
    let f = fixture();
    let entity = f
        .store
        .create_entity(ComponentBundle::new().with(named("original")))
        .unwrap();
    let id = entity.id();
    assert_eq!(f.store.entity_revision(id), 1);

    let mut t2 = f.store.begin();
    assert_eq!(
        t2.get_component::<Named>(id).unwrap(),
        Some(named("original"))
    );

    let mut t3 = f.store.begin();
    t3.get_component_mut::<Named>(id).unwrap().unwrap().name = "X".into();
    t3.commit().unwrap();
    assert_eq!(f.store.entity_revision(id), 2);

    t2.get_component_mut::<Named>(id).unwrap().unwrap().name = "Y".into();
    let err = t2.commit().unwrap_err();
    match err {
        TransactionError::Conflict(conflict) => {
            assert_eq!(conflict.entity, id);
            assert_eq!(conflict.expected, 1);
            assert_eq!(conflict.actual, 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(committed_name(&f.store, id), Some(named("X")));
    assert_eq!(f.store.entity_revision(id), 2);
}

fn committed_name(store: &EntityStore, id: EntityId) -> Option<Named> {
    let mut tx = store.begin();
    tx.get_component::<Named>(id).unwrap()
}

#[test]
fn scenario_b_also_conflicts_when_checked_only_under_lock() {
    let mut builder = EntityStoreBuilder::new();
    builder.register_component::<Named>("named").unwrap();
    builder.config(StoreConfig {
        verify_before_lock: false,
        ..StoreConfig::default()
    });
    let store = builder.build().unwrap();
    let id = store
        .create_entity(ComponentBundle::new().with(named("original")))
        .unwrap()
        .id();

    let mut stale = store.begin();
    stale.get_component::<Named>(id).unwrap();

    let mut winner = store.begin();
    winner.get_component_mut::<Named>(id).unwrap().unwrap().name = "X".into();
    winner.commit().unwrap();

    stale.get_component_mut::<Named>(id).unwrap().unwrap().name = "Y".into();
    assert_eq!(stale.commit().unwrap_err().kind(), ErrorKind::Conflict);
    assert!(!store.is_locked(id));

    let mut check = store.begin();
    assert_eq!(check.get_component::<Named>(id).unwrap(), Some(named("X")));
}

#[test]
fn scenario_c_entity_without_components_is_not_materialized() {
    let f = fixture();
    let next = f.store.get_next_id();

    let mut tx = f.store.begin();
    let empty = tx.create_entity().unwrap();
    assert!(!tx.exists(&empty).unwrap());
    let summary = tx.commit().unwrap();

    assert!(summary.created.is_empty());
    assert!(empty.is_null());
    assert_eq!(f.store.get_next_id(), next);
    assert_eq!(f.store.entity_count(), 0);

    let mut tx = f.store.begin();
    assert!(!tx.exists(&empty).unwrap());
}

#[test]
fn scenario_d_index_follows_composition() {
    let f = fixture();

    let mut t1 = f.store.begin();
    let e = t1.create_entity().unwrap();
    t1.add_component(&e, Location { x: 0, y: 0 }).unwrap();
    t1.commit().unwrap();
    assert!(!f.physical.contains(&e));

    let mut t2 = f.store.begin();
    t2.add_component(&e, Physics { mass: 5 }).unwrap();
    t2.commit().unwrap();
    assert!(f.physical.contains(&e));
    assert_eq!(f.physical.iter().collect::<Vec<_>>(), vec![EntityRef::Concrete(e.id())]);

    let mut t3 = f.store.begin();
    t3.remove_component::<Location>(&e).unwrap();
    t3.commit().unwrap();
    assert!(!f.physical.contains(&e));
    assert!(f.physical.is_empty());
}

#[test]
fn scenario_d_irrelevant_commit_leaves_index_alone() {
    let f = fixture();
    let e = f
        .store
        .create_entity(
            ComponentBundle::new()
                .with(Location { x: 1, y: 1 })
                .with(Physics { mass: 1 }),
        )
        .unwrap();
    let before = f.physical.snapshot();

    let mut tx = f.store.begin();
    tx.add_component(&e, named("irrelevant")).unwrap();
    tx.commit().unwrap();

    // No tracked type was touched, so the snapshot was not replaced.
    assert!(Arc::ptr_eq(&before, &f.physical.snapshot()));
    assert!(f.physical.contains(&e));
}

#[test]
fn scenario_e_add_then_remove_is_a_no_op() {
    let f = fixture();
    let e = f
        .store
        .create_entity(ComponentBundle::new().with(named("stable")))
        .unwrap();
    f.events.lock().clear();
    let revision = f.store.entity_revision(e.id());

    let mut tx = f.store.begin();
    tx.add_component(&e, Location { x: 3, y: 4 }).unwrap();
    let removed = tx.remove_component::<Location>(&e).unwrap();
    assert_eq!(removed, Location { x: 3, y: 4 });
    let summary = tx.commit().unwrap();

    assert!(summary.is_empty());
    assert!(f.events.lock().is_empty());
    assert_eq!(f.store.entity_revision(e.id()), revision);
    let mut check = f.store.begin();
    assert_eq!(check.get_component::<Location>(&e).unwrap(), None);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn zero_components_means_nonexistence() {
    let f = fixture();
    let mut tx = f.store.begin();
    let e = tx.create_entity().unwrap();
    tx.add_component(&e, named("a")).unwrap();
    tx.add_component(&e, Location { x: 0, y: 0 }).unwrap();
    tx.commit().unwrap();
    let id = e.id();

    let mut tx = f.store.begin();
    assert!(tx.exists(id).unwrap());
    tx.remove_component::<Named>(id).unwrap();
    assert!(tx.exists(id).unwrap());
    tx.remove_component::<Location>(id).unwrap();
    assert!(!tx.exists(id).unwrap());
    let summary = tx.commit().unwrap();
    assert_eq!(summary.deleted, 1);

    assert!(f.store.get_entity(id).is_null());
    let mut tx = f.store.begin();
    assert!(!tx.exists(id).unwrap());
    // Re-adding to a deleted id brings the entity back.
    tx.add_component(id, named("again")).unwrap();
    tx.commit().unwrap();
    assert_eq!(f.store.get_entity(id), EntityRef::Concrete(id));
}

#[test]
fn round_trip_returns_distinct_equal_copies() {
    let f = fixture();
    let mut tx = f.store.begin();
    let e = tx.create_entity().unwrap();
    tx.add_component(&e, named("orig")).unwrap();

    let mut copy = tx.get_component::<Named>(&e).unwrap().unwrap();
    assert_eq!(copy, named("orig"));
    copy.name.push_str("-changed");
    assert_eq!(tx.get_component::<Named>(&e).unwrap(), Some(named("orig")));
    tx.commit().unwrap();

    let mut tx = f.store.begin();
    assert_eq!(tx.get_component::<Named>(&e).unwrap(), Some(named("orig")));
}

#[test]
fn rollback_of_untouched_transaction_changes_nothing() {
    let f = fixture();
    let id = f
        .store
        .create_entity(ComponentBundle::new().with(named("x")))
        .unwrap()
        .id();
    let mut tx = f.store.begin();
    tx.rollback();
    assert_eq!(f.store.entity_revision(id), 1);
    assert_eq!(f.store.entity_count(), 1);
    tx.rollback();
}

#[test]
fn lifecycle_events_are_ordered_per_entity() {
    let f = fixture();
    let e = f
        .store
        .create_entity(
            ComponentBundle::new()
                .with(named("e"))
                .with(Location { x: 0, y: 0 }),
        )
        .unwrap();
    {
        let events = f.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LifecycleKind::Added);
        assert_eq!(events[0].entity, EntityRef::Concrete(e.id()));
        assert_eq!(events[0].revision, 1);
        assert_eq!(events[0].components.as_slice(), &[f.named, f.location]);
    }
    f.events.lock().clear();

    let mut tx = f.store.begin();
    tx.remove_component::<Location>(&e).unwrap();
    tx.get_component_mut::<Named>(&e).unwrap().unwrap().name = "renamed".into();
    tx.add_component(&e, Physics { mass: 2 }).unwrap();
    tx.commit().unwrap();

    assert_eq!(
        kinds(&f.events),
        vec![
            LifecycleKind::Added,
            LifecycleKind::Changed,
            LifecycleKind::Removed
        ]
    );
    let events = f.events.lock();
    assert!(events.iter().all(|ev| ev.revision == 2));
    assert_eq!(events[0].components.as_slice(), &[f.physics]);
    assert_eq!(events[1].components.as_slice(), &[f.named]);
    assert_eq!(events[2].components.as_slice(), &[f.location]);
}

#[test]
fn conflicting_commit_emits_no_events() {
    let f = fixture();
    let id = f
        .store
        .create_entity(ComponentBundle::new().with(named("x")))
        .unwrap()
        .id();
    let mut stale = f.store.begin();
    stale.get_component::<Named>(id).unwrap();
    f.store
        .transact(|tx| {
            tx.add_component(id, Physics { mass: 1 })?;
            Ok(())
        })
        .unwrap();
    f.events.lock().clear();

    stale.add_component(id, Location { x: 1, y: 1 }).unwrap();
    assert!(stale.commit().is_err());
    assert!(f.events.lock().is_empty());
}

#[test]
fn event_listener_may_open_transactions() {
    let mut builder = EntityStoreBuilder::new();
    builder.register_component::<Named>("named").unwrap();
    let seen: Arc<Mutex<Vec<Option<Named>>>> = Arc::default();
    let store_slot: Arc<Mutex<Option<EntityStore>>> = Arc::default();

    let slot = Arc::clone(&store_slot);
    let sink = Arc::clone(&seen);
    builder.event_system(Arc::new(move |event: &LifecycleEvent| {
        if let Some(store) = slot.lock().as_ref() {
            let mut tx = store.begin();
            sink.lock()
                .push(tx.get_component::<Named>(&event.entity).unwrap());
        }
    }));
    let store = builder.build().unwrap();
    *store_slot.lock() = Some(store.clone());

    store
        .create_entity(ComponentBundle::new().with(named("listener")))
        .unwrap();
    assert_eq!(*seen.lock(), vec![Some(named("listener"))]);

    store_slot.lock().take();
}

#[test]
fn proxies_inside_components_resolve_on_commit() {
    let f = fixture();
    let mut tx = f.store.begin();
    let owner = tx.create_entity().unwrap();
    tx.add_component(&owner, named("owner")).unwrap();
    let pet = tx.create_entity().unwrap();
    tx.add_component(
        &pet,
        Owner {
            owner: owner.clone(),
        },
    )
    .unwrap();
    let summary = tx.commit().unwrap();
    assert_eq!(summary.created.len(), 2);

    let mut tx = f.store.begin();
    let stored = tx.get_component::<Owner>(&pet).unwrap().unwrap();
    assert_eq!(stored.owner, EntityRef::Concrete(owner.id()));
    assert_eq!(
        tx.get_component_json(&pet, "owner").unwrap(),
        Some(serde_json::json!({ "owner": owner.id().to_raw() }))
    );
}

#[test]
fn entity_ref_delegates_to_transaction() {
    let f = fixture();
    let mut tx = f.store.begin();
    let e = tx.create_entity().unwrap();
    e.add_component(&mut tx, named("delegate")).unwrap();
    assert!(e.exists(&mut tx).unwrap());
    assert_eq!(
        e.get_component::<Named>(&mut tx).unwrap(),
        Some(named("delegate"))
    );
    tx.commit().unwrap();

    let mut tx = f.store.begin();
    e.delete(&mut tx).unwrap();
    tx.commit().unwrap();
    assert!(f.store.get_entity(e.id()).is_null());
}

#[test]
fn all_entities_lists_existing_ids() {
    let f = fixture();
    let a = f
        .store
        .create_entity(ComponentBundle::new().with(named("a")))
        .unwrap();
    let b = f
        .store
        .create_entity(ComponentBundle::new().with(named("b")))
        .unwrap();
    assert_eq!(f.store.all_entities().collect::<Vec<_>>(), vec![a, b]);
}

// ---------------------------------------------------------------------------
// Commit failures inside the locked stages
// ---------------------------------------------------------------------------

/// A store with the "physical" index and one failing `ProcessCommit`
/// interceptor, placed before or after `apply-commit`.
fn store_failing_at_process(after_apply: bool) -> (EntityStore, Arc<ComponentIndex>) {
    init_tracing();
    let mut builder = EntityStoreBuilder::new();
    builder.register_component::<Named>("named").unwrap();
    let location = builder.register_component::<Location>("location").unwrap();
    let physics = builder.register_component::<Physics>("physics").unwrap();
    let physical = builder
        .add_index(
            "physical",
            IndexFilter::new().require(location).require(physics),
        )
        .unwrap();
    let placement = if after_apply {
        Placement::new().after(strand_store::interceptors::APPLY_COMMIT)
    } else {
        Placement::new().before(strand_store::interceptors::APPLY_COMMIT)
    };
    builder.interceptor(
        TransactionStage::ProcessCommit,
        "quota",
        Arc::new(|_: &mut TransactionContext| -> Result<(), TransactionError> {
            Err(TransactionError::Interceptor {
                name: "quota".into(),
                message: "exceeded".into(),
            })
        }),
        placement,
    );
    (builder.build().unwrap(), physical)
}

#[test]
fn failure_after_apply_keeps_writes_and_releases_locks() {
    let (store, physical) = store_failing_at_process(true);

    // Every commit on this store fails after writing, the seed included.
    let mut tx = store.begin();
    let seed = tx.create_entity().unwrap();
    tx.add_component(&seed, named("seed")).unwrap();
    assert_eq!(tx.commit().unwrap_err().kind(), ErrorKind::Fatal);
    let existing = seed.id();
    assert!(!existing.is_null());
    assert_eq!(store.entity_count(), 1);
    assert_eq!(store.entity_revision(existing), 1);

    let mut tx = store.begin();
    tx.add_component(existing, Location { x: 1, y: 2 }).unwrap();
    tx.add_component(existing, Physics { mass: 3 }).unwrap();
    let fresh = tx
        .create_entity_with(
            ComponentBundle::new()
                .with(Location { x: 0, y: 0 })
                .with(Physics { mass: 1 }),
        )
        .unwrap();
    let err = tx.commit().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(matches!(
        err,
        TransactionError::PartiallyApplied {
            stage: TransactionStage::ProcessCommit,
            ..
        }
    ));
    assert!(!store.is_locked(existing));
    assert!(!store.is_locked(fresh.id()));

    // The new entity exists and its handle points at it.
    assert!(!fresh.is_null());
    assert_eq!(store.get_entity(fresh.id()), fresh.flatten());
    assert_eq!(store.entity_count(), 2);

    // Indexes were refreshed even though UpdateIndexes never ran.
    assert_eq!(physical.ids(), vec![existing, fresh.id()]);
}

#[test]
fn failure_before_apply_rolls_back_and_releases_locks() {
    let (store, physical) = store_failing_at_process(false);

    let mut tx = store.begin();
    let fresh = tx
        .create_entity_with(
            ComponentBundle::new()
                .with(Location { x: 0, y: 0 })
                .with(Physics { mass: 1 }),
        )
        .unwrap();
    let err = tx.commit().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(matches!(err, TransactionError::Interceptor { .. }));
    assert!(fresh.is_null());
    assert_eq!(store.entity_count(), 0);
    assert!(physical.is_empty());
    assert_eq!(store.get_next_id(), EntityId::from_raw(1));
}
