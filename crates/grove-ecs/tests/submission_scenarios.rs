//! End-to-end submission scenarios: bulk builds, reactive follow-ups, group
//! operations and their failure reporting.

use std::io;
use std::sync::{Arc, Mutex};

use grove_ecs::prelude::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
#[repr(C)]
struct Counter {
    value: u32,
}
impl Component for Counter {}

#[derive(Debug, Default, Clone, PartialEq)]
struct Label(String);
impl Component for Label {}

fn counter_db() -> (EntitiesDb, EntityDescriptor) {
    let mut db = EntitiesDb::new();
    let desc = db.descriptor().with::<Counter>().build().unwrap();
    (db, desc)
}

// ---------------------------------------------------------------------------
// Bulk
// ---------------------------------------------------------------------------

#[test]
fn one_million_entities_are_individually_retrievable() {
    const COUNT: u32 = 1_000_000;
    let mut db = EntitiesDb::with_config(DbConfig {
        initial_store_capacity: COUNT as usize,
        ..DbConfig::default()
    });
    let desc = db.descriptor().with::<Counter>().build().unwrap();
    let group = db.allocate_group().unwrap();

    for id in 0..COUNT {
        db.build_entity(Egid::new(id, group), &desc)
            .unwrap()
            .init(Counter { value: id })
            .unwrap();
    }
    let report = db.submit_entities().unwrap();
    assert_eq!(report.entities_added, COUNT as usize);
    assert_eq!(db.count::<Counter>(group), COUNT as usize);

    for id in 0..COUNT {
        assert_eq!(db.get::<Counter>(Egid::new(id, group)).unwrap().value, id);
    }

    db.remove_entities_from_group(group);
    db.submit_entities().unwrap();
    assert_eq!(db.count::<Counter>(group), 0);
    drop(db);
}

#[test]
fn staged_builds_reuse_their_buffers() {
    let (mut db, desc) = counter_db();
    let group = db.allocate_group().unwrap();

    for round in 0..4u32 {
        let base = round * 100;
        for id in base..base + 100 {
            db.build_entity(Egid::new(id, group), &desc).unwrap();
        }
        assert_eq!(db.operations().queued_builds(), 100);
        db.submit_entities().unwrap();
        assert_eq!(db.count::<Counter>(group), (base + 100) as usize);
    }
}

#[test]
fn raw_bytes_round_trip_between_groups() {
    let (mut db, desc) = counter_db();
    let [a, b] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
    for id in 0..8 {
        db.build_entity(Egid::new(id, a), &desc)
            .unwrap()
            .init(Counter { value: id * 3 })
            .unwrap();
        db.build_entity(Egid::new(id, b), &desc).unwrap();
    }
    db.submit_entities().unwrap();

    let bytes = db.store::<Counter>(a).unwrap().as_bytes().to_vec();
    db.store_mut::<Counter>(b).unwrap().serialise_from(&bytes).unwrap();
    for id in 0..8 {
        assert_eq!(db.get::<Counter>(Egid::new(id, b)).unwrap().value, id * 3);
    }

    let err = db.store_mut::<Counter>(b).unwrap().serialise_from(&bytes[1..]).unwrap_err();
    assert!(matches!(err, EcsError::BufferSizeMismatch { .. }));
}

// ---------------------------------------------------------------------------
// Reactive follow-ups
// ---------------------------------------------------------------------------

/// On every add, queues a label entity in a companion group.
struct LabelOnAdd {
    labels: EntityDescriptor,
    target: GroupId,
}

impl ReactiveEngine<Counter> for LabelOnAdd {
    fn added(&mut self, counter: &mut Counter, egid: Egid, ops: &mut OperationBuffer) {
        counter.value += 1;
        let _ = ops
            .build_entity(Egid::new(egid.entity_id, self.target), &self.labels)
            .and_then(|mut init| {
                init.init(Label(format!("from {egid}")))?;
                Ok(())
            });
    }
}

#[test]
fn builds_queued_by_handlers_wait_for_the_next_submission() {
    let (mut db, desc) = counter_db();
    let labels = db.descriptor().with::<Label>().build().unwrap();
    let [counters, tags] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
    db.add_reactive_engine(LabelOnAdd {
        labels,
        target: tags,
    });

    db.build_entity(Egid::new(0, counters), &desc).unwrap();
    db.submit_entities().unwrap();

    assert_eq!(db.get::<Counter>(Egid::new(0, counters)).unwrap().value, 1);
    assert!(!db.exists::<Label>(Egid::new(0, tags)));
    assert!(db.has_queued_operations());

    db.submit_entities().unwrap();
    let label = db.get::<Label>(Egid::new(0, tags)).unwrap();
    assert_eq!(label.0, format!("from {}", Egid::new(0, counters)));
    assert!(!db.has_queued_operations());
}

/// Moves every counter that reaches a group onward to the next group, once.
struct Relay {
    desc: EntityDescriptor,
    from: GroupId,
    to: GroupId,
    log: Arc<Mutex<Vec<(Egid, Egid)>>>,
}

impl ReactiveEngine<Counter> for Relay {
    fn moved_to(&mut self, _: &mut Counter, from: Egid, to: Egid, ops: &mut OperationBuffer) {
        self.log.lock().unwrap().push((from, to));
        if to.group_id == self.from {
            ops.swap_entity_group(to, self.to, &self.desc);
        }
    }
}

#[test]
fn swaps_queued_by_handlers_are_replayed_next_time() {
    let (mut db, desc) = counter_db();
    let [a, b, c] = [
        db.allocate_group().unwrap(),
        db.allocate_group().unwrap(),
        db.allocate_group().unwrap(),
    ];
    let log = Arc::new(Mutex::new(Vec::new()));
    db.add_reactive_engine(Relay {
        desc: desc.clone(),
        from: b,
        to: c,
        log: log.clone(),
    });

    db.build_entity(Egid::new(7, a), &desc).unwrap();
    db.submit_entities().unwrap();
    db.swap_entity_group(Egid::new(7, a), b, &desc);
    db.submit_entities().unwrap();
    assert!(db.exists::<Counter>(Egid::new(7, b)));

    db.submit_entities().unwrap();
    assert!(db.exists::<Counter>(Egid::new(7, c)));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (Egid::new(7, a), Egid::new(7, b)),
            (Egid::new(7, b), Egid::new(7, c)),
        ]
    );
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[test]
fn querying_an_empty_group_gives_a_zero_count_view() {
    let (mut db, desc) = counter_db();
    let group = db.allocate_group().unwrap();
    let batch = db.query_entities::<&Counter>(group);
    assert_eq!(batch.count(), 0);
    assert!(batch.buffers.is_empty());

    db.build_entity(Egid::new(1, group), &desc).unwrap();
    db.submit_entities().unwrap();
    db.remove_entity(Egid::new(1, group), &desc);
    db.submit_entities().unwrap();
    assert_eq!(db.query_entities::<&Counter>(group).count(), 0);
    assert_eq!(db.query_all::<&Counter>().iter().count(), 0);
}

#[test]
fn group_swap_relocates_every_record() {
    let mut db = EntitiesDb::new();
    let desc = db.descriptor().with::<Counter>().with::<Label>().build().unwrap();
    let [from, to] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
    for id in 0..50 {
        db.build_entity(Egid::new(id, from), &desc)
            .unwrap()
            .init(Label(id.to_string()))
            .unwrap();
    }
    db.submit_entities().unwrap();

    db.swap_group(from, to);
    let report = db.submit_entities().unwrap();
    assert_eq!(report.groups_swapped, 1);
    assert!(!db.has_group(from));
    for id in 0..50 {
        assert_eq!(db.get::<Label>(Egid::new(id, to)).unwrap().0, id.to_string());
        assert!(!db.exists::<Counter>(Egid::new(id, from)));
    }
    let groups: Vec<_> = db.query_all::<(&Counter, &Label)>().iter().map(|b| b.group).collect();
    assert_eq!(groups, vec![to]);
}

#[test]
fn group_swap_merges_into_a_populated_group() {
    let (mut db, desc) = counter_db();
    let [from, to] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
    db.build_entity(Egid::new(1, from), &desc).unwrap();
    db.build_entity(Egid::new(2, to), &desc).unwrap();
    db.submit_entities().unwrap();

    db.swap_group(from, to);
    db.submit_entities().unwrap();
    assert_eq!(db.count::<Counter>(to), 2);
    assert_eq!(db.entity_ids::<Counter>(to), vec![2, 1]);
}

#[test]
fn builds_into_a_group_removed_in_the_same_cycle_survive() {
    let (mut db, desc) = counter_db();
    let group = db.allocate_group().unwrap();
    db.build_entity(Egid::new(0, group), &desc).unwrap();
    db.submit_entities().unwrap();

    db.remove_entities_from_group(group);
    db.build_entity(Egid::new(1, group), &desc).unwrap();
    db.submit_entities().unwrap();

    assert!(!db.exists::<Counter>(Egid::new(0, group)));
    assert!(db.exists::<Counter>(Egid::new(1, group)));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn duplicate_build_in_one_cycle_is_rejected_immediately() {
    let (mut db, desc) = counter_db();
    let group = db.allocate_group().unwrap();
    db.build_entity(Egid::new(3, group), &desc).unwrap();
    let err = db.build_entity(Egid::new(3, group), &desc).err().unwrap();
    assert!(matches!(err, EcsError::DuplicateEntity { egid, .. } if egid == Egid::new(3, group)));

    let report = db.submit_entities().unwrap();
    assert_eq!(report.entities_added, 1);
}

#[test]
fn initializing_an_undeclared_component_is_a_type_mismatch() {
    let (mut db, desc) = counter_db();
    let group = db.allocate_group().unwrap();
    let mut init = db.build_entity(Egid::new(0, group), &desc).unwrap();
    let err = init.init(Label("nope".into())).err().unwrap();
    assert!(matches!(err, EcsError::TypeMismatch { component: "Label", .. }));
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[test]
fn failed_group_operation_is_logged_and_aborts_the_rest() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let (mut db, desc) = counter_db();
        let [a, b, c] = [
            db.allocate_group().unwrap(),
            db.allocate_group().unwrap(),
            db.allocate_group().unwrap(),
        ];
        db.build_entity(Egid::new(1, a), &desc).unwrap();
        db.build_entity(Egid::new(1, b), &desc).unwrap();
        db.build_entity(Egid::new(5, c), &desc).unwrap();
        db.submit_entities().unwrap();

        // Entity ops replay first and stay applied.
        db.remove_entity(Egid::new(5, c), &desc);
        db.swap_group(a, b);
        db.swap_group(c, a);
        db.build_entity(Egid::new(9, c), &desc).unwrap();

        let err = db.submit_entities().unwrap_err();
        assert!(matches!(err, EcsError::GroupOperationFailure { group, .. } if group == a));
        assert!(!db.exists::<Counter>(Egid::new(5, c)));
        // The second group swap and the build were discarded.
        assert!(db.exists::<Counter>(Egid::new(1, a)));
        assert!(!db.exists::<Counter>(Egid::new(9, c)));
        assert!(!db.has_queued_operations());

        // The next cycle starts clean.
        db.build_entity(Egid::new(9, c), &desc).unwrap();
        assert_eq!(db.submit_entities().unwrap().entities_added, 1);
    });

    let logs = captured.text();
    assert!(logs.contains("crash while swapping a whole group"), "{logs}");
    assert!(logs.contains("submission_scenarios.rs"), "{logs}");
}

#[test]
fn missing_targets_are_skipped_with_a_warning() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let (mut db, desc) = counter_db();
        let group = db.allocate_group().unwrap();
        db.build_entity(Egid::new(0, group), &desc).unwrap();
        db.submit_entities().unwrap();

        db.remove_entity(Egid::new(42, group), &desc);
        db.remove_entity(Egid::new(0, group), &desc);
        db.remove_entity(Egid::new(0, group), &desc);
        let report = db.submit_entities().unwrap();
        assert_eq!(report.missing, 2);
        assert_eq!(report.conflict_count, 1);
        assert_eq!(db.count::<Counter>(group), 0);
    });

    let logs = captured.text();
    assert!(logs.contains("missing entity"), "{logs}");
    assert!(logs.contains("more than one structural operation"), "{logs}");
}

#[test]
fn removing_an_absent_group_under_the_error_policy_is_logged_and_aborts() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut db = EntitiesDb::with_config(DbConfig {
            missing_entity_policy: MissingEntityPolicy::Error,
            ..DbConfig::default()
        });
        let desc = db.descriptor().with::<Counter>().build().unwrap();
        let [kept, absent] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
        db.build_entity(Egid::new(0, kept), &desc).unwrap();
        db.submit_entities().unwrap();
        let before = db.fingerprint();

        db.remove_entities_from_group(absent);
        db.build_entity(Egid::new(1, kept), &desc).unwrap();
        let err = db.submit_entities().unwrap_err();
        match err {
            EcsError::GroupOperationFailure {
                group,
                to_group,
                caller,
                source,
            } => {
                assert_eq!(group, absent);
                assert_eq!(to_group, None);
                assert!(caller.to_string().contains("submission_scenarios.rs"));
                assert!(matches!(*source, EcsError::GroupNotFound { group } if group == absent));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The build queued behind the failure was dropped.
        assert!(!db.exists::<Counter>(Egid::new(1, kept)));
        assert!(db.exists::<Counter>(Egid::new(0, kept)));
        assert_eq!(db.fingerprint(), before);
        assert!(!db.has_queued_operations());
        assert_eq!(db.submission_state(), SubmissionState::Idle);
    });

    let logs = captured.text();
    assert!(logs.contains("crash while removing a whole group"), "{logs}");
    assert!(logs.contains("does not exist"), "{logs}");
}
