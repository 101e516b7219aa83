//! End-to-end collection and custody scenarios through the coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;

use wastetrail::{
    CollectionCoordinator, Config, ContainerRef, DriverId, Error, ErrorKind, HandoffContainer,
    HandoffStage, HandoffStatus, HandoffType, LocationFix, ManualClock, Receiver, Session,
    SqliteStore, StartCollection, StaticRegistry, TracingPublisher,
};

struct Harness {
    coordinator: CollectionCoordinator,
    clock: Arc<ManualClock>,
    driver: DriverId,
}

fn harness_with(store: SqliteStore) -> Harness {
    harness_over(store, ["A", "B", "C"])
}

fn harness_over<I, S>(store: SqliteStore, refs: I) -> Harness
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let clock = Arc::new(ManualClock::default());
    let coordinator = CollectionCoordinator::new(
        Arc::new(store),
        Arc::new(StaticRegistry::with_containers("clinic-9", refs)),
        clock.clone(),
        Arc::new(TracingPublisher),
        &Config::default(),
    )
    .unwrap();
    Harness {
        coordinator,
        clock,
        driver: DriverId::new("driver-1"),
    }
}

fn harness() -> Harness {
    harness_with(SqliteStore::open_in_memory().unwrap())
}

fn start(h: &Harness, refs: &[&str]) -> Session {
    h.coordinator
        .start_collection(
            &h.driver,
            StartCollection {
                container_refs: refs.iter().map(|r| ContainerRef::from(*r)).collect(),
                ..StartCollection::default()
            },
        )
        .unwrap()
}

fn visit(h: &Harness, session: &Session, r: &str) {
    h.coordinator
        .mark_visited(&h.driver, &session.id, &ContainerRef::from(r), None)
        .unwrap();
}

fn plant() -> Receiver {
    Receiver::IncinerationPlant {
        plant_id: "plant-1".to_string(),
    }
}

fn containers(refs: &[&str]) -> Option<Vec<HandoffContainer>> {
    Some(refs.iter().map(|r| HandoffContainer::new(*r)).collect())
}

#[test]
fn concurrent_starts_for_one_driver_yield_one_session() {
    let h = harness();
    let successes = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                match h.coordinator.start_collection(
                    &h.driver,
                    StartCollection {
                        container_refs: vec![ContainerRef::from("A")],
                        ..StartCollection::default()
                    },
                ) {
                    Ok(_) => successes.fetch_add(1, Ordering::SeqCst),
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::Conflict);
                        conflicts.fetch_add(1, Ordering::SeqCst)
                    }
                };
            });
        }
    });

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(conflicts.load(Ordering::SeqCst), 15);
    assert!(h.coordinator.active_session(&h.driver).is_ok());
}

#[test]
fn repeated_visit_changes_nothing() {
    let h = harness();
    let session = start(&h, &["A", "B"]);
    let a = ContainerRef::from("A");

    let first = h
        .coordinator
        .mark_visited(&h.driver, &session.id, &a, Some(5.0))
        .unwrap();
    let second = h
        .coordinator
        .mark_visited(&h.driver, &session.id, &a, None)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.visited_count(), 1);
    assert_eq!(second.selected_containers.len(), 2);
}

#[test]
fn incinerator_handoff_waits_for_completed_facility_handoff() {
    let h = harness();
    let session = start(&h, &["A"]);
    visit(&h, &session, "A");

    let err = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::DriverToIncinerator,
            plant(),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::PriorStageIncomplete { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn full_custody_chain_round_trip() {
    let h = harness();
    let session = start(&h, &["A", "B", "C"]);
    for r in ["A", "B", "C"] {
        visit(&h, &session, r);
    }
    h.coordinator
        .stop_collection(&h.driver, &session.id, None)
        .unwrap();

    // Facility -> driver, with an explicit list.
    let first = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::FacilityToDriver,
            Receiver::Contact {
                phone: "+998901234567".to_string(),
            },
            containers(&["A", "B", "C"]),
        )
        .unwrap();
    h.coordinator
        .confirm_handoff(&first.handoff.id, None, "clinic-9")
        .unwrap();
    let done = h
        .coordinator
        .confirm_handoff(&first.handoff.id, Some(&first.confirmation_token), "driver-1")
        .unwrap();
    assert_eq!(done.status, HandoffStatus::Completed);
    assert_eq!(done.total_containers, 3);

    // Driver -> incinerator, derived from the visited set.
    let second = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::DriverToIncinerator,
            plant(),
            None,
        )
        .unwrap();
    assert_eq!(second.handoff.total_containers, 3);
    h.coordinator
        .confirm_handoff(&second.handoff.id, None, "driver-1")
        .unwrap();
    h.coordinator
        .confirm_handoff(&second.handoff.id, Some(&second.confirmation_token), "plant-1")
        .unwrap();

    let summary = h.coordinator.session_summary(&session.id).unwrap();
    assert_eq!(
        summary.session.handoff_state.stage,
        HandoffStage::IncineratorConfirmed
    );
    assert_eq!(summary.handoffs.len(), 2);
    assert!(summary
        .handoffs
        .iter()
        .all(|handoff| handoff.status == HandoffStatus::Completed));

    let report = h.coordinator.verify_trail(&session.id).unwrap();
    assert!(report.intact);
    // start, 3 visits, stop, and 3 transitions per handoff.
    assert_eq!(report.entries, 11);
}

#[test]
fn token_completes_exactly_one_handoff() {
    let h = harness();
    let session = start(&h, &["A"]);
    visit(&h, &session, "A");
    let issued = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::FacilityToDriver,
            plant(),
            None,
        )
        .unwrap();
    h.coordinator
        .confirm_handoff(&issued.handoff.id, None, "clinic-9")
        .unwrap();
    h.coordinator
        .confirm_handoff(&issued.handoff.id, Some(&issued.confirmation_token), "plant-1")
        .unwrap();

    let err = h
        .coordinator
        .confirm_handoff(&issued.handoff.id, Some(&issued.confirmation_token), "plant-1")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidToken));
    assert_eq!(err.kind(), ErrorKind::Security);
}

#[test]
fn handoff_of_unvisited_container_after_stop_is_invalid() {
    let h = harness();
    let session = start(&h, &["A", "B"]);
    visit(&h, &session, "A");
    h.coordinator
        .stop_collection(&h.driver, &session.id, None)
        .unwrap();

    let err = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::DriverToIncinerator,
            plant(),
            containers(&["B"]),
        )
        .unwrap_err();
    match err {
        Error::InvalidContainers(refs) => assert_eq!(refs, vec!["B".to_string()]),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn concurrent_receiver_confirmations_complete_once() {
    let h = harness();
    let session = start(&h, &["A"]);
    visit(&h, &session, "A");
    let issued = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::FacilityToDriver,
            plant(),
            None,
        )
        .unwrap();
    h.coordinator
        .confirm_handoff(&issued.handoff.id, None, "clinic-9")
        .unwrap();

    let (a, b) = std::thread::scope(|scope| {
        let confirm = || {
            h.coordinator.confirm_handoff(
                &issued.handoff.id,
                Some(&issued.confirmation_token),
                "plant-1",
            )
        };
        let a = scope.spawn(confirm);
        let b = scope.spawn(confirm);
        (a.join().unwrap(), b.join().unwrap())
    });

    let outcomes = [a, b];
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Ok(handoff) if handoff.status == HandoffStatus::Completed))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::InvalidToken)))
            .count(),
        1
    );
}

#[test]
fn concurrent_sender_confirmations_tie_break_on_status() {
    let h = harness();
    let session = start(&h, &["A"]);
    visit(&h, &session, "A");
    let issued = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::FacilityToDriver,
            plant(),
            None,
        )
        .unwrap();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    h.coordinator
                        .confirm_handoff(&issued.handoff.id, None, "clinic-9")
                })
            })
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::WrongStatus { .. })))
            .count(),
        3
    );
}

#[test]
fn throttle_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");

    let h = harness_with(SqliteStore::open(&path).unwrap());
    let session = start(&h, &["A"]);
    let fix = LocationFix::new(41.31, 69.28, 3.0);
    assert!(
        h.coordinator
            .record_location(&h.driver, &session.id, &fix)
            .unwrap()
            .accepted
    );
    let now = wastetrail::Clock::now(h.clock.as_ref());
    drop(h);

    let reopened = harness_with(SqliteStore::open(&path).unwrap());
    reopened.clock.set(now + Duration::seconds(3));
    let recorded = reopened
        .coordinator
        .record_location(&reopened.driver, &session.id, &fix)
        .unwrap();
    assert!(!recorded.accepted);
    assert_eq!(recorded.route_points_count, 1);
}

#[test]
fn tampered_trail_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");

    let h = harness_with(SqliteStore::open(&path).unwrap());
    let session = start(&h, &["A", "B"]);
    visit(&h, &session, "A");
    visit(&h, &session, "B");
    drop(h);

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "DROP TRIGGER audit_log_no_update;
         UPDATE audit_log SET actor = 'someone-else' WHERE seq = 2;",
    )
    .unwrap();
    drop(conn);

    let reopened = harness_with(SqliteStore::open(&path).unwrap());
    let report = reopened.coordinator.verify_trail(&session.id).unwrap();
    assert!(!report.intact);
    assert_eq!(report.first_broken, Some(2));
}

#[test]
fn trail_cut_short_after_handoff_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");

    let h = harness_with(SqliteStore::open(&path).unwrap());
    let session = start(&h, &["A"]);
    visit(&h, &session, "A");
    let issued = h
        .coordinator
        .create_handoff(
            &h.driver,
            &session.id,
            HandoffType::FacilityToDriver,
            plant(),
            None,
        )
        .unwrap();
    h.coordinator
        .confirm_handoff(&issued.handoff.id, None, "clinic-9")
        .unwrap();
    h.coordinator
        .confirm_handoff(&issued.handoff.id, Some(&issued.confirmation_token), "plant-1")
        .unwrap();
    let before = h.coordinator.verify_trail(&session.id).unwrap();
    assert!(before.intact);
    assert_eq!(before.entries, 5);
    drop(h);

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "DROP TRIGGER audit_log_no_delete;
         DELETE FROM audit_log WHERE seq = (SELECT MAX(seq) FROM audit_log);",
    )
    .unwrap();
    drop(conn);

    let reopened = harness_with(SqliteStore::open(&path).unwrap());
    let report = reopened.coordinator.verify_trail(&session.id).unwrap();
    assert!(!report.intact);
    assert_eq!(report.entries, 4);
    assert_eq!(report.first_broken, Some(5));

    let summary = reopened.coordinator.session_summary(&session.id).unwrap();
    assert_eq!(summary.handoffs[0].status, HandoffStatus::Completed);
}

#[test]
fn concurrent_writes_to_one_session_all_land() {
    let refs: Vec<String> = (0..32).map(|i| format!("C-{i:02}")).collect();
    let h = harness_over(SqliteStore::open_in_memory().unwrap(), refs.clone());
    let session = h
        .coordinator
        .start_collection(
            &h.driver,
            StartCollection {
                container_refs: refs.iter().map(|r| ContainerRef::new(r.as_str())).collect(),
                ..StartCollection::default()
            },
        )
        .unwrap();
    let fix = LocationFix::new(41.3, 69.2, 5.0);

    let results: Vec<Result<(), Error>> = std::thread::scope(|scope| {
        let handles: Vec<_> = refs
            .iter()
            .map(|r| {
                let (h, session_id, fix) = (&h, &session.id, &fix);
                scope.spawn(move || -> Result<(), Error> {
                    h.coordinator.mark_visited(
                        &h.driver,
                        session_id,
                        &ContainerRef::new(r.as_str()),
                        Some(1.0),
                    )?;
                    h.coordinator.record_location(&h.driver, session_id, fix)?;
                    Ok(())
                })
            })
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert!(!results
        .iter()
        .any(|r| matches!(r, Err(Error::VersionConflict { .. }))));
    for result in &results {
        assert!(result.is_ok(), "write failed: {result:?}");
    }

    let summary = h.coordinator.session_summary(&session.id).unwrap();
    assert_eq!(summary.visited_containers, 32);
    assert_eq!(summary.total_containers, 32);
    // The clock never moves, so only the first fix is outside the window.
    assert_eq!(summary.session.route.len(), 1);

    let report = h.coordinator.verify_trail(&session.id).unwrap();
    assert!(report.intact);
    assert_eq!(report.entries, 33);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn accepted_fixes_are_spaced_by_the_interval(gaps in prop::collection::vec(0i64..25, 1..40)) {
        let h = harness();
        let session = start(&h, &["A"]);
        let fix = LocationFix::new(41.3, 69.2, 5.0);

        for gap in gaps {
            h.clock.advance(Duration::seconds(gap));
            h.coordinator.record_location(&h.driver, &session.id, &fix).unwrap();
        }

        let route = h.coordinator.session_summary(&session.id).unwrap().session.route;
        prop_assert!(!route.is_empty());
        for pair in route.windows(2) {
            prop_assert!(pair[1].timestamp - pair[0].timestamp >= Duration::seconds(10));
        }
    }
}
