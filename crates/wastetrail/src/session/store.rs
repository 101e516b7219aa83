//! Session lifecycle operations.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{AuditAction, AuditDraft};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ids::{ContainerRef, DriverId, SessionId};
use crate::locks::LockTable;
use crate::registry::ContainerRegistry;
use crate::storage::{RecordStore, WriteBatch};

use super::{
    GeoPoint, HandoffState, RoutePoint, SelectedContainer, Session, SessionStatus,
};

/// Parameters for starting a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Client-generated id; a fresh one is generated when absent.
    pub session_id: Option<SessionId>,
    /// Owning driver.
    pub driver_id: DriverId,
    /// Containers to collect. Duplicates collapse to the first occurrence.
    pub container_refs: Vec<ContainerRef>,
    /// Where the driver is starting from.
    pub start_location: Option<GeoPoint>,
}

/// Result of offering a route point to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAppend {
    /// The point was appended and persisted.
    Appended {
        /// Route length after the append.
        route_points: usize,
    },
    /// The point was declined; nothing was written.
    Skipped {
        /// Route length, unchanged.
        route_points: usize,
    },
}

/// Holds session records and enforces one active session per driver.
#[derive(Debug)]
pub struct SessionStore {
    records: Arc<dyn RecordStore>,
    registry: Arc<dyn ContainerRegistry>,
    clock: Arc<dyn Clock>,
    locks: Arc<LockTable>,
}

impl SessionStore {
    /// Create a session store over the given collaborators.
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        registry: Arc<dyn ContainerRegistry>,
        clock: Arc<dyn Clock>,
        locks: Arc<LockTable>,
    ) -> Self {
        Self {
            records,
            registry,
            clock,
            locks,
        }
    }

    /// Start a session for a driver.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyContainers`] if no containers are given.
    /// - [`Error::InvalidContainer`] if the registry does not know a container.
    /// - [`Error::InvalidFix`] if the start location is out of range.
    /// - [`Error::AlreadyActive`] if the driver already has an active session.
    /// - [`Error::SessionExists`] if a supplied session id is taken.
    ///
    /// Not safe to retry blindly: after an [`Error::Unavailable`], check
    /// [`SessionStore::get_active`] before trying again.
    pub fn create_session(&self, request: NewSession) -> Result<Session> {
        let NewSession {
            session_id,
            driver_id,
            container_refs,
            start_location,
        } = request;

        if container_refs.is_empty() {
            return Err(Error::EmptyContainers);
        }
        if let Some(point) = &start_location {
            point.validate()?;
        }

        let mut seen = HashSet::new();
        let mut selected = Vec::with_capacity(container_refs.len());
        for container_ref in container_refs {
            if !seen.insert(container_ref.clone()) {
                continue;
            }
            let info = self
                .registry
                .lookup(&container_ref)?
                .ok_or_else(|| Error::InvalidContainer(container_ref.to_string()))?;
            selected.push(SelectedContainer {
                container_ref,
                company_id: Some(info.company_id),
                visited: false,
                visited_at: None,
                collected_weight: None,
            });
        }

        let _guard = self.locks.driver(&driver_id);

        if let Some(active) = self.records.active_session(&driver_id)? {
            return Err(Error::AlreadyActive {
                driver_id: driver_id.to_string(),
                session_id: active.id.to_string(),
            });
        }

        let now = self.clock.now();
        let session = Session {
            id: session_id.unwrap_or_else(SessionId::generate),
            driver_id,
            status: SessionStatus::Active,
            start_time: now,
            end_time: None,
            start_location,
            end_location: None,
            selected_containers: selected,
            route: Vec::new(),
            handoff_state: HandoffState::default(),
            version: 1,
        };

        let containers: Vec<&str> = session
            .selected_containers
            .iter()
            .map(|c| c.container_ref.as_str())
            .collect();
        let audit = AuditDraft::session(
            &session.id,
            AuditAction::SessionStarted,
            session.driver_id.as_str(),
            now,
        )
        .with_detail(json!({ "containers": containers }));

        self.records
            .commit(WriteBatch::new().insert_session(session.clone()).audit(audit))?;

        info!(
            session_id = %session.id,
            driver_id = %session.driver_id,
            containers = session.selected_containers.len(),
            "Collection session started"
        );
        Ok(session)
    }

    /// Load any session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if it does not exist.
    pub fn get(&self, session_id: &SessionId) -> Result<Session> {
        self.records
            .session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Load the driver's active session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the driver has none.
    pub fn get_active(&self, driver_id: &DriverId) -> Result<Session> {
        self.records
            .active_session(driver_id)?
            .ok_or_else(|| Error::SessionNotFound(format!("no active session for {driver_id}")))
    }

    /// Mark a container as collected. Marking it again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if the session does not exist.
    /// - [`Error::NotActive`] if it has been stopped.
    /// - [`Error::UnknownContainer`] if the container is not in its selection.
    /// - [`Error::Validation`] if the weight is negative or not finite.
    pub fn mark_visited(
        &self,
        session_id: &SessionId,
        container_ref: &ContainerRef,
        collected_weight: Option<f64>,
    ) -> Result<Session> {
        self.mark_visited_tracked(session_id, container_ref, collected_weight)
            .map(|(session, _)| session)
    }

    /// Like [`SessionStore::mark_visited`], also reporting whether this call
    /// changed anything.
    pub(crate) fn mark_visited_tracked(
        &self,
        session_id: &SessionId,
        container_ref: &ContainerRef,
        collected_weight: Option<f64>,
    ) -> Result<(Session, bool)> {
        if let Some(weight) = collected_weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Validation(format!(
                    "collected weight {weight} must be a non-negative number"
                )));
            }
        }

        let _guard = self.locks.session(session_id);
        let mut session = self.get(session_id)?;
        if !session.is_active() {
            return Err(Error::NotActive(session_id.to_string()));
        }

        let now = self.clock.now();
        let container = session
            .selected_containers
            .iter_mut()
            .find(|c| &c.container_ref == container_ref)
            .ok_or_else(|| Error::UnknownContainer {
                session_id: session_id.to_string(),
                container_ref: container_ref.to_string(),
            })?;

        if container.visited {
            debug!(%session_id, %container_ref, "Container already visited");
            return Ok((session, false));
        }

        container.visited = true;
        container.visited_at = Some(now);
        container.collected_weight = collected_weight;
        session.version += 1;

        let audit = AuditDraft::session(
            session_id,
            AuditAction::ContainerVisited,
            session.driver_id.as_str(),
            now,
        )
        .with_detail(json!({
            "container_ref": container_ref.as_str(),
            "collected_weight": collected_weight,
        }));

        self.records
            .commit(WriteBatch::new().update_session(session.clone()).audit(audit))?;

        info!(
            %session_id,
            %container_ref,
            visited = session.visited_count(),
            total = session.selected_containers.len(),
            "Container visited"
        );
        Ok((session, true))
    }

    /// Stop a session. From here on it rejects visit and location writes.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if the session does not exist.
    /// - [`Error::NotActive`] if it was already stopped.
    /// - [`Error::InvalidFix`] if the end location is out of range.
    pub fn stop_session(
        &self,
        session_id: &SessionId,
        end_location: Option<GeoPoint>,
    ) -> Result<Session> {
        if let Some(point) = &end_location {
            point.validate()?;
        }

        let _guard = self.locks.session(session_id);
        let mut session = self.get(session_id)?;
        if !session.is_active() {
            return Err(Error::NotActive(session_id.to_string()));
        }

        let now = self.clock.now();
        session.status = SessionStatus::Completed;
        session.end_time = Some(now);
        session.end_location = end_location;
        session.version += 1;

        let audit = AuditDraft::session(
            session_id,
            AuditAction::SessionStopped,
            session.driver_id.as_str(),
            now,
        )
        .with_detail(json!({
            "visited": session.visited_count(),
            "total": session.selected_containers.len(),
            "route_points": session.route.len(),
        }));

        self.records
            .commit(WriteBatch::new().update_session(session.clone()).audit(audit))?;

        info!(
            %session_id,
            visited = session.visited_count(),
            total = session.selected_containers.len(),
            "Collection session stopped"
        );
        Ok(session)
    }

    /// Offer a route point to an active session.
    ///
    /// `admit` runs under the session lock with the current session and the
    /// current time, and returns the point to append or `None` to decline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] or [`Error::NotActive`].
    pub(crate) fn append_route_point<F>(&self, session_id: &SessionId, admit: F) -> Result<RouteAppend>
    where
        F: FnOnce(&Session, DateTime<Utc>) -> Option<RoutePoint>,
    {
        let _guard = self.locks.session(session_id);
        let mut session = self.get(session_id)?;
        if !session.is_active() {
            return Err(Error::NotActive(session_id.to_string()));
        }

        let Some(point) = admit(&session, self.clock.now()) else {
            return Ok(RouteAppend::Skipped {
                route_points: session.route.len(),
            });
        };

        session.route.push(point);
        session.version += 1;
        self.records
            .commit(WriteBatch::new().update_session(session.clone()))?;

        Ok(RouteAppend::Appended {
            route_points: session.route.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::StaticRegistry;
    use crate::storage::SqliteStore;

    struct Fixture {
        store: SessionStore,
        records: Arc<SqliteStore>,
    }

    fn fixture() -> Fixture {
        let records = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = Arc::new(StaticRegistry::with_containers("clinic", ["A", "B", "C"]));
        let store = SessionStore::new(
            records.clone(),
            registry,
            Arc::new(ManualClock::default()),
            Arc::new(LockTable::new()),
        );
        Fixture { store, records }
    }

    fn start(store: &SessionStore, driver: &str, refs: &[&str]) -> Result<Session> {
        store.create_session(NewSession {
            session_id: None,
            driver_id: DriverId::new(driver),
            container_refs: refs.iter().map(|r| ContainerRef::from(*r)).collect(),
            start_location: None,
        })
    }

    #[test]
    fn test_create_session() {
        let f = fixture();
        let session = start(&f.store, "d-1", &["A", "B"]).unwrap();

        assert!(session.is_active());
        assert_eq!(session.selected_containers.len(), 2);
        assert_eq!(
            session.selected_containers[0].company_id.as_deref(),
            Some("clinic")
        );
        assert_eq!(session.version, 1);
        assert_eq!(
            f.store.get_active(&DriverId::new("d-1")).unwrap().id,
            session.id
        );
    }

    #[test]
    fn test_create_session_dedupes_containers() {
        let f = fixture();
        let session = start(&f.store, "d-1", &["B", "A", "B"]).unwrap();
        let refs: Vec<&str> = session
            .selected_containers
            .iter()
            .map(|c| c.container_ref.as_str())
            .collect();
        assert_eq!(refs, vec!["B", "A"]);
    }

    #[test]
    fn test_create_session_rejects_empty() {
        let f = fixture();
        assert!(matches!(
            start(&f.store, "d-1", &[]),
            Err(Error::EmptyContainers)
        ));
    }

    #[test]
    fn test_create_session_rejects_unknown_container() {
        let f = fixture();
        let err = start(&f.store, "d-1", &["A", "Z"]).unwrap_err();
        assert!(matches!(err, Error::InvalidContainer(ref r) if r == "Z"));
        assert!(f.store.get_active(&DriverId::new("d-1")).is_err());
    }

    #[test]
    fn test_create_session_rejects_second_active() {
        let f = fixture();
        let first = start(&f.store, "d-1", &["A"]).unwrap();
        let err = start(&f.store, "d-1", &["B"]).unwrap_err();
        match err {
            Error::AlreadyActive { session_id, .. } => assert_eq!(session_id, first.id.as_str()),
            other => panic!("unexpected error: {other:?}"),
        }

        // Another driver is unaffected.
        assert!(start(&f.store, "d-2", &["B"]).is_ok());
    }

    #[test]
    fn test_new_session_after_stop() {
        let f = fixture();
        let first = start(&f.store, "d-1", &["A"]).unwrap();
        f.store.stop_session(&first.id, None).unwrap();

        let second = start(&f.store, "d-1", &["A"]).unwrap();
        assert_ne!(first.id, second.id);
        // The old session is kept, frozen.
        assert_eq!(
            f.store.get(&first.id).unwrap().status,
            SessionStatus::Completed
        );
    }

    #[test]
    fn test_client_supplied_id() {
        let f = fixture();
        let session = f
            .store
            .create_session(NewSession {
                session_id: Some(SessionId::new("client-42")),
                driver_id: DriverId::new("d-1"),
                container_refs: vec![ContainerRef::from("A")],
                start_location: Some(GeoPoint::new(41.3, 69.2)),
            })
            .unwrap();
        assert_eq!(session.id.as_str(), "client-42");
        assert_eq!(session.start_location, Some(GeoPoint::new(41.3, 69.2)));
    }

    #[test]
    fn test_mark_visited_is_idempotent() {
        let f = fixture();
        let session = start(&f.store, "d-1", &["A", "B"]).unwrap();
        let a = ContainerRef::from("A");

        let (once, changed) = f.store.mark_visited_tracked(&session.id, &a, Some(3.0)).unwrap();
        assert!(changed);
        let (twice, changed) = f.store.mark_visited_tracked(&session.id, &a, Some(9.0)).unwrap();
        assert!(!changed);

        assert_eq!(once, twice);
        assert_eq!(twice.visited_count(), 1);
        assert_eq!(twice.container(&a).unwrap().collected_weight, Some(3.0));
        assert_eq!(twice.selected_containers.len(), 2);

        // Only one visit reached the audit trail.
        let trail = f.records.audit_trail(&session.id).unwrap();
        let visits = trail
            .iter()
            .filter(|e| e.draft.action == AuditAction::ContainerVisited)
            .count();
        assert_eq!(visits, 1);
    }

    #[test]
    fn test_mark_visited_errors() {
        let f = fixture();
        let session = start(&f.store, "d-1", &["A"]).unwrap();

        assert!(matches!(
            f.store
                .mark_visited(&session.id, &ContainerRef::from("B"), None),
            Err(Error::UnknownContainer { .. })
        ));
        assert!(matches!(
            f.store
                .mark_visited(&SessionId::new("nope"), &ContainerRef::from("A"), None),
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            f.store
                .mark_visited(&session.id, &ContainerRef::from("A"), Some(-1.0)),
            Err(Error::Validation(_))
        ));

        f.store.stop_session(&session.id, None).unwrap();
        assert!(matches!(
            f.store
                .mark_visited(&session.id, &ContainerRef::from("A"), None),
            Err(Error::NotActive(_))
        ));
    }

    #[test]
    fn test_stop_session() {
        let f = fixture();
        let session = start(&f.store, "d-1", &["A"]).unwrap();
        let stopped = f
            .store
            .stop_session(&session.id, Some(GeoPoint::new(1.0, 2.0)))
            .unwrap();

        assert_eq!(stopped.status, SessionStatus::Completed);
        assert!(stopped.end_time.is_some());
        assert_eq!(stopped.end_location, Some(GeoPoint::new(1.0, 2.0)));
        assert!(f.store.get_active(&DriverId::new("d-1")).is_err());

        assert!(matches!(
            f.store.stop_session(&session.id, None),
            Err(Error::NotActive(_))
        ));
    }

    #[test]
    fn test_stop_rejects_bad_location_without_stopping() {
        let f = fixture();
        let session = start(&f.store, "d-1", &["A"]).unwrap();
        assert!(f
            .store
            .stop_session(&session.id, Some(GeoPoint::new(100.0, 0.0)))
            .is_err());
        assert!(f.store.get(&session.id).unwrap().is_active());
    }

    #[test]
    fn test_concurrent_starts_yield_one_active_session() {
        let f = fixture();
        let successes = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if start(&f.store, "d-1", &["A"]).is_ok() {
                        successes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(successes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(f.records.stats().unwrap().active_sessions, 1);
    }
}
