//! The caller-facing surface.
//!
//! [`CollectionCoordinator`] owns no state of its own. It checks that a
//! driver only touches their own sessions, delegates to the session store,
//! location ingestor, and handoff chain, and announces committed changes as
//! [`DomainEvent`]s.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audit::{self, AuditEntry, TrailReport};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{DomainEvent, EventPublisher};
use crate::handoff::{
    ConfirmationToken, Handoff, HandoffChain, HandoffContainer, HandoffType, IssuedHandoff,
    Receiver,
};
use crate::ids::{ContainerRef, DriverId, HandoffId, SessionId};
use crate::location::{LocationFix, LocationIngestor};
use crate::locks::LockTable;
use crate::registry::ContainerRegistry;
use crate::session::{GeoPoint, NewSession, Session, SessionStore};
use crate::storage::RecordStore;

/// A request to start collecting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartCollection {
    /// Client-generated session id, for safe retries from the device.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Containers to collect.
    pub container_refs: Vec<ContainerRef>,
    /// Where the run starts.
    #[serde(default)]
    pub start_location: Option<GeoPoint>,
}

/// Reply to a location report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordedLocation {
    /// Whether the fix was stored.
    pub accepted: bool,
    /// Route length after handling the fix.
    pub route_points_count: usize,
}

/// Everything a client needs to render a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// The session.
    pub session: Session,
    /// Its handoffs, oldest first.
    pub handoffs: Vec<Handoff>,
    /// Number of visited containers.
    pub visited_containers: usize,
    /// Number of selected containers.
    pub total_containers: usize,
}

/// Orchestrates sessions, location tracking, and custody handoffs.
#[derive(Debug)]
pub struct CollectionCoordinator {
    records: Arc<dyn RecordStore>,
    sessions: Arc<SessionStore>,
    ingestor: LocationIngestor,
    handoffs: HandoffChain,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl CollectionCoordinator {
    /// Wire up the components over shared collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the configuration is invalid.
    pub fn new(
        records: Arc<dyn RecordStore>,
        registry: Arc<dyn ContainerRegistry>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;

        let locks = Arc::new(LockTable::new());
        let sessions = Arc::new(SessionStore::new(
            records.clone(),
            registry,
            clock.clone(),
            locks.clone(),
        ));
        let ingestor = LocationIngestor::new(sessions.clone(), config.min_fix_interval());
        let handoffs = HandoffChain::new(records.clone(), clock.clone(), locks, &config.handoff)?;

        Ok(Self {
            records,
            sessions,
            ingestor,
            handoffs,
            events,
            clock,
        })
    }

    /// Start a collection run for `driver_id`.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::create_session`].
    pub fn start_collection(
        &self,
        driver_id: &DriverId,
        request: StartCollection,
    ) -> Result<Session> {
        let session = self.sessions.create_session(NewSession {
            session_id: request.session_id,
            driver_id: driver_id.clone(),
            container_refs: request.container_refs,
            start_location: request.start_location,
        })?;

        self.publish(DomainEvent::SessionStarted {
            session_id: session.id.clone(),
            driver_id: session.driver_id.clone(),
            containers: session.selected_containers.len(),
            at: session.start_time,
        });
        Ok(session)
    }

    /// Stop the driver's session.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`] if the session belongs to another driver, plus
    /// the errors of [`SessionStore::stop_session`].
    pub fn stop_collection(
        &self,
        driver_id: &DriverId,
        session_id: &SessionId,
        end_location: Option<GeoPoint>,
    ) -> Result<Session> {
        self.owned_session(driver_id, session_id)?;
        let session = self.sessions.stop_session(session_id, end_location)?;

        self.publish(DomainEvent::SessionStopped {
            session_id: session.id.clone(),
            driver_id: session.driver_id.clone(),
            visited: session.visited_count(),
            total: session.selected_containers.len(),
            at: session.end_time.unwrap_or_else(|| self.clock.now()),
        });
        Ok(session)
    }

    /// Report a GPS fix for the driver's session.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`], [`Error::InvalidFix`], [`Error::NotActive`].
    pub fn record_location(
        &self,
        driver_id: &DriverId,
        session_id: &SessionId,
        fix: &LocationFix,
    ) -> Result<RecordedLocation> {
        self.owned_session(driver_id, session_id)?;
        let outcome = self.ingestor.accept(session_id, fix)?;
        Ok(RecordedLocation {
            accepted: outcome.is_accepted(),
            route_points_count: outcome.route_points(),
        })
    }

    /// Mark a container collected. Repeating the call changes nothing.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`], plus the errors of [`SessionStore::mark_visited`].
    pub fn mark_visited(
        &self,
        driver_id: &DriverId,
        session_id: &SessionId,
        container_ref: &ContainerRef,
        collected_weight: Option<f64>,
    ) -> Result<Session> {
        self.owned_session(driver_id, session_id)?;
        let (session, changed) =
            self.sessions
                .mark_visited_tracked(session_id, container_ref, collected_weight)?;

        if changed {
            let at = session
                .container(container_ref)
                .and_then(|c| c.visited_at)
                .unwrap_or_else(|| self.clock.now());
            self.publish(DomainEvent::ContainerVisited {
                session_id: session_id.clone(),
                container_ref: container_ref.clone(),
                at,
            });
        }
        Ok(session)
    }

    /// Open a handoff for the driver's session.
    ///
    /// Without an explicit container list, the session's visited containers
    /// are handed off, each declared at its collected weight.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`], [`Error::EmptyContainers`] if nothing has been
    /// visited, plus the errors of [`HandoffChain::create`].
    pub fn create_handoff(
        &self,
        driver_id: &DriverId,
        session_id: &SessionId,
        handoff_type: HandoffType,
        receiver: Receiver,
        containers: Option<Vec<HandoffContainer>>,
    ) -> Result<IssuedHandoff> {
        let session = self.owned_session(driver_id, session_id)?;
        let containers = match containers {
            Some(list) => list,
            None => visited_containers(&session),
        };

        let issued = self.handoffs.create(
            session_id,
            handoff_type,
            containers,
            receiver,
            driver_id.as_str(),
        )?;

        self.publish(DomainEvent::HandoffCreated {
            handoff_id: issued.handoff.id.clone(),
            session_id: session_id.clone(),
            handoff_type,
            at: issued.handoff.created_at,
        });
        Ok(issued)
    }

    /// Advance a handoff.
    ///
    /// Without a token this is the sender's confirmation; with a token it
    /// is the receiver accepting custody.
    ///
    /// # Errors
    ///
    /// See [`HandoffChain::confirm_by_sender`] and
    /// [`HandoffChain::confirm_by_receiver`].
    pub fn confirm_handoff(
        &self,
        handoff_id: &HandoffId,
        token: Option<&ConfirmationToken>,
        actor: &str,
    ) -> Result<Handoff> {
        let handoff = match token {
            None => {
                let handoff = self.handoffs.confirm_by_sender(handoff_id, actor)?;
                self.publish(DomainEvent::HandoffSenderConfirmed {
                    handoff_id: handoff.id.clone(),
                    session_id: handoff.session_id.clone(),
                    handoff_type: handoff.handoff_type,
                    at: handoff.sender_confirmed_at.unwrap_or_else(|| self.clock.now()),
                });
                handoff
            }
            Some(token) => {
                let handoff = self.handoffs.confirm_by_receiver(handoff_id, token)?;
                self.publish(DomainEvent::HandoffCompleted {
                    handoff_id: handoff.id.clone(),
                    session_id: handoff.session_id.clone(),
                    handoff_type: handoff.handoff_type,
                    at: handoff.completed_at.unwrap_or_else(|| self.clock.now()),
                });
                handoff
            }
        };
        Ok(handoff)
    }

    /// Refuse a pending handoff.
    ///
    /// # Errors
    ///
    /// See [`HandoffChain::reject`].
    pub fn reject_handoff(
        &self,
        handoff_id: &HandoffId,
        reason: &str,
        actor: &str,
    ) -> Result<Handoff> {
        let handoff = self.handoffs.reject(handoff_id, reason, actor)?;
        self.publish(DomainEvent::HandoffRejected {
            handoff_id: handoff.id.clone(),
            session_id: handoff.session_id.clone(),
            handoff_type: handoff.handoff_type,
            reason: handoff.rejection_reason.clone().unwrap_or_default(),
            at: handoff.rejected_at.unwrap_or_else(|| self.clock.now()),
        });
        Ok(handoff)
    }

    /// The driver's active session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if there is none.
    pub fn active_session(&self, driver_id: &DriverId) -> Result<Session> {
        self.sessions.get_active(driver_id)
    }

    /// Session plus handoffs, for client polling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session does not exist.
    pub fn session_summary(&self, session_id: &SessionId) -> Result<SessionSummary> {
        let session = self.sessions.get(session_id)?;
        let handoffs = self.handoffs.for_session(session_id)?;
        Ok(SessionSummary {
            visited_containers: session.visited_count(),
            total_containers: session.selected_containers.len(),
            session,
            handoffs,
        })
    }

    /// Look up a handoff from its confirmation token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] for an unknown token.
    pub fn lookup_handoff_by_token(&self, token: &ConfirmationToken) -> Result<Handoff> {
        self.handoffs.lookup_by_token(token)
    }

    /// The session's custody trail, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session does not exist.
    pub fn audit_trail(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>> {
        self.sessions.get(session_id)?;
        self.records.audit_trail(session_id)
    }

    /// Recompute the session's trail hashes and check the trail still ends
    /// at the head recorded on the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session does not exist.
    pub fn verify_trail(&self, session_id: &SessionId) -> Result<TrailReport> {
        let trail = self.audit_trail(session_id)?;
        let head = self.records.audit_head(session_id)?;
        let report = audit::verify_against(&trail, head.as_ref())?;
        if !report.intact {
            warn!(
                target: crate::logging::SECURITY_TARGET,
                %session_id,
                first_broken = report.first_broken,
                "Custody trail failed verification"
            );
        }
        Ok(report)
    }

    fn owned_session(&self, driver_id: &DriverId, session_id: &SessionId) -> Result<Session> {
        let session = self.sessions.get(session_id)?;
        if &session.driver_id != driver_id {
            return Err(Error::NotOwner {
                session_id: session_id.to_string(),
                driver_id: driver_id.to_string(),
            });
        }
        Ok(session)
    }

    fn publish(&self, event: DomainEvent) {
        let name = event.name();
        if let Err(e) = self.events.publish(event) {
            warn!(event = name, error = %e, "Failed to publish domain event");
        }
    }
}

/// The visited set as handoff entries, in selection order.
fn visited_containers(session: &Session) -> Vec<HandoffContainer> {
    session
        .visited()
        .map(|c| HandoffContainer {
            container_ref: c.container_ref.clone(),
            declared_weight: c.collected_weight,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{channel, ChannelPublisher};
    use crate::handoff::HandoffStatus;
    use crate::registry::StaticRegistry;
    use crate::storage::SqliteStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        coordinator: CollectionCoordinator,
        events: UnboundedReceiver<DomainEvent>,
        driver: DriverId,
    }

    fn fixture() -> Fixture {
        let (publisher, events): (ChannelPublisher, _) = channel();
        let coordinator = CollectionCoordinator::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(StaticRegistry::with_containers("clinic", ["A", "B"])),
            Arc::new(ManualClock::default()),
            Arc::new(publisher),
            &Config::default(),
        )
        .unwrap();
        Fixture {
            coordinator,
            events,
            driver: DriverId::new("d-1"),
        }
    }

    fn start(f: &Fixture) -> Session {
        f.coordinator
            .start_collection(
                &f.driver,
                StartCollection {
                    container_refs: vec![ContainerRef::from("A"), ContainerRef::from("B")],
                    ..StartCollection::default()
                },
            )
            .unwrap()
    }

    fn drain(f: &mut Fixture) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            names.push(event.name());
        }
        names
    }

    fn plant() -> Receiver {
        Receiver::IncinerationPlant {
            plant_id: "plant-1".to_string(),
        }
    }

    #[test]
    fn test_other_driver_is_refused() {
        let f = fixture();
        let session = start(&f);
        let intruder = DriverId::new("d-2");

        assert!(matches!(
            f.coordinator.stop_collection(&intruder, &session.id, None),
            Err(Error::NotOwner { .. })
        ));
        assert!(matches!(
            f.coordinator
                .record_location(&intruder, &session.id, &LocationFix::new(0.0, 0.0, 1.0)),
            Err(Error::NotOwner { .. })
        ));
        assert!(matches!(
            f.coordinator
                .mark_visited(&intruder, &session.id, &ContainerRef::from("A"), None),
            Err(Error::NotOwner { .. })
        ));
        assert!(matches!(
            f.coordinator.create_handoff(
                &intruder,
                &session.id,
                HandoffType::FacilityToDriver,
                plant(),
                None
            ),
            Err(Error::NotOwner { .. })
        ));
    }

    #[test]
    fn test_record_location_reports_count() {
        let f = fixture();
        let session = start(&f);
        let fix = LocationFix::new(41.3, 69.2, 4.0);

        let first = f
            .coordinator
            .record_location(&f.driver, &session.id, &fix)
            .unwrap();
        assert_eq!(
            first,
            RecordedLocation {
                accepted: true,
                route_points_count: 1
            }
        );
        let second = f
            .coordinator
            .record_location(&f.driver, &session.id, &fix)
            .unwrap();
        assert!(!second.accepted);
        assert_eq!(second.route_points_count, 1);
    }

    #[test]
    fn test_handoff_defaults_to_visited_set() {
        let f = fixture();
        let session = start(&f);
        f.coordinator
            .mark_visited(&f.driver, &session.id, &ContainerRef::from("B"), Some(4.5))
            .unwrap();

        let issued = f
            .coordinator
            .create_handoff(
                &f.driver,
                &session.id,
                HandoffType::FacilityToDriver,
                plant(),
                None,
            )
            .unwrap();
        assert_eq!(issued.handoff.total_containers, 1);
        assert_eq!(issued.handoff.containers[0].container_ref.as_str(), "B");
        assert_eq!(issued.handoff.containers[0].declared_weight, Some(4.5));
    }

    #[test]
    fn test_handoff_with_nothing_visited_is_empty() {
        let f = fixture();
        let session = start(&f);
        assert!(matches!(
            f.coordinator.create_handoff(
                &f.driver,
                &session.id,
                HandoffType::FacilityToDriver,
                plant(),
                None
            ),
            Err(Error::EmptyContainers)
        ));
    }

    #[test]
    fn test_events_follow_commits() {
        let mut f = fixture();
        let session = start(&f);
        let a = ContainerRef::from("A");
        f.coordinator
            .mark_visited(&f.driver, &session.id, &a, None)
            .unwrap();
        // Repeat visit is not announced again.
        f.coordinator
            .mark_visited(&f.driver, &session.id, &a, None)
            .unwrap();

        let issued = f
            .coordinator
            .create_handoff(
                &f.driver,
                &session.id,
                HandoffType::FacilityToDriver,
                plant(),
                None,
            )
            .unwrap();
        let id = issued.handoff.id.clone();
        f.coordinator.confirm_handoff(&id, None, "clinic").unwrap();
        let done = f
            .coordinator
            .confirm_handoff(&id, Some(&issued.confirmation_token), "plant-1")
            .unwrap();
        assert_eq!(done.status, HandoffStatus::Completed);

        // Failed calls publish nothing.
        assert!(f
            .coordinator
            .confirm_handoff(&id, Some(&issued.confirmation_token), "plant-1")
            .is_err());

        f.coordinator
            .stop_collection(&f.driver, &session.id, None)
            .unwrap();

        assert_eq!(
            drain(&mut f),
            vec![
                "session.started",
                "container.visited",
                "handoff.created",
                "handoff.sender_confirmed",
                "handoff.completed",
                "session.stopped",
            ]
        );
    }

    #[test]
    fn test_publish_failure_does_not_fail_the_call() {
        let mut f = fixture();
        // Closing the receiver makes every publish fail.
        f.events.close();
        let session = start(&f);
        assert!(session.is_active());
        assert!(f.coordinator.active_session(&f.driver).is_ok());
    }

    #[test]
    fn test_summary_and_trail() {
        let f = fixture();
        let session = start(&f);
        f.coordinator
            .mark_visited(&f.driver, &session.id, &ContainerRef::from("A"), None)
            .unwrap();
        let issued = f
            .coordinator
            .create_handoff(
                &f.driver,
                &session.id,
                HandoffType::FacilityToDriver,
                plant(),
                None,
            )
            .unwrap();
        f.coordinator
            .reject_handoff(&issued.handoff.id, "wrong containers", "clinic")
            .unwrap();

        let summary = f.coordinator.session_summary(&session.id).unwrap();
        assert_eq!(summary.visited_containers, 1);
        assert_eq!(summary.total_containers, 2);
        assert_eq!(summary.handoffs.len(), 1);
        assert_eq!(summary.handoffs[0].status, HandoffStatus::Rejected);

        let report = f.coordinator.verify_trail(&session.id).unwrap();
        assert!(report.intact);
        assert_eq!(report.entries, 4);

        assert!(matches!(
            f.coordinator.audit_trail(&SessionId::new("missing")),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_summary_never_exposes_token() {
        let f = fixture();
        let session = start(&f);
        f.coordinator
            .mark_visited(&f.driver, &session.id, &ContainerRef::from("A"), None)
            .unwrap();
        let issued = f
            .coordinator
            .create_handoff(
                &f.driver,
                &session.id,
                HandoffType::FacilityToDriver,
                plant(),
                None,
            )
            .unwrap();

        let summary = f.coordinator.session_summary(&session.id).unwrap();
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains(issued.confirmation_token.expose()));
        assert!(!json.contains(&issued.handoff.seal.digest));
    }
}
