//! Domain events.
//!
//! The core announces committed state changes through an [`EventPublisher`].
//! Publishing happens after the commit and never undoes it: a failed publish
//! is logged and the operation still succeeds.
//!
//! For out-of-process delivery (SMS, messaging bots) use [`channel`] to get a
//! [`ChannelPublisher`] and drain the receiving end with [`run_relay`] into
//! an async [`EventSink`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handoff::HandoffType;
use crate::ids::{ContainerRef, DriverId, HandoffId, SessionId};

/// Errors from publishing or delivering events.
#[derive(Debug, Error)]
pub enum EventError {
    /// The relay side of the channel has gone away.
    #[error("event channel closed")]
    ChannelClosed,

    /// A sink could not deliver an event.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Something that happened to a session or handoff.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum DomainEvent {
    /// A driver started collecting.
    #[serde(rename = "session.started")]
    SessionStarted {
        /// The new session.
        session_id: SessionId,
        /// Its driver.
        driver_id: DriverId,
        /// Number of selected containers.
        containers: usize,
        /// Start time.
        at: DateTime<Utc>,
    },
    /// A driver stopped collecting.
    #[serde(rename = "session.stopped")]
    SessionStopped {
        /// The stopped session.
        session_id: SessionId,
        /// Its driver.
        driver_id: DriverId,
        /// Containers visited.
        visited: usize,
        /// Containers selected.
        total: usize,
        /// Stop time.
        at: DateTime<Utc>,
    },
    /// A container was collected.
    #[serde(rename = "container.visited")]
    ContainerVisited {
        /// The session.
        session_id: SessionId,
        /// The container.
        container_ref: ContainerRef,
        /// Visit time.
        at: DateTime<Utc>,
    },
    /// A handoff was opened.
    #[serde(rename = "handoff.created")]
    HandoffCreated {
        /// The handoff.
        handoff_id: HandoffId,
        /// Its session.
        session_id: SessionId,
        /// Which transfer.
        handoff_type: HandoffType,
        /// Creation time.
        at: DateTime<Utc>,
    },
    /// The sender confirmed a handoff.
    #[serde(rename = "handoff.sender_confirmed")]
    HandoffSenderConfirmed {
        /// The handoff.
        handoff_id: HandoffId,
        /// Its session.
        session_id: SessionId,
        /// Which transfer.
        handoff_type: HandoffType,
        /// Confirmation time.
        at: DateTime<Utc>,
    },
    /// The receiver accepted custody.
    #[serde(rename = "handoff.completed")]
    HandoffCompleted {
        /// The handoff.
        handoff_id: HandoffId,
        /// Its session.
        session_id: SessionId,
        /// Which transfer.
        handoff_type: HandoffType,
        /// Completion time.
        at: DateTime<Utc>,
    },
    /// A handoff was refused.
    #[serde(rename = "handoff.rejected")]
    HandoffRejected {
        /// The handoff.
        handoff_id: HandoffId,
        /// Its session.
        session_id: SessionId,
        /// Which transfer.
        handoff_type: HandoffType,
        /// Why.
        reason: String,
        /// Rejection time.
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Dotted event name, e.g. `handoff.completed`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session.started",
            Self::SessionStopped { .. } => "session.stopped",
            Self::ContainerVisited { .. } => "container.visited",
            Self::HandoffCreated { .. } => "handoff.created",
            Self::HandoffSenderConfirmed { .. } => "handoff.sender_confirmed",
            Self::HandoffCompleted { .. } => "handoff.completed",
            Self::HandoffRejected { .. } => "handoff.rejected",
        }
    }

    /// The session the event concerns.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::SessionStopped { session_id, .. }
            | Self::ContainerVisited { session_id, .. }
            | Self::HandoffCreated { session_id, .. }
            | Self::HandoffSenderConfirmed { session_id, .. }
            | Self::HandoffCompleted { session_id, .. }
            | Self::HandoffRejected { session_id, .. } => session_id,
        }
    }
}

/// Receives events from the core, synchronously, after each commit.
pub trait EventPublisher: Send + Sync + std::fmt::Debug {
    /// Hand over one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be accepted. The caller logs
    /// it and moves on.
    fn publish(&self, event: DomainEvent) -> Result<(), EventError>;
}

/// Writes events to the log and nowhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: DomainEvent) -> Result<(), EventError> {
        info!(
            target: "wastetrail::events",
            event = event.name(),
            session_id = %event.session_id(),
            "Domain event"
        );
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: DomainEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::ChannelClosed)
    }
}

/// Create a publisher and the receiver to relay from.
#[must_use]
pub fn channel() -> (ChannelPublisher, mpsc::UnboundedReceiver<DomainEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelPublisher { tx }, rx)
}

/// A downstream consumer such as a notification dispatcher.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed. The relay logs it and continues
    /// with the next event.
    async fn deliver(&self, event: &DomainEvent) -> Result<(), EventError>;
}

/// Counters from a finished relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Events the sink accepted.
    pub delivered: u64,
    /// Events the sink failed on.
    pub failed: u64,
}

/// Drain `rx` into `sink` until every publisher has been dropped.
pub async fn run_relay(
    mut rx: mpsc::UnboundedReceiver<DomainEvent>,
    sink: &dyn EventSink,
) -> RelayStats {
    let mut stats = RelayStats::default();
    while let Some(event) = rx.recv().await {
        match sink.deliver(&event).await {
            Ok(()) => {
                debug!(event = event.name(), "Event delivered");
                stats.delivered += 1;
            }
            Err(e) => {
                warn!(event = event.name(), error = %e, "Event delivery failed");
                stats.failed += 1;
            }
        }
    }
    stats
}
