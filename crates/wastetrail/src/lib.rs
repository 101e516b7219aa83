//! `wastetrail` - Collection sessions and chain-of-custody handoffs for
//! medical-waste containers.
//!
//! A driver starts a collection session over a set of registered containers,
//! reports a throttled stream of GPS fixes while the session is active, and
//! marks containers visited. Custody of what was collected then moves through
//! two confirmed handoffs, facility → driver and driver → incineration plant,
//! each recorded in a hash-chained audit trail.
//!
//! [`CollectionCoordinator`] is the entry point; everything else is a
//! building block it wires together.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handoff;
pub mod ids;
pub mod location;
pub mod locks;
pub mod logging;
pub mod registry;
pub mod session;
pub mod storage;

pub use audit::{AuditAction, AuditEntry, TrailHead, TrailReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{CollectionCoordinator, RecordedLocation, SessionSummary, StartCollection};
pub use error::{Error, ErrorKind, Result};
pub use events::{DomainEvent, EventPublisher, TracingPublisher};
pub use handoff::{
    ConfirmationToken, Handoff, HandoffContainer, HandoffStatus, HandoffType, IssuedHandoff,
    Receiver,
};
pub use ids::{ContainerRef, DriverId, HandoffId, SessionId};
pub use location::{LocationFix, LocationOutcome};
pub use logging::init_logging;
pub use registry::{ContainerRegistry, StaticRegistry};
pub use session::{GeoPoint, HandoffStage, Session, SessionStatus};
pub use storage::{RecordStore, SqliteStore, StorageStats};
