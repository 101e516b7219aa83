//! Error types for wastetrail.
//!
//! Every failure the core can produce is a variant of [`Error`]. Callers
//! that need to decide between retrying, reporting a conflict, or raising a
//! security alert should look at [`Error::kind`] rather than matching on
//! individual variants.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::handoff::{HandoffStatus, HandoffType};

/// The main error type for wastetrail operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Session Errors ===
    /// The driver already has an active collection session.
    #[error("driver {driver_id} already has an active session {session_id}")]
    AlreadyActive {
        /// Driver that tried to start a second session.
        driver_id: String,
        /// The session that is still active.
        session_id: String,
    },

    /// A client-supplied session id is already taken.
    #[error("session {0} already exists")]
    SessionExists(String),

    /// No session with this id exists (or the driver has no active one).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session has been stopped and no longer accepts writes.
    #[error("session {0} is not active")]
    NotActive(String),

    /// The container is not part of the session's selection.
    #[error("container {container_ref} is not part of session {session_id}")]
    UnknownContainer {
        /// The session that was addressed.
        session_id: String,
        /// The container that is not in its selection.
        container_ref: String,
    },

    /// The container registry does not know this container.
    #[error("container {0} is not registered")]
    InvalidContainer(String),

    /// The driver tried to act on a session that belongs to someone else.
    #[error("session {session_id} does not belong to driver {driver_id}")]
    NotOwner {
        /// The session that was addressed.
        session_id: String,
        /// The driver making the request.
        driver_id: String,
    },

    // === Handoff Errors ===
    /// No handoff with this id exists.
    #[error("handoff not found: {0}")]
    HandoffNotFound(String),

    /// The session already has a handoff of this type.
    #[error("session {session_id} already has a {handoff_type} handoff")]
    DuplicateType {
        /// The owning session.
        session_id: String,
        /// The handoff type that already exists.
        handoff_type: HandoffType,
    },

    /// The previous custody stage has not been completed yet.
    #[error("cannot create {handoff_type} handoff: {required} handoff is not completed")]
    PriorStageIncomplete {
        /// The handoff type that was requested.
        handoff_type: HandoffType,
        /// The handoff type that must be completed first.
        required: HandoffType,
    },

    /// Some listed containers were never visited in the session.
    #[error("containers not visited in session: {}", .0.join(", "))]
    InvalidContainers(Vec<String>),

    /// A container list was empty where at least one entry is required.
    #[error("container list is empty")]
    EmptyContainers,

    /// The handoff is not in a status that allows the requested transition.
    #[error("handoff {handoff_id} is {actual}, expected {expected}")]
    WrongStatus {
        /// The handoff that was addressed.
        handoff_id: String,
        /// The status the transition requires.
        expected: HandoffStatus,
        /// The status the handoff is actually in.
        actual: HandoffStatus,
    },

    /// The confirmation token is unknown, wrong, or already consumed.
    #[error("invalid or already used confirmation token")]
    InvalidToken,

    // === Validation Errors ===
    /// A location fix failed plausibility checks.
    #[error("invalid location fix: {reason}")]
    InvalidFix {
        /// Which check failed.
        reason: String,
    },

    /// The handoff receiver is malformed.
    #[error("invalid receiver: {reason}")]
    InvalidReceiver {
        /// Why the receiver was rejected.
        reason: String,
    },

    /// A generic request validation failure.
    #[error("invalid request: {0}")]
    Validation(String),

    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// The stored record changed underneath us.
    #[error("{record} {id} was modified concurrently (expected version {expected})")]
    VersionConflict {
        /// Record kind ("session" or "handoff").
        record: &'static str,
        /// Record identity.
        id: String,
        /// The version the write was based on.
        expected: i64,
    },

    /// The persistence layer is temporarily unavailable; the call may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for wastetrail operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`] for callers and transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller raced or retried; do not retry automatically.
    Conflict,
    /// The addressed record does not exist.
    NotFound,
    /// The request was rejected before any state mutation.
    Validation,
    /// The caller may not act on this record.
    Forbidden,
    /// Token failures; repeated occurrences may indicate leakage or replay.
    Security,
    /// Transient persistence failure; the whole call may be retried.
    Unavailable,
    /// Configuration, I/O, or programming errors.
    Internal,
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::Unavailable(err.to_string())
            }
            _ => Self::DatabaseQuery(err),
        }
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a location fix validation error.
    #[must_use]
    pub fn invalid_fix(reason: impl Into<String>) -> Self {
        Self::InvalidFix {
            reason: reason.into(),
        }
    }

    /// Create a receiver validation error.
    #[must_use]
    pub fn invalid_receiver(reason: impl Into<String>) -> Self {
        Self::InvalidReceiver {
            reason: reason.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyActive { .. }
            | Self::SessionExists(_)
            | Self::NotActive(_)
            | Self::DuplicateType { .. }
            | Self::PriorStageIncomplete { .. }
            | Self::WrongStatus { .. }
            | Self::VersionConflict { .. } => ErrorKind::Conflict,
            Self::SessionNotFound(_) | Self::HandoffNotFound(_) | Self::UnknownContainer { .. } => {
                ErrorKind::NotFound
            }
            Self::InvalidContainer(_)
            | Self::InvalidContainers(_)
            | Self::EmptyContainers
            | Self::InvalidFix { .. }
            | Self::InvalidReceiver { .. }
            | Self::Validation(_) => ErrorKind::Validation,
            Self::NotOwner { .. } => ErrorKind::Forbidden,
            Self::InvalidToken => ErrorKind::Security,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::DatabaseOpen { .. }
            | Self::DatabaseQuery(_)
            | Self::DatabaseMigration { .. }
            | Self::ConfigLoad(_)
            | Self::ConfigValidation { .. }
            | Self::Io(_)
            | Self::DirectoryCreate { .. }
            | Self::Json(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the whole call may be retried verbatim.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    /// Check if this error is a conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}
