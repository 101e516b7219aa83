//! Persistence boundary.
//!
//! The core reads and writes session, handoff, and audit records only
//! through [`RecordStore`]. Every mutation goes through [`RecordStore::commit`],
//! which applies a whole [`WriteBatch`] atomically before returning, so an
//! accepted call is never lost between accept and persist.

pub mod migrations;
pub mod schema;
mod sqlite;

use crate::audit::{AuditDraft, AuditEntry, TrailHead};
use crate::error::Result;
use crate::handoff::{Handoff, HandoffType};
use crate::ids::{DriverId, HandoffId, SessionId};
use crate::session::Session;

pub use sqlite::{SqliteStore, StorageStats};

/// How a record is written.
#[derive(Debug, Clone)]
pub enum RecordWrite<T> {
    /// Create the record. Fails if its identity is taken.
    Insert(T),
    /// Replace the record. The record's `version` must be exactly one above
    /// the stored version.
    Update(T),
}

/// A set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    /// Session writes.
    pub sessions: Vec<RecordWrite<Session>>,
    /// Handoff writes, applied after sessions.
    pub handoffs: Vec<RecordWrite<Handoff>>,
    /// Audit entries, chained and appended last.
    pub audit: Vec<AuditDraft>,
}

impl WriteBatch {
    /// An empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session insert.
    #[must_use]
    pub fn insert_session(mut self, session: Session) -> Self {
        self.sessions.push(RecordWrite::Insert(session));
        self
    }

    /// Add a session update.
    #[must_use]
    pub fn update_session(mut self, session: Session) -> Self {
        self.sessions.push(RecordWrite::Update(session));
        self
    }

    /// Add a handoff insert.
    #[must_use]
    pub fn insert_handoff(mut self, handoff: Handoff) -> Self {
        self.handoffs.push(RecordWrite::Insert(handoff));
        self
    }

    /// Add a handoff update.
    #[must_use]
    pub fn update_handoff(mut self, handoff: Handoff) -> Self {
        self.handoffs.push(RecordWrite::Update(handoff));
        self
    }

    /// Add an audit entry.
    #[must_use]
    pub fn audit(mut self, draft: AuditDraft) -> Self {
        self.audit.push(draft);
        self
    }

    /// Whether the batch writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.handoffs.is_empty() && self.audit.is_empty()
    }
}

/// Versioned storage for sessions, handoffs, and the audit trail.
pub trait RecordStore: Send + Sync + std::fmt::Debug {
    /// Apply `batch` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::VersionConflict`] for stale updates,
    /// [`crate::Error::AlreadyActive`] / [`crate::Error::SessionExists`] /
    /// [`crate::Error::DuplicateType`] when a uniqueness rule is violated,
    /// and [`crate::Error::Unavailable`] for transient failures. Nothing is
    /// written on error.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Load a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Load the driver's active session.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn active_session(&self, driver_id: &DriverId) -> Result<Option<Session>>;

    /// Load a handoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn handoff(&self, id: &HandoffId) -> Result<Option<Handoff>>;

    /// Load the session's handoff of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn handoff_by_type(
        &self,
        session_id: &SessionId,
        handoff_type: HandoffType,
    ) -> Result<Option<Handoff>>;

    /// Load every handoff of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn handoffs_for_session(&self, session_id: &SessionId) -> Result<Vec<Handoff>>;

    /// Find the handoff whose token hashes to `digest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn handoff_by_token_digest(&self, digest: &str) -> Result<Option<Handoff>>;

    /// Load where the session's audit chain should end. `None` if the
    /// session has no entries or does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn audit_head(&self, session_id: &SessionId) -> Result<Option<TrailHead>>;

    /// Load a session's audit trail in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn audit_trail(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>>;
}
