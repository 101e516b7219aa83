//! Tamper-evident custody trail.
//!
//! Each custody-relevant transition appends an [`AuditEntry`] in the same
//! transaction as the state change. Entries of one session are chained: an
//! entry's hash covers the previous entry's hash and its own content, so
//! editing or deleting any row breaks every hash after it.
//!
//! Rows dropped from the end leave no broken link, so the store also keeps
//! a [`TrailHead`] beside each session, moved in the same transaction as
//! every append. [`verify_against`] checks the chain ends where the head
//! says it does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{HandoffId, SessionId};

/// The `prev_hash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A session was started.
    SessionStarted,
    /// A container was marked visited.
    ContainerVisited,
    /// A session was stopped.
    SessionStopped,
    /// A handoff was created.
    HandoffCreated,
    /// The sending party confirmed a handoff.
    SenderConfirmed,
    /// The receiving party accepted custody.
    HandoffCompleted,
    /// A handoff was rejected.
    HandoffRejected,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SessionStarted => "session_started",
            Self::ContainerVisited => "container_visited",
            Self::SessionStopped => "session_stopped",
            Self::HandoffCreated => "handoff_created",
            Self::SenderConfirmed => "sender_confirmed",
            Self::HandoffCompleted => "handoff_completed",
            Self::HandoffRejected => "handoff_rejected",
        };
        f.write_str(s)
    }
}

/// An entry that has not been chained yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDraft {
    /// Session the entry belongs to.
    pub session_id: SessionId,
    /// Handoff involved, if any.
    pub handoff_id: Option<HandoffId>,
    /// What happened.
    pub action: AuditAction,
    /// Who did it.
    pub actor: String,
    /// Action-specific details.
    pub detail: serde_json::Value,
    /// When it happened.
    pub recorded_at: DateTime<Utc>,
}

impl AuditDraft {
    /// Start a draft for a session-level action.
    #[must_use]
    pub fn session(
        session_id: &SessionId,
        action: AuditAction,
        actor: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.clone(),
            handoff_id: None,
            action,
            actor: actor.into(),
            detail: serde_json::Value::Null,
            recorded_at,
        }
    }

    /// Attach the handoff this entry concerns.
    #[must_use]
    pub fn for_handoff(mut self, handoff_id: &HandoffId) -> Self {
        self.handoff_id = Some(handoff_id.clone());
        self
    }

    /// Attach details.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Hash this draft onto `prev_hash`.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft cannot be serialized.
    pub fn chain_hash(&self, prev_hash: &str) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(&canonical);
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// A persisted, chained trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Global sequence number.
    pub seq: i64,
    /// The chained content.
    #[serde(flatten)]
    pub draft: AuditDraft,
    /// Hash of the previous entry for this session.
    pub prev_hash: String,
    /// Hash of this entry.
    pub hash: String,
}

/// Where a session's chain ends, recorded outside the chain itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailHead {
    /// Sequence number of the last entry.
    pub seq: i64,
    /// Hash of the last entry.
    pub hash: String,
    /// Number of entries appended.
    pub entries: usize,
}

/// Result of recomputing a session's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailReport {
    /// Number of entries checked.
    pub entries: usize,
    /// Whether every link verified.
    pub intact: bool,
    /// Sequence number of the first entry that failed to verify, or of the
    /// recorded head when the trail stops short of it.
    pub first_broken: Option<i64>,
}

/// Recompute the chain over `entries`, which must be in sequence order.
///
/// # Errors
///
/// Returns an error if an entry cannot be serialized.
pub fn verify(entries: &[AuditEntry]) -> Result<TrailReport> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for entry in entries {
        let recomputed = entry.draft.chain_hash(&expected_prev)?;
        if entry.prev_hash != expected_prev || entry.hash != recomputed {
            return Ok(TrailReport {
                entries: entries.len(),
                intact: false,
                first_broken: Some(entry.seq),
            });
        }
        expected_prev = recomputed;
    }
    Ok(TrailReport {
        entries: entries.len(),
        intact: true,
        first_broken: None,
    })
}

/// Recompute the chain and check it ends at `head`.
///
/// A session with no recorded head must have no entries.
///
/// # Errors
///
/// Returns an error if an entry cannot be serialized.
pub fn verify_against(entries: &[AuditEntry], head: Option<&TrailHead>) -> Result<TrailReport> {
    let report = verify(entries)?;
    if !report.intact {
        return Ok(report);
    }

    let first_broken = match (entries.last(), head) {
        (None, None) => return Ok(report),
        (Some(last), Some(head))
            if last.seq == head.seq && last.hash == head.hash && entries.len() == head.entries =>
        {
            return Ok(report)
        }
        (_, Some(head)) => head.seq,
        (Some(_), None) => entries[0].seq,
    };
    Ok(TrailReport {
        entries: entries.len(),
        intact: false,
        first_broken: Some(first_broken),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(drafts: Vec<AuditDraft>) -> Vec<AuditEntry> {
        let mut prev = GENESIS_HASH.to_string();
        drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                let hash = draft.chain_hash(&prev).unwrap();
                let entry = AuditEntry {
                    seq: i64::try_from(i).unwrap() + 1,
                    draft,
                    prev_hash: prev.clone(),
                    hash: hash.clone(),
                };
                prev = hash;
                entry
            })
            .collect()
    }

    fn drafts() -> Vec<AuditDraft> {
        let session = SessionId::new("s-1");
        let now = Utc::now();
        vec![
            AuditDraft::session(&session, AuditAction::SessionStarted, "d-1", now),
            AuditDraft::session(&session, AuditAction::ContainerVisited, "d-1", now)
                .with_detail(serde_json::json!({"container_ref": "A"})),
            AuditDraft::session(&session, AuditAction::SessionStopped, "d-1", now),
        ]
    }

    #[test]
    fn test_intact_chain_verifies() {
        let entries = chain(drafts());
        let report = verify(&entries).unwrap();
        assert!(report.intact);
        assert_eq!(report.entries, 3);
        assert!(report.first_broken.is_none());
    }

    #[test]
    fn test_empty_chain_is_intact() {
        let report = verify(&[]).unwrap();
        assert!(report.intact);
        assert_eq!(report.entries, 0);
    }

    #[test]
    fn test_edited_detail_is_detected() {
        let mut entries = chain(drafts());
        entries[1].draft.detail = serde_json::json!({"container_ref": "B"});

        let report = verify(&entries).unwrap();
        assert!(!report.intact);
        assert_eq!(report.first_broken, Some(2));
    }

    #[test]
    fn test_deleted_entry_is_detected() {
        let mut entries = chain(drafts());
        entries.remove(1);

        let report = verify(&entries).unwrap();
        assert!(!report.intact);
        assert_eq!(report.first_broken, Some(3));
    }

    #[test]
    fn test_hash_depends_on_prev() {
        let draft = &drafts()[0];
        assert_ne!(
            draft.chain_hash(GENESIS_HASH).unwrap(),
            draft.chain_hash("ff").unwrap()
        );
    }

    fn head_of(entries: &[AuditEntry]) -> TrailHead {
        let last = entries.last().unwrap();
        TrailHead {
            seq: last.seq,
            hash: last.hash.clone(),
            entries: entries.len(),
        }
    }

    #[test]
    fn test_trail_matching_head_verifies() {
        let entries = chain(drafts());
        let report = verify_against(&entries, Some(&head_of(&entries))).unwrap();
        assert!(report.intact);
        assert!(verify_against(&[], None).unwrap().intact);
    }

    #[test]
    fn test_truncated_tail_is_detected() {
        let mut entries = chain(drafts());
        let head = head_of(&entries);
        entries.pop();

        // The shortened chain still links up on its own.
        assert!(verify(&entries).unwrap().intact);

        let report = verify_against(&entries, Some(&head)).unwrap();
        assert!(!report.intact);
        assert_eq!(report.entries, 2);
        assert_eq!(report.first_broken, Some(3));
    }

    #[test]
    fn test_emptied_trail_is_detected() {
        let entries = chain(drafts());
        let report = verify_against(&[], Some(&head_of(&entries))).unwrap();
        assert!(!report.intact);
        assert_eq!(report.first_broken, Some(3));
    }

    #[test]
    fn test_entries_without_head_are_detected() {
        let entries = chain(drafts());
        let report = verify_against(&entries, None).unwrap();
        assert!(!report.intact);
        assert_eq!(report.first_broken, Some(1));
    }

    #[test]
    fn test_action_display() {
        assert_eq!(AuditAction::HandoffCompleted.to_string(), "handoff_completed");
    }
}
