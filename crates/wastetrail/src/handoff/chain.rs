//! Handoff state machine and token handling.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditDraft};
use crate::clock::Clock;
use crate::config::HandoffConfig;
use crate::error::{Error, Result};
use crate::ids::{HandoffId, SessionId};
use crate::locks::{KeyGuard, LockTable};
use crate::logging::SECURITY_TARGET;
use crate::session::Session;
use crate::storage::{RecordStore, WriteBatch};

use super::{
    ConfirmationToken, Handoff, HandoffContainer, HandoffStatus, HandoffType, Receiver, TokenSeal,
    MIN_TOKEN_BYTES,
};

/// A freshly created handoff with the one copy of its plaintext token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedHandoff {
    /// The persisted handoff.
    pub handoff: Handoff,
    /// Token to pass to the receiving party out of band.
    pub confirmation_token: ConfirmationToken,
}

/// Creates handoffs and drives them through their status transitions.
///
/// Every transition takes the owning session's lock, so transitions on one
/// session are serialized and the status check is the tie-break between
/// racing callers.
#[derive(Debug)]
pub struct HandoffChain {
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<LockTable>,
    token_bytes: usize,
    phone_pattern: Regex,
}

impl HandoffChain {
    /// Build a chain from handoff configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the token size is below
    /// [`MIN_TOKEN_BYTES`] or the phone pattern does not compile.
    pub fn new(
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<LockTable>,
        config: &HandoffConfig,
    ) -> Result<Self> {
        if config.token_bytes < MIN_TOKEN_BYTES {
            return Err(Error::ConfigValidation {
                message: format!(
                    "handoff.token_bytes must be at least {MIN_TOKEN_BYTES}, got {}",
                    config.token_bytes
                ),
            });
        }
        let phone_pattern = Regex::new(&config.phone_pattern).map_err(|e| Error::ConfigValidation {
            message: format!("handoff.phone_pattern is not a valid regex: {e}"),
        })?;

        Ok(Self {
            records,
            clock,
            locks,
            token_bytes: config.token_bytes,
            phone_pattern,
        })
    }

    /// Open a handoff for a session and issue its confirmation token.
    ///
    /// Checks run in this order: receiver, container list shape, session
    /// existence, visited containers, duplicate type, prerequisite stage.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidReceiver`] for a malformed receiver.
    /// - [`Error::EmptyContainers`] if `containers` is empty.
    /// - [`Error::Validation`] for repeated containers or bad weights.
    /// - [`Error::SessionNotFound`] if the session does not exist.
    /// - [`Error::InvalidContainers`] listing containers never visited.
    /// - [`Error::DuplicateType`] if the session already has this type.
    /// - [`Error::PriorStageIncomplete`] if the prerequisite is not completed.
    pub fn create(
        &self,
        session_id: &SessionId,
        handoff_type: HandoffType,
        containers: Vec<HandoffContainer>,
        receiver: Receiver,
        actor: &str,
    ) -> Result<IssuedHandoff> {
        receiver.validate(&self.phone_pattern)?;
        check_container_list(&containers)?;

        let _guard = self.locks.session(session_id);
        let mut session = self
            .records
            .session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let not_visited: Vec<String> = containers
            .iter()
            .filter(|c| !session.is_visited(&c.container_ref))
            .map(|c| c.container_ref.to_string())
            .collect();
        if !not_visited.is_empty() {
            return Err(Error::InvalidContainers(not_visited));
        }

        if self
            .records
            .handoff_by_type(session_id, handoff_type)?
            .is_some()
        {
            return Err(Error::DuplicateType {
                session_id: session_id.to_string(),
                handoff_type,
            });
        }

        if let Some(required) = handoff_type.prerequisite() {
            let done = self
                .records
                .handoff_by_type(session_id, required)?
                .is_some_and(|h| h.status == HandoffStatus::Completed);
            if !done {
                return Err(Error::PriorStageIncomplete {
                    handoff_type,
                    required,
                });
            }
        }

        let token = ConfirmationToken::generate(self.token_bytes)?;
        let now = self.clock.now();
        let (total_containers, total_declared_weight) = Handoff::totals(&containers);
        let handoff = Handoff {
            id: HandoffId::generate(),
            session_id: session_id.clone(),
            handoff_type,
            status: HandoffStatus::Pending,
            containers,
            total_containers,
            total_declared_weight,
            receiver,
            created_at: now,
            sender_confirmed_at: None,
            completed_at: None,
            rejected_at: None,
            rejection_reason: None,
            seal: TokenSeal::for_token(&token),
            version: 1,
        };

        session.handoff_state.stage = handoff_type.pending_stage();
        session.version += 1;

        let audit = AuditDraft::session(session_id, AuditAction::HandoffCreated, actor, now)
            .for_handoff(&handoff.id)
            .with_detail(json!({
                "handoff_type": handoff_type,
                "containers": handoff.containers,
                "total_declared_weight": total_declared_weight,
                "receiver": handoff.receiver.audit_label(),
            }));

        self.records.commit(
            WriteBatch::new()
                .insert_handoff(handoff.clone())
                .update_session(session)
                .audit(audit),
        )?;

        info!(
            handoff_id = %handoff.id,
            %session_id,
            %handoff_type,
            containers = total_containers,
            "Handoff created"
        );
        Ok(IssuedHandoff {
            handoff,
            confirmation_token: token,
        })
    }

    /// Record the sender's confirmation: `pending` → `confirmed_by_sender`.
    ///
    /// # Errors
    ///
    /// - [`Error::HandoffNotFound`] if the handoff does not exist.
    /// - [`Error::WrongStatus`] if it is not pending.
    pub fn confirm_by_sender(&self, handoff_id: &HandoffId, actor: &str) -> Result<Handoff> {
        let (_guard, mut handoff) = self.load_locked(handoff_id)?;
        expect_status(&handoff, HandoffStatus::Pending)?;

        let now = self.clock.now();
        handoff.status = HandoffStatus::ConfirmedBySender;
        handoff.sender_confirmed_at = Some(now);
        handoff.version += 1;

        let audit = AuditDraft::session(&handoff.session_id, AuditAction::SenderConfirmed, actor, now)
            .for_handoff(handoff_id);
        self.records
            .commit(WriteBatch::new().update_handoff(handoff.clone()).audit(audit))?;

        info!(%handoff_id, handoff_type = %handoff.handoff_type, "Handoff confirmed by sender");
        Ok(handoff)
    }

    /// Accept custody with the confirmation token:
    /// `confirmed_by_sender` → `completed`.
    ///
    /// A consumed token fails with [`Error::InvalidToken`] before the status
    /// is looked at, so replaying a token that already completed this
    /// handoff is reported as a token failure.
    ///
    /// # Errors
    ///
    /// - [`Error::HandoffNotFound`] if the handoff does not exist.
    /// - [`Error::InvalidToken`] if the token was consumed or does not match.
    /// - [`Error::WrongStatus`] if the sender has not confirmed.
    pub fn confirm_by_receiver(
        &self,
        handoff_id: &HandoffId,
        token: &ConfirmationToken,
    ) -> Result<Handoff> {
        let (_guard, mut handoff) = self.load_locked(handoff_id)?;

        if handoff.seal.is_consumed() {
            warn!(
                target: SECURITY_TARGET,
                %handoff_id,
                reason = "consumed",
                "Confirmation token replayed"
            );
            return Err(Error::InvalidToken);
        }
        expect_status(&handoff, HandoffStatus::ConfirmedBySender)?;
        if !handoff.seal.matches(token) {
            warn!(
                target: SECURITY_TARGET,
                %handoff_id,
                reason = "mismatch",
                "Confirmation token did not match"
            );
            return Err(Error::InvalidToken);
        }

        let mut session = self.session_of(&handoff)?;
        let now = self.clock.now();
        handoff.status = HandoffStatus::Completed;
        handoff.completed_at = Some(now);
        handoff.seal.consumed_at = Some(now);
        handoff.version += 1;

        session.handoff_state.stage = handoff.handoff_type.completed_stage();
        session.version += 1;

        let audit = AuditDraft::session(
            &handoff.session_id,
            AuditAction::HandoffCompleted,
            handoff.receiver.audit_label(),
            now,
        )
        .for_handoff(handoff_id);

        self.records.commit(
            WriteBatch::new()
                .update_handoff(handoff.clone())
                .update_session(session)
                .audit(audit),
        )?;

        info!(%handoff_id, handoff_type = %handoff.handoff_type, "Handoff completed");
        Ok(handoff)
    }

    /// Refuse a pending handoff. Terminal.
    ///
    /// The session stage falls back to where it was before this handoff
    /// was opened. The handoff itself stays on record, so the type cannot
    /// be created again for the session.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `reason` is blank.
    /// - [`Error::HandoffNotFound`] if the handoff does not exist.
    /// - [`Error::WrongStatus`] if it is not pending.
    pub fn reject(&self, handoff_id: &HandoffId, reason: &str, actor: &str) -> Result<Handoff> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::Validation("rejection reason is empty".to_string()));
        }

        let (_guard, mut handoff) = self.load_locked(handoff_id)?;
        expect_status(&handoff, HandoffStatus::Pending)?;

        let now = self.clock.now();
        handoff.status = HandoffStatus::Rejected;
        handoff.rejected_at = Some(now);
        handoff.rejection_reason = Some(reason.to_string());
        handoff.version += 1;

        let mut batch = WriteBatch::new().update_handoff(handoff.clone());

        let mut session = self.session_of(&handoff)?;
        if session.handoff_state.stage == handoff.handoff_type.pending_stage() {
            session.handoff_state.stage = handoff.handoff_type.preceding_stage();
            session.version += 1;
            batch = batch.update_session(session);
        }

        let audit = AuditDraft::session(&handoff.session_id, AuditAction::HandoffRejected, actor, now)
            .for_handoff(handoff_id)
            .with_detail(json!({ "reason": reason }));
        self.records.commit(batch.audit(audit))?;

        info!(%handoff_id, handoff_type = %handoff.handoff_type, "Handoff rejected");
        Ok(handoff)
    }

    /// Load a handoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandoffNotFound`] if it does not exist.
    pub fn get(&self, handoff_id: &HandoffId) -> Result<Handoff> {
        self.records
            .handoff(handoff_id)?
            .ok_or_else(|| Error::HandoffNotFound(handoff_id.to_string()))
    }

    /// All handoffs of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn for_session(&self, session_id: &SessionId) -> Result<Vec<Handoff>> {
        self.records.handoffs_for_session(session_id)
    }

    /// Resolve the handoff a token was issued for. Read-only; consumed
    /// tokens still resolve.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if no handoff carries this token.
    pub fn lookup_by_token(&self, token: &ConfirmationToken) -> Result<Handoff> {
        let found = self.records.handoff_by_token_digest(&token.digest())?;
        found.ok_or_else(|| {
            warn!(target: SECURITY_TARGET, reason = "unknown", "Token lookup failed");
            Error::InvalidToken
        })
    }

    /// Find the handoff, take its session's lock, then re-read it so the
    /// status check sees every transition committed before the lock.
    fn load_locked(&self, handoff_id: &HandoffId) -> Result<(KeyGuard, Handoff)> {
        let session_id = self.get(handoff_id)?.session_id;
        let guard = self.locks.session(&session_id);
        let handoff = self.get(handoff_id)?;
        Ok((guard, handoff))
    }

    fn session_of(&self, handoff: &Handoff) -> Result<Session> {
        self.records
            .session(&handoff.session_id)?
            .ok_or_else(|| Error::SessionNotFound(handoff.session_id.to_string()))
    }
}

fn expect_status(handoff: &Handoff, expected: HandoffStatus) -> Result<()> {
    if handoff.status == expected {
        Ok(())
    } else {
        Err(Error::WrongStatus {
            handoff_id: handoff.id.to_string(),
            expected,
            actual: handoff.status,
        })
    }
}

fn check_container_list(containers: &[HandoffContainer]) -> Result<()> {
    if containers.is_empty() {
        return Err(Error::EmptyContainers);
    }
    let mut seen = HashSet::new();
    for c in containers {
        if !seen.insert(&c.container_ref) {
            return Err(Error::Validation(format!(
                "container {} is listed more than once",
                c.container_ref
            )));
        }
        if let Some(weight) = c.declared_weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Validation(format!(
                    "declared weight {weight} for {} must be a non-negative number",
                    c.container_ref
                )));
            }
        }
    }
    Ok(())
}
