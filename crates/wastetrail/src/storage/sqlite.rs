//! `SQLite` implementation of [`RecordStore`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{AuditDraft, AuditEntry, TrailHead, GENESIS_HASH};
use crate::error::{Error, Result};
use crate::handoff::{Handoff, HandoffType, TokenSeal};
use crate::ids::{ContainerRef, DriverId, HandoffId, SessionId};
use crate::registry::{ContainerInfo, ContainerRegistry};
use crate::session::Session;

use super::{migrations, RecordStore, RecordWrite, WriteBatch};

/// Default time to wait on a locked database before reporting `Unavailable`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "id, driver_id, status, start_time, end_time, start_location, \
     end_location, selected_containers, route, handoff_state, version";

const HANDOFF_COLUMNS: &str = "id, session_id, handoff_type, status, containers, \
     total_containers, total_declared_weight, receiver, token_digest, token_consumed_at, \
     created_at, sender_confirmed_at, completed_at, rejected_at, rejection_reason, version";

/// `SQLite`-backed record store.
///
/// A single connection guarded by a mutex; every commit runs in an
/// `IMMEDIATE` transaction so a competing writer surfaces as
/// [`Error::Unavailable`] rather than a late failure.
#[derive(Debug)]
pub struct SqliteStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema
    /// initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create a database, waiting up to `busy_timeout` on locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema
    /// initialization fails.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // FULL sync: a commit that returned is on disk.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(busy_timeout)?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace a container in the registry table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn register_container(&self, container_ref: &ContainerRef, company_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO containers (container_ref, company_id) VALUES (?1, ?2)",
            params![container_ref.as_str(), company_id],
        )?;
        debug!("Registered container {} for {}", container_ref, company_id);
        Ok(())
    }

    /// Get record counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

        Ok(StorageStats {
            total_sessions: count("SELECT COUNT(*) FROM sessions")?,
            active_sessions: count("SELECT COUNT(*) FROM sessions WHERE status = 'active'")?,
            total_handoffs: count("SELECT COUNT(*) FROM handoffs")?,
            audit_entries: count("SELECT COUNT(*) FROM audit_log")?,
        })
    }

    fn insert_session(tx: &Transaction<'_>, s: &Session) -> Result<()> {
        let result = tx.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                s.id.as_str(),
                s.driver_id.as_str(),
                s.status.to_string(),
                s.start_time.to_rfc3339(),
                s.end_time.map(|t| t.to_rfc3339()),
                to_json_opt(s.start_location.as_ref())?,
                to_json_opt(s.end_location.as_ref())?,
                serde_json::to_string(&s.selected_containers)?,
                serde_json::to_string(&s.route)?,
                serde_json::to_string(&s.handoff_state)?,
                s.version,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                let taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                    [s.id.as_str()],
                    |row| row.get(0),
                )?;
                if taken {
                    return Err(Error::SessionExists(s.id.to_string()));
                }
                let active: Option<String> = tx
                    .query_row(
                        "SELECT id FROM sessions WHERE driver_id = ?1 AND status = 'active'",
                        [s.driver_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Err(Error::AlreadyActive {
                    driver_id: s.driver_id.to_string(),
                    session_id: active.unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_session(tx: &Transaction<'_>, s: &Session) -> Result<()> {
        let affected = tx.execute(
            "UPDATE sessions SET status = ?2, end_time = ?3, end_location = ?4, \
             selected_containers = ?5, route = ?6, handoff_state = ?7, version = ?8, \
             updated_at = datetime('now') \
             WHERE id = ?1 AND version = ?9",
            params![
                s.id.as_str(),
                s.status.to_string(),
                s.end_time.map(|t| t.to_rfc3339()),
                to_json_opt(s.end_location.as_ref())?,
                serde_json::to_string(&s.selected_containers)?,
                serde_json::to_string(&s.route)?,
                serde_json::to_string(&s.handoff_state)?,
                s.version,
                s.version - 1,
            ],
        );
        match affected {
            Ok(0) => Err(Error::VersionConflict {
                record: "session",
                id: s.id.to_string(),
                expected: s.version - 1,
            }),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::AlreadyActive {
                driver_id: s.driver_id.to_string(),
                session_id: String::new(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn insert_handoff(tx: &Transaction<'_>, h: &Handoff) -> Result<()> {
        let result = tx.execute(
            &format!(
                "INSERT INTO handoffs ({HANDOFF_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                h.id.as_str(),
                h.session_id.as_str(),
                h.handoff_type.to_string(),
                h.status.to_string(),
                serde_json::to_string(&h.containers)?,
                i64::try_from(h.total_containers).unwrap_or(i64::MAX),
                h.total_declared_weight,
                serde_json::to_string(&h.receiver)?,
                h.seal.digest,
                h.seal.consumed_at.map(|t| t.to_rfc3339()),
                h.created_at.to_rfc3339(),
                h.sender_confirmed_at.map(|t| t.to_rfc3339()),
                h.completed_at.map(|t| t.to_rfc3339()),
                h.rejected_at.map(|t| t.to_rfc3339()),
                h.rejection_reason,
                h.version,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                let same_type: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM handoffs WHERE session_id = ?1 AND handoff_type = ?2)",
                    params![h.session_id.as_str(), h.handoff_type.to_string()],
                    |row| row.get(0),
                )?;
                if same_type {
                    return Err(Error::DuplicateType {
                        session_id: h.session_id.to_string(),
                        handoff_type: h.handoff_type,
                    });
                }
                let reused_digest: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM handoffs WHERE token_digest = ?1)",
                    [h.seal.digest.as_str()],
                    |row| row.get(0),
                )?;
                if reused_digest {
                    return Err(Error::internal(format!(
                        "token digest for handoff {} is already issued",
                        h.id
                    )));
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_handoff(tx: &Transaction<'_>, h: &Handoff) -> Result<()> {
        let affected = tx.execute(
            "UPDATE handoffs SET status = ?2, token_consumed_at = ?3, sender_confirmed_at = ?4, \
             completed_at = ?5, rejected_at = ?6, rejection_reason = ?7, version = ?8 \
             WHERE id = ?1 AND version = ?9",
            params![
                h.id.as_str(),
                h.status.to_string(),
                h.seal.consumed_at.map(|t| t.to_rfc3339()),
                h.sender_confirmed_at.map(|t| t.to_rfc3339()),
                h.completed_at.map(|t| t.to_rfc3339()),
                h.rejected_at.map(|t| t.to_rfc3339()),
                h.rejection_reason,
                h.version,
                h.version - 1,
            ],
        )?;
        if affected == 0 {
            return Err(Error::VersionConflict {
                record: "handoff",
                id: h.id.to_string(),
                expected: h.version - 1,
            });
        }
        Ok(())
    }

    fn append_audit(tx: &Transaction<'_>, draft: &AuditDraft) -> Result<()> {
        let prev_hash: String = tx
            .query_row(
                "SELECT hash FROM audit_log WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
                [draft.session_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let hash = draft.chain_hash(&prev_hash)?;

        tx.execute(
            "INSERT INTO audit_log \
             (session_id, handoff_id, action, actor, detail, recorded_at, prev_hash, hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                draft.session_id.as_str(),
                draft.handoff_id.as_ref().map(HandoffId::as_str),
                draft.action.to_string(),
                draft.actor,
                serde_json::to_string(&draft.detail)?,
                draft.recorded_at.to_rfc3339(),
                prev_hash,
                hash,
            ],
        )?;

        // Move the session's chain head in the same transaction.
        let affected = tx.execute(
            "UPDATE sessions SET audit_head_seq = ?1, audit_head_hash = ?2, \
             audit_entries = audit_entries + 1 WHERE id = ?3",
            params![tx.last_insert_rowid(), hash, draft.session_id.as_str()],
        )?;
        if affected == 0 {
            return Err(Error::internal(format!(
                "audit entry for unknown session {}",
                draft.session_id
            )));
        }
        Ok(())
    }

    fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: SessionId::new(row.get::<_, String>(0)?),
            driver_id: DriverId::new(row.get::<_, String>(1)?),
            status: parsed_col(row, 2)?,
            start_time: time_col(row, 3)?,
            end_time: time_col_opt(row, 4)?,
            start_location: json_col_opt(row, 5)?,
            end_location: json_col_opt(row, 6)?,
            selected_containers: json_col(row, 7)?,
            route: json_col(row, 8)?,
            handoff_state: json_col(row, 9)?,
            version: row.get(10)?,
        })
    }

    fn row_to_handoff(row: &Row<'_>) -> rusqlite::Result<Handoff> {
        let total_containers: i64 = row.get(5)?;
        Ok(Handoff {
            id: HandoffId::new(row.get::<_, String>(0)?),
            session_id: SessionId::new(row.get::<_, String>(1)?),
            handoff_type: parsed_col(row, 2)?,
            status: parsed_col(row, 3)?,
            containers: json_col(row, 4)?,
            total_containers: usize::try_from(total_containers)
                .map_err(|e| conversion_error(5, e.to_string().into()))?,
            total_declared_weight: row.get(6)?,
            receiver: json_col(row, 7)?,
            seal: TokenSeal {
                digest: row.get(8)?,
                consumed_at: time_col_opt(row, 9)?,
            },
            created_at: time_col(row, 10)?,
            sender_confirmed_at: time_col_opt(row, 11)?,
            completed_at: time_col_opt(row, 12)?,
            rejected_at: time_col_opt(row, 13)?,
            rejection_reason: row.get(14)?,
            version: row.get(15)?,
        })
    }

    fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
        let action: String = row.get(3)?;
        let action = serde_json::from_value(serde_json::Value::String(action))
            .map_err(|e| conversion_error(3, Box::new(e)))?;
        Ok(AuditEntry {
            seq: row.get(0)?,
            draft: AuditDraft {
                session_id: SessionId::new(row.get::<_, String>(1)?),
                handoff_id: row.get::<_, Option<String>>(2)?.map(HandoffId::new),
                action,
                actor: row.get(4)?,
                detail: json_col(row, 5)?,
                recorded_at: time_col(row, 6)?,
            },
            prev_hash: row.get(7)?,
            hash: row.get(8)?,
        })
    }

    fn query_handoffs(&self, sql: &str, param: &str) -> Result<Vec<Handoff>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let handoffs = stmt
            .query_map([param], Self::row_to_handoff)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(handoffs)
    }
}

impl RecordStore for SqliteStore {
    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for write in &batch.sessions {
            match write {
                RecordWrite::Insert(s) => Self::insert_session(&tx, s)?,
                RecordWrite::Update(s) => Self::update_session(&tx, s)?,
            }
        }
        for write in &batch.handoffs {
            match write {
                RecordWrite::Insert(h) => Self::insert_handoff(&tx, h)?,
                RecordWrite::Update(h) => Self::update_handoff(&tx, h)?,
            }
        }
        for draft in &batch.audit {
            Self::append_audit(&tx, draft)?;
        }

        tx.commit()?;
        debug!(
            sessions = batch.sessions.len(),
            handoffs = batch.handoffs.len(),
            audit = batch.audit.len(),
            "Committed write batch"
        );
        Ok(())
    }

    fn session(&self, id: &SessionId) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                [id.as_str()],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    fn active_session(&self, driver_id: &DriverId) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE driver_id = ?1 AND status = 'active'"
                ),
                [driver_id.as_str()],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    fn handoff(&self, id: &HandoffId) -> Result<Option<Handoff>> {
        let conn = self.conn.lock();
        let handoff = conn
            .query_row(
                &format!("SELECT {HANDOFF_COLUMNS} FROM handoffs WHERE id = ?1"),
                [id.as_str()],
                Self::row_to_handoff,
            )
            .optional()?;
        Ok(handoff)
    }

    fn handoff_by_type(
        &self,
        session_id: &SessionId,
        handoff_type: HandoffType,
    ) -> Result<Option<Handoff>> {
        let conn = self.conn.lock();
        let handoff = conn
            .query_row(
                &format!(
                    "SELECT {HANDOFF_COLUMNS} FROM handoffs \
                     WHERE session_id = ?1 AND handoff_type = ?2"
                ),
                params![session_id.as_str(), handoff_type.to_string()],
                Self::row_to_handoff,
            )
            .optional()?;
        Ok(handoff)
    }

    fn handoffs_for_session(&self, session_id: &SessionId) -> Result<Vec<Handoff>> {
        self.query_handoffs(
            &format!(
                "SELECT {HANDOFF_COLUMNS} FROM handoffs \
                 WHERE session_id = ?1 ORDER BY rowid ASC"
            ),
            session_id.as_str(),
        )
    }

    fn handoff_by_token_digest(&self, digest: &str) -> Result<Option<Handoff>> {
        Ok(self
            .query_handoffs(
                &format!("SELECT {HANDOFF_COLUMNS} FROM handoffs WHERE token_digest = ?1"),
                digest,
            )?
            .into_iter()
            .next())
    }

    fn audit_head(&self, session_id: &SessionId) -> Result<Option<TrailHead>> {
        let conn = self.conn.lock();
        let head = conn
            .query_row(
                "SELECT audit_head_seq, audit_head_hash, audit_entries FROM sessions WHERE id = ?1",
                [session_id.as_str()],
                |row| {
                    let seq: Option<i64> = row.get(0)?;
                    let hash: Option<String> = row.get(1)?;
                    let entries: i64 = row.get(2)?;
                    let entries = usize::try_from(entries)
                        .map_err(|e| conversion_error(2, e.to_string().into()))?;
                    Ok(seq
                        .zip(hash)
                        .map(|(seq, hash)| TrailHead { seq, hash, entries }))
                },
            )
            .optional()?;
        Ok(head.flatten())
    }

    fn audit_trail(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, session_id, handoff_id, action, actor, detail, recorded_at, \
             prev_hash, hash FROM audit_log WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map([session_id.as_str()], Self::row_to_audit)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl ContainerRegistry for SqliteStore {
    fn lookup(&self, container_ref: &ContainerRef) -> Result<Option<ContainerInfo>> {
        let conn = self.conn.lock();
        let company_id: Option<String> = conn
            .query_row(
                "SELECT company_id FROM containers WHERE container_ref = ?1",
                [container_ref.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(company_id.map(|company_id| ContainerInfo {
            container_ref: container_ref.clone(),
            company_id,
        }))
    }
}

/// Record counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Sessions ever started.
    pub total_sessions: i64,
    /// Sessions currently active.
    pub active_sessions: i64,
    /// Handoffs ever created.
    pub total_handoffs: i64,
    /// Audit trail length across all sessions.
    pub audit_entries: i64,
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

fn to_json_opt<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

fn conversion_error(
    idx: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: Error| conversion_error(idx, e.to_string().into()))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Box::new(e)))
}

fn json_col_opt<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Box::new(e))))
        .transpose()
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Box::new(e)))
}

fn time_col_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, Box::new(e)))
        })
        .transpose()
}
