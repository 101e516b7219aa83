//! `SQLite` schema definitions for wastetrail.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the sessions table.
///
/// Scalar fields are columns; the container selection, route, and
/// locations are JSON documents on the row.
pub const CREATE_SESSIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    driver_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    start_location TEXT,
    end_location TEXT,
    selected_containers TEXT NOT NULL,
    route TEXT NOT NULL,
    handoff_state TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// At most one active session per driver.
pub const CREATE_ACTIVE_DRIVER_INDEX: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_driver
ON sessions(driver_id) WHERE status = 'active'
";

/// SQL statement to create the handoffs table.
pub const CREATE_HANDOFFS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS handoffs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    handoff_type TEXT NOT NULL,
    status TEXT NOT NULL,
    containers TEXT NOT NULL,
    total_containers INTEGER NOT NULL,
    total_declared_weight REAL NOT NULL,
    receiver TEXT NOT NULL,
    token_digest TEXT NOT NULL,
    token_consumed_at TEXT,
    created_at TEXT NOT NULL,
    sender_confirmed_at TEXT,
    completed_at TEXT,
    rejected_at TEXT,
    rejection_reason TEXT,
    version INTEGER NOT NULL,
    UNIQUE (session_id, handoff_type)
)
";

/// SQL statement to create the unique index on `token_digest` used by
/// public lookups. A digest resolves to at most one handoff.
pub const CREATE_TOKEN_INDEX: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_handoffs_token ON handoffs(token_digest)
";

/// SQL statement to create the append-only audit log.
pub const CREATE_AUDIT_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    handoff_id TEXT,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    detail TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL
)
";

/// SQL statement to create an index on `session_id` for trail reads.
pub const CREATE_AUDIT_SESSION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_log(session_id, seq)
";

/// Reject updates to audit rows.
pub const CREATE_AUDIT_NO_UPDATE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END
";

/// Reject deletes of audit rows.
pub const CREATE_AUDIT_NO_DELETE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END
";

/// SQL statement to create the container registry table.
pub const CREATE_CONTAINERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS containers (
    container_ref TEXT PRIMARY KEY,
    company_id TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Version 2: record each session's audit chain head on the session row,
/// backfilled from the existing log, and make token digests unique.
pub const MIGRATE_V2: &str = r"
ALTER TABLE sessions ADD COLUMN audit_head_seq INTEGER;
ALTER TABLE sessions ADD COLUMN audit_head_hash TEXT;
ALTER TABLE sessions ADD COLUMN audit_entries INTEGER NOT NULL DEFAULT 0;
UPDATE sessions SET
    audit_head_seq = (SELECT MAX(a.seq) FROM audit_log a WHERE a.session_id = sessions.id),
    audit_head_hash = (SELECT a.hash FROM audit_log a WHERE a.session_id = sessions.id
                       ORDER BY a.seq DESC LIMIT 1),
    audit_entries = (SELECT COUNT(*) FROM audit_log a WHERE a.session_id = sessions.id);
DROP INDEX IF EXISTS idx_handoffs_token;
CREATE UNIQUE INDEX idx_handoffs_token ON handoffs(token_digest);
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_SESSIONS_TABLE,
    CREATE_ACTIVE_DRIVER_INDEX,
    CREATE_HANDOFFS_TABLE,
    CREATE_TOKEN_INDEX,
    CREATE_AUDIT_TABLE,
    CREATE_AUDIT_SESSION_INDEX,
    CREATE_AUDIT_NO_UPDATE_TRIGGER,
    CREATE_AUDIT_NO_DELETE_TRIGGER,
    CREATE_CONTAINERS_TABLE,
    CREATE_METADATA_TABLE,
];
