//! `SQLite` schema definitions for the familymap cache.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the session table. It holds at most one row.
pub const CREATE_SESSION_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS session (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    user_id TEXT NOT NULL,
    email TEXT,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create the roster snapshot table.
pub const CREATE_ROSTER_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS roster_snapshot (
    member_id TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    name TEXT,
    lat REAL,
    lng REAL,
    updated_at TEXT
)
";

/// SQL statement to create an index on `position` for ordered reads.
pub const CREATE_ROSTER_POSITION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_roster_position ON roster_snapshot(position)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_SESSION_TABLE,
    CREATE_ROSTER_TABLE,
    CREATE_ROSTER_POSITION_INDEX,
    CREATE_METADATA_TABLE,
];
