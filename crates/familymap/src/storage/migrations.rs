//! Cache schema versioning.
//!
//! The schema version lives in the metadata table. Opening a cache brings
//! it up to [`CURRENT_VERSION`].

use rusqlite::Connection;

use crate::error::{Error, Result};

use super::schema::SCHEMA_STATEMENTS;

/// Schema version this build writes.
pub const CURRENT_VERSION: i32 = 1;

/// Metadata key holding the schema version.
const VERSION_KEY: &str = "schema_version";

/// Metadata key holding when the cache was last migrated.
const MIGRATED_AT_KEY: &str = "migrated_at";

/// One schema step, bringing the cache to `version`.
type Migration = fn(&Connection) -> Result<()>;

/// Schema steps in version order. Entry `n` migrates to version `n + 1`.
const MIGRATIONS: &[Migration] = &[migrate_v1];

/// Create the cache tables and apply pending migrations.
///
/// A cache written by a newer build is rejected rather than downgraded.
///
/// # Errors
///
/// Returns an error if schema creation or migration fails.
pub fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    for statement in SCHEMA_STATEMENTS {
        tx.execute(statement, [])?;
    }

    let version = get_schema_version(&tx)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "cache schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }
    for target in (version + 1)..=CURRENT_VERSION {
        run_migration(&tx, target)?;
        set_schema_version(&tx, target)?;
    }
    tx.commit()?;
    Ok(())
}

/// Get the schema version, or 0 for a fresh database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<String, rusqlite::Error> = conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        [VERSION_KEY],
        |row| row.get(0),
    );

    match result {
        Ok(value) => value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2), (?3, datetime('now'))",
        (VERSION_KEY, version.to_string(), MIGRATED_AT_KEY),
    )?;
    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> Result<()> {
    let step = usize::try_from(version - 1)
        .ok()
        .and_then(|index| MIGRATIONS.get(index))
        .ok_or_else(|| Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        })?;
    step(conn)
}

/// Version 1 is the base schema created above.
fn migrate_v1(_conn: &Connection) -> Result<()> {
    Ok(())
}
