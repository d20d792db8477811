//! Local cache for familymap.
//!
//! A small `SQLite` database keeps the signed-in session across restarts
//! and the last roster snapshot, so the dashboard has something to show
//! before the first fetch completes.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::roster::Member;
use crate::session::{Session, User};

/// Metadata key holding when the roster snapshot was written.
const ROSTER_FETCHED_AT_KEY: &str = "roster_fetched_at";

/// Path reported for in-memory caches.
const MEMORY_PATH: &str = ":memory:";

/// Persistent cache of the session and the last roster.
#[derive(Debug)]
pub struct LocalStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create a cache database at the given path.
    ///
    /// Creates the parent directories if they don't exist and brings the
    /// schema up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening cache at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&mut conn)?;

        info!("Cache opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory cache, for tests and `--no-cache` runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(MEMORY_PATH),
            source,
        })?;
        migrations::initialize_schema(&mut conn)?;

        Ok(Self {
            path: PathBuf::from(MEMORY_PATH),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // A panic mid-statement leaves nothing half-applied in SQLite
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember `session`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        self.lock().execute(
            r"
            INSERT OR REPLACE INTO session
                (id, user_id, email, access_token, refresh_token, expires_at, saved_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, datetime('now'))
            ",
            params![
                session.user.id.to_string(),
                session.user.email,
                session.access_token,
                session.refresh_token,
                session.expires_at.to_rfc3339(),
            ],
        )?;
        debug!(user = %session.user.id, "Saved session");
        Ok(())
    }

    /// The remembered session, if any.
    ///
    /// A row that no longer parses is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_session(&self) -> Result<Option<Session>> {
        let row = self
            .lock()
            .query_row(
                r"
                SELECT user_id, email, access_token, refresh_token, expires_at
                FROM session WHERE id = 1
                ",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, email, access_token, refresh_token, expires_at)) = row else {
            return Ok(None);
        };
        let (Ok(id), Some(expires_at)) = (Uuid::parse_str(&user_id), parse_timestamp(&expires_at))
        else {
            debug!("Ignoring unreadable cached session");
            return Ok(None);
        };

        Ok(Some(Session {
            access_token,
            refresh_token,
            expires_at,
            user: User { id, email },
        }))
    }

    /// Forget the remembered session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear_session(&self) -> Result<()> {
        let removed = self.lock().execute("DELETE FROM session", [])?;
        debug!(removed, "Cleared session");
        Ok(())
    }

    /// Replace the roster snapshot with `members`, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_roster(&self, members: &[Member]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM roster_snapshot", [])?;
        {
            let mut insert = tx.prepare(
                r"
                INSERT INTO roster_snapshot (member_id, position, name, lat, lng, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;
            for (position, member) in members.iter().enumerate() {
                insert.execute(params![
                    member.id.to_string(),
                    i64::try_from(position).unwrap_or(i64::MAX),
                    member.name,
                    member.lat,
                    member.lng,
                    member.updated_at.map(|ts| ts.to_rfc3339()),
                ])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![ROSTER_FETCHED_AT_KEY, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        debug!(members = members.len(), "Saved roster snapshot");
        Ok(())
    }

    /// The roster snapshot in the order it was saved.
    ///
    /// Returns `None` if no snapshot was ever saved, and `Some` of an empty
    /// list if the last fetch returned no members.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_roster(&self) -> Result<Option<Vec<Member>>> {
        let conn = self.lock();
        if read_metadata(&conn, ROSTER_FETCHED_AT_KEY)?.is_none() {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            r"
            SELECT member_id, name, lat, lng, updated_at
            FROM roster_snapshot
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut members = Vec::new();
        for row in rows {
            let (id, name, lat, lng, updated_at) = row?;
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            members.push(Member {
                id,
                name,
                lat,
                lng,
                updated_at: updated_at.as_deref().and_then(parse_timestamp),
            });
        }
        Ok(Some(members))
    }

    /// Delete the session and the roster snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM session", [])?;
        tx.execute("DELETE FROM roster_snapshot", [])?;
        tx.execute(
            "DELETE FROM metadata WHERE key = ?1",
            [ROSTER_FETCHED_AT_KEY],
        )?;
        tx.commit()?;
        info!("Cleared local cache");
        Ok(())
    }

    /// Get cache statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.lock();

        let session: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT user_id, email, expires_at FROM session WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let roster_members: i64 =
            conn.query_row("SELECT COUNT(*) FROM roster_snapshot", [], |row| row.get(0))?;
        let roster_fetched_at =
            read_metadata(&conn, ROSTER_FETCHED_AT_KEY)?.and_then(|s| parse_timestamp(&s));

        let db_size_bytes = if self.path.as_os_str() == MEMORY_PATH {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        let (user_id, email, session_expires_at) = match session {
            Some((user_id, email, expires_at)) => {
                (Some(user_id), email, parse_timestamp(&expires_at))
            }
            None => (None, None, None),
        };

        Ok(CacheStats {
            user_id,
            email,
            session_expires_at,
            roster_members: usize::try_from(roster_members).unwrap_or(0),
            roster_fetched_at,
            db_size_bytes,
        })
    }
}

fn read_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Id of the remembered user.
    pub user_id: Option<String>,
    /// Email of the remembered user.
    pub email: Option<String>,
    /// When the remembered access token expires.
    pub session_expires_at: Option<DateTime<Utc>>,
    /// Members in the roster snapshot.
    pub roster_members: usize,
    /// When the roster snapshot was written.
    pub roster_fetched_at: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn create_test_store() -> LocalStore {
        LocalStore::open_in_memory().expect("failed to create test store")
    }

    fn test_session() -> Session {
        Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            user: User {
                id: Uuid::new_v4(),
                email: Some("mom@example.com".to_string()),
            },
        }
    }

    fn member(name: &str) -> Member {
        Member::new(Uuid::new_v4(), Some(name.to_string()))
    }

    #[test]
    fn test_open_in_memory() {
        let store = create_test_store();
        assert_eq!(store.path(), Path::new(":memory:"));
        assert!(store.load_session().unwrap().is_none());
        assert!(store.load_roster().unwrap().is_none());
    }

    #[test]
    fn test_session_roundtrip() {
        let store = create_test_store();
        let session = test_session();

        store.save_session(&session).unwrap();
        let loaded = store.load_session().unwrap().unwrap();

        assert_eq!(loaded.user, session.user);
        assert_eq!(loaded.access_token, "access");
        assert_eq!(loaded.refresh_token, "refresh");
        assert_eq!(loaded.expires_at.timestamp(), session.expires_at.timestamp());
    }

    #[test]
    fn test_save_session_replaces_previous() {
        let store = create_test_store();
        store.save_session(&test_session()).unwrap();

        let newer = test_session();
        store.save_session(&newer).unwrap();

        assert_eq!(store.load_session().unwrap().unwrap().user.id, newer.user.id);
        let rows: i64 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM session", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_session_without_email() {
        let store = create_test_store();
        let mut session = test_session();
        session.user.email = None;

        store.save_session(&session).unwrap();
        assert_eq!(store.load_session().unwrap().unwrap().user.email, None);
    }

    #[test]
    fn test_clear_session() {
        let store = create_test_store();
        store.save_session(&test_session()).unwrap();
        store.save_roster(&[member("Mom")]).unwrap();

        store.clear_session().unwrap();
        assert!(store.load_session().unwrap().is_none());
        assert_eq!(store.load_roster().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_session_is_ignored() {
        let store = create_test_store();
        store.save_session(&test_session()).unwrap();
        store
            .lock()
            .execute("UPDATE session SET expires_at = 'soon'", [])
            .unwrap();

        assert!(store.load_session().unwrap().is_none());
    }

    #[test]
    fn test_roster_keeps_order() {
        let store = create_test_store();
        let now = Utc::now();
        let members = vec![
            member("Zed").at(1.0, 2.0, now),
            member("Amy"),
            member("Kid").at(3.5, -4.25, now),
        ];

        store.save_roster(&members).unwrap();
        let loaded = store.load_roster().unwrap().unwrap();

        let names: Vec<_> = loaded.iter().map(Member::display_name).collect();
        assert_eq!(names, vec!["Zed", "Amy", "Kid"]);
        assert_eq!(loaded[0].id, members[0].id);
        assert_eq!(loaded[1].lat, None);
        assert_eq!(loaded[2].lng, Some(-4.25));
        assert_eq!(
            loaded[2].updated_at.map(|ts| ts.timestamp()),
            Some(now.timestamp())
        );
    }

    #[test]
    fn test_save_roster_replaces_snapshot() {
        let store = create_test_store();
        store.save_roster(&[member("Mom"), member("Dad")]).unwrap();
        store.save_roster(&[member("Kid")]).unwrap();

        let loaded = store.load_roster().unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].display_name(), "Kid");
    }

    #[test]
    fn test_empty_roster_is_not_missing() {
        let store = create_test_store();
        store.save_roster(&[]).unwrap();

        assert_eq!(store.load_roster().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_clear_wipes_everything() {
        let store = create_test_store();
        store.save_session(&test_session()).unwrap();
        store.save_roster(&[member("Mom")]).unwrap();

        store.clear().unwrap();

        assert!(store.load_session().unwrap().is_none());
        assert!(store.load_roster().unwrap().is_none());
        let stats = store.stats().unwrap();
        assert_eq!(stats.roster_members, 0);
        assert!(stats.roster_fetched_at.is_none());
    }

    #[test]
    fn test_stats_empty() {
        let store = create_test_store();
        let stats = store.stats().unwrap();

        assert!(stats.user_id.is_none());
        assert!(stats.email.is_none());
        assert!(stats.session_expires_at.is_none());
        assert_eq!(stats.roster_members, 0);
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_stats_with_data() {
        let store = create_test_store();
        let session = test_session();
        store.save_session(&session).unwrap();
        store.save_roster(&[member("Mom"), member("Dad")]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.user_id, Some(session.user.id.to_string()));
        assert_eq!(stats.email.as_deref(), Some("mom@example.com"));
        assert!(stats.session_expires_at.is_some());
        assert_eq!(stats.roster_members, 2);
        assert!(stats.roster_fetched_at.is_some());
    }

    #[test]
    fn test_shared_across_threads() {
        let store = Arc::new(create_test_store());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.save_roster(&[member(&format!("M{i}"))]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.load_roster().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_open_file_based() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("familymap_test_{}.db", std::process::id()));
        let session = test_session();

        {
            let store = LocalStore::open(&db_path).expect("failed to open file store");
            assert_eq!(store.path(), db_path);
            store.save_session(&session).unwrap();
        }

        // Reopen and check the session survived
        {
            let store = LocalStore::open(&db_path).expect("failed to reopen file store");
            let loaded = store.load_session().unwrap().unwrap();
            assert_eq!(loaded.user.id, session.user.id);
            assert!(store.stats().unwrap().db_size_bytes > 0);
        }

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp_dir = std::env::temp_dir();
        let root = temp_dir.join(format!("familymap_nested_{}", std::process::id()));
        let nested_path = root.join("a").join("b").join("cache.db");

        let store = LocalStore::open(&nested_path).expect("failed to open nested store");
        assert!(nested_path.exists());
        drop(store);

        let _ = std::fs::remove_dir_all(&root);
    }
}
