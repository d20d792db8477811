//! Family roster.
//!
//! A [`Member`] is one row of the shared location table. The
//! [`RosterFetcher`] selects every row and publishes the result as the
//! current roster; a failed fetch leaves the previous roster in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::backend::MemberStore;
use crate::device::Position;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::storage::LocalStore;

/// Shown for members without a name.
pub const ANONYMOUS: &str = "Anonymous";

/// Shown when a timestamp is missing.
pub const NOT_AVAILABLE: &str = "N/A";

/// One member's row in the location table.
///
/// Coordinates that are missing or not numbers deserialize as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Member (user) id.
    pub id: Uuid,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Latitude in degrees.
    #[serde(default, deserialize_with = "lenient_number")]
    pub lat: Option<f64>,
    /// Longitude in degrees.
    #[serde(default, deserialize_with = "lenient_number")]
    pub lng: Option<f64>,
    /// When the row was last written.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| v.as_f64())
        .filter(|n| n.is_finite()))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

impl Member {
    /// Create a member row.
    #[must_use]
    pub fn new(id: Uuid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            lat: None,
            lng: None,
            updated_at: None,
        }
    }

    /// Set coordinates and timestamp.
    #[must_use]
    pub fn at(mut self, lat: f64, lng: f64, updated_at: DateTime<Utc>) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self.updated_at = Some(updated_at);
        self
    }

    /// The member's position, if both coordinates are present and valid.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        Position::new(self.lat?, self.lng?)
    }

    /// Name to display, or `"Anonymous"`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(ANONYMOUS)
    }

    /// Upper-cased first character of the display name, or `'?'`.
    #[must_use]
    pub fn initial(&self) -> String {
        self.display_name()
            .chars()
            .next()
            .map_or_else(|| "?".to_string(), |c| c.to_uppercase().collect())
    }

    /// Local time of the last update, or `"N/A"`.
    #[must_use]
    pub fn last_seen(&self) -> String {
        self.updated_at.map_or_else(
            || NOT_AVAILABLE.to_string(),
            |dt| dt.with_timezone(&Local).format("%H:%M:%S").to_string(),
        )
    }
}

/// Parse rows returned by the backend.
///
/// Rows without a usable id are dropped.
#[must_use]
pub fn parse_members(rows: Vec<Value>) -> Vec<Member> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<Member>(row) {
            Ok(member) => Some(member),
            Err(e) => {
                trace!(error = %e, "Dropping unparsable member row");
                None
            }
        })
        .collect()
}

/// A location row write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    /// The signed-in user's id.
    pub id: Uuid,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Write time.
    pub updated_at: DateTime<Utc>,
}

impl LocationUpdate {
    /// An update placing `id` at `position` now.
    #[must_use]
    pub fn new(id: Uuid, position: Position) -> Self {
        Self {
            id,
            lat: position.lat,
            lng: position.lng,
            updated_at: Utc::now(),
        }
    }

    /// The written position.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        Position::new(self.lat, self.lng)
    }
}

/// Fetches the roster and publishes it.
pub struct RosterFetcher {
    store: Arc<dyn MemberStore>,
    session: watch::Receiver<Option<Session>>,
    roster: watch::Sender<Vec<Member>>,
    cache: Option<Arc<LocalStore>>,
    fetches: AtomicU64,
}

impl std::fmt::Debug for RosterFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterFetcher")
            .field("members", &self.roster.borrow().len())
            .field("fetches", &self.fetch_count())
            .finish_non_exhaustive()
    }
}

impl RosterFetcher {
    /// Create a fetcher with an empty roster.
    #[must_use]
    pub fn new(
        store: Arc<dyn MemberStore>,
        session: watch::Receiver<Option<Session>>,
        cache: Option<Arc<LocalStore>>,
    ) -> Self {
        let (roster, _) = watch::channel(Vec::new());
        Self {
            store,
            session,
            roster,
            cache,
            fetches: AtomicU64::new(0),
        }
    }

    /// Observe the roster.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Member>> {
        self.roster.subscribe()
    }

    /// The current roster.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.roster.borrow().clone()
    }

    /// Number of fetches issued so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Select every member row and replace the roster with the result.
    ///
    /// On failure the error is logged and the roster is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSignedIn`] without a session, or the backend error.
    pub async fn refresh(&self) -> Result<usize> {
        let session = self.session.borrow().clone().ok_or(Error::NotSignedIn)?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        match self.store.fetch_members(&session).await {
            Ok(members) => {
                let count = members.len();
                debug!(count, "Fetched roster");
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.save_roster(&members) {
                        warn!(error = %e, "Could not cache roster");
                    }
                }
                self.roster.send_replace(members);
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "Roster fetch failed, keeping previous roster");
                Err(e)
            }
        }
    }

    /// Publish the cached roster, if any, while the first fetch is pending.
    ///
    /// Returns the number of members loaded.
    pub fn load_cached(&self) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        match cache.load_roster() {
            Ok(Some(members)) => {
                let count = members.len();
                self.roster.send_replace(members);
                count
            }
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Could not read cached roster");
                0
            }
        }
    }

    /// Empty the roster.
    pub fn clear(&self) {
        self.roster.send_replace(Vec::new());
    }
}
