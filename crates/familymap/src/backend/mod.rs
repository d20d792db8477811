//! Backend collaborators.
//!
//! The app talks to its backend through three traits: [`AuthBackend`] for
//! identity, [`MemberStore`] for the location table and [`ChangeFeed`] for
//! table change notifications. [`supabase`] and [`realtime`] implement them
//! against a hosted Supabase project; [`memory`] implements them in-process.

pub mod memory;
pub mod realtime;
pub mod supabase;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::roster::{LocationUpdate, Member};
use crate::session::{Credentials, Session, SignUpOutcome};

pub use memory::MemoryBackend;
pub use realtime::RealtimeFeed;
pub use supabase::SupabaseClient;

/// How long unsubscribing waits for the feed task to finish.
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity operations of the backend auth service.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Register a new account.
    async fn sign_up(&self, credentials: &Credentials) -> Result<SignUpOutcome>;

    /// Exchange email and password for a session.
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session>;

    /// Revoke the session on the server.
    async fn sign_out(&self, session: &Session) -> Result<()>;

    /// Exchange a refresh token for a new session.
    async fn refresh(&self, refresh_token: &str) -> Result<Session>;
}

/// Access to the shared member location table.
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Select every member row.
    async fn fetch_members(&self, session: &Session) -> Result<Vec<Member>>;

    /// Insert or update the row keyed by `update.id`.
    async fn upsert_location(&self, session: &Session, update: &LocationUpdate) -> Result<()>;
}

/// Change notifications on a table.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to every change on `table`.
    ///
    /// The feed follows `session` so a refreshed access token reaches the
    /// open channel.
    async fn subscribe(
        &self,
        table: &str,
        session: watch::Receiver<Option<Session>>,
    ) -> Result<ChangeSubscription>;
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened to the row.
    pub kind: ChangeKind,
    /// Table the row belongs to.
    pub table: String,
    /// The row after the change (before it, for deletes), when sent.
    pub record: Option<serde_json::Value>,
}

/// An open change subscription.
///
/// Events arrive on [`ChangeSubscription::recv`] until the subscription is
/// closed with [`ChangeSubscription::unsubscribe`] or dropped.
#[derive(Debug)]
pub struct ChangeSubscription {
    table: String,
    events: mpsc::Receiver<ChangeEvent>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChangeSubscription {
    /// Wrap a feed task that forwards events into `events` and stops when
    /// `stop` fires.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        events: mpsc::Receiver<ChangeEvent>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            table: table.into(),
            events,
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Table this subscription watches.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Wait for the next change. Returns `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Close the subscription and wait briefly for the feed to leave cleanly.
    pub async fn unsubscribe(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.events.close();

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!(table = %self.table, "Change feed did not stop in time, aborting");
                task.abort();
            }
        }
        debug!(table = %self.table, "Unsubscribed from changes");
    }

    /// Check whether the subscription still has a running feed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
