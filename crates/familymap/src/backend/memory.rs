//! In-process backend.
//!
//! [`MemoryBackend`] keeps accounts, sessions and the location table in
//! memory and broadcasts row changes to its subscribers. It backs the test
//! suite, which never needs a hosted project.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    AuthBackend, ChangeEvent, ChangeFeed, ChangeKind, ChangeSubscription, MemberStore,
};
use crate::error::{Error, Result};
use crate::roster::{LocationUpdate, Member};
use crate::session::{Credentials, Session, SignUpOutcome, User};

/// Lifetime of issued access tokens.
const SESSION_LIFETIME: chrono::Duration = chrono::Duration::hours(1);

/// Capacity of the change broadcast channel.
const CHANGE_CAPACITY: usize = 64;

/// Capacity of each subscription's event channel.
const SUBSCRIPTION_CAPACITY: usize = 32;

#[derive(Debug)]
struct Account {
    id: Uuid,
    password: String,
    confirmed: bool,
}

#[derive(Debug)]
struct State {
    accounts: HashMap<String, Account>,
    access_tokens: HashMap<String, Uuid>,
    refresh_tokens: HashMap<String, (Uuid, Option<String>)>,
    rows: Vec<Member>,
    upserts: Vec<LocationUpdate>,
    autoconfirm: bool,
    offline: bool,
    fail_fetches: bool,
    auth_calls: u64,
    fetch_calls: u64,
}

/// A backend living entirely in this process.
///
/// Clones share state, so a test can keep one clone to inspect and drive
/// the backend while the app owns another.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<ChangeEvent>,
    table: Arc<str>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend serving the `profiles` table.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State {
                accounts: HashMap::new(),
                access_tokens: HashMap::new(),
                refresh_tokens: HashMap::new(),
                rows: Vec::new(),
                upserts: Vec::new(),
                autoconfirm: false,
                offline: false,
                fail_fetches: false,
                auth_calls: 0,
                fetch_calls: 0,
            })),
            changes,
            table: Arc::from("profiles"),
        }
    }

    /// Sign users in straight after sign-up instead of asking for email
    /// confirmation.
    #[must_use]
    pub fn with_autoconfirm(self, autoconfirm: bool) -> Self {
        self.lock().autoconfirm = autoconfirm;
        self
    }

    /// Serve `table` instead of `profiles`.
    #[must_use]
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Arc::from(table);
        self
    }

    /// Create a confirmed account. Returns its user id.
    pub fn register(&self, email: &str, password: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().accounts.insert(
            email.to_string(),
            Account {
                id,
                password: password.to_string(),
                confirmed: true,
            },
        );
        id
    }

    /// Confirm a pending account. Returns `false` for unknown emails.
    pub fn confirm(&self, email: &str) -> bool {
        self.lock()
            .accounts
            .get_mut(email)
            .map(|account| account.confirmed = true)
            .is_some()
    }

    /// A well-formed session the backend has never issued.
    #[must_use]
    pub fn issue_session(user_id: Uuid, email: &str) -> Session {
        Session {
            access_token: format!("access-{}", Uuid::new_v4()),
            refresh_token: format!("refresh-{}", Uuid::new_v4()),
            expires_at: Utc::now() + SESSION_LIFETIME,
            user: User {
                id: user_id,
                email: Some(email.to_string()),
            },
        }
    }

    /// Insert a row without notifying subscribers.
    pub fn seed_member(&self, member: Member) {
        let mut state = self.lock();
        state.rows.retain(|row| row.id != member.id);
        state.rows.push(member);
    }

    /// Notify subscribers of a change made elsewhere.
    ///
    /// Returns the number of subscribers notified.
    pub fn emit_change(&self, kind: ChangeKind, record: Option<serde_json::Value>) -> usize {
        self.changes
            .send(ChangeEvent {
                kind,
                table: self.table.to_string(),
                record,
            })
            .unwrap_or(0)
    }

    /// Make every call fail as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make roster fetches fail.
    pub fn fail_fetches(&self, fail: bool) {
        self.lock().fail_fetches = fail;
    }

    /// Number of auth calls received.
    #[must_use]
    pub fn auth_calls(&self) -> u64 {
        self.lock().auth_calls
    }

    /// Number of roster fetches received.
    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.lock().fetch_calls
    }

    /// Every location write received, oldest first.
    #[must_use]
    pub fn upserts(&self) -> Vec<LocationUpdate> {
        self.lock().upserts.clone()
    }

    /// The current rows.
    #[must_use]
    pub fn rows(&self) -> Vec<Member> {
        self.lock().rows.clone()
    }

    /// Number of open change subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(state: &State) -> Result<()> {
        if state.offline {
            Err(Error::backend(503, "backend unreachable"))
        } else {
            Ok(())
        }
    }

    fn authorize(state: &State, session: &Session) -> Result<Uuid> {
        Self::online(state)?;
        state
            .access_tokens
            .get(&session.access_token)
            .copied()
            .ok_or_else(|| Error::backend(401, "JWT expired"))
    }

    fn open_session(state: &mut State, id: Uuid, email: Option<String>) -> Session {
        let mut session = Self::issue_session(id, "");
        session.user.email = email;
        state.access_tokens.insert(session.access_token.clone(), id);
        state
            .refresh_tokens
            .insert(session.refresh_token.clone(), (id, session.user.email.clone()));
        session
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn sign_up(&self, credentials: &Credentials) -> Result<SignUpOutcome> {
        let mut state = self.lock();
        state.auth_calls += 1;
        Self::online(&state)?;

        if state.accounts.contains_key(&credentials.email) {
            return Err(Error::auth("User already registered"));
        }

        let id = Uuid::new_v4();
        let confirmed = state.autoconfirm;
        state.accounts.insert(
            credentials.email.clone(),
            Account {
                id,
                password: credentials.password.clone(),
                confirmed,
            },
        );

        if confirmed {
            let session = Self::open_session(&mut state, id, Some(credentials.email.clone()));
            Ok(SignUpOutcome::SignedIn(session))
        } else {
            Ok(SignUpOutcome::ConfirmationRequired {
                email: credentials.email.clone(),
            })
        }
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        let mut state = self.lock();
        state.auth_calls += 1;
        Self::online(&state)?;

        let (id, confirmed) = match state.accounts.get(&credentials.email) {
            Some(account) if account.password == credentials.password => {
                (account.id, account.confirmed)
            }
            _ => return Err(Error::auth("Invalid login credentials")),
        };
        if !confirmed {
            return Err(Error::auth("Email not confirmed"));
        }
        Ok(Self::open_session(
            &mut state,
            id,
            Some(credentials.email.clone()),
        ))
    }

    async fn sign_out(&self, session: &Session) -> Result<()> {
        let mut state = self.lock();
        state.auth_calls += 1;
        Self::online(&state)?;
        state.access_tokens.remove(&session.access_token);
        state.refresh_tokens.remove(&session.refresh_token);
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let mut state = self.lock();
        state.auth_calls += 1;
        Self::online(&state)?;

        let (id, email) = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| Error::auth("Invalid Refresh Token: Refresh Token Not Found"))?;
        Ok(Self::open_session(&mut state, id, email))
    }
}

#[async_trait]
impl MemberStore for MemoryBackend {
    async fn fetch_members(&self, session: &Session) -> Result<Vec<Member>> {
        let mut state = self.lock();
        state.fetch_calls += 1;
        Self::authorize(&state, session)?;
        if state.fail_fetches {
            return Err(Error::backend(500, "fetch failed"));
        }
        Ok(state.rows.clone())
    }

    async fn upsert_location(&self, session: &Session, update: &LocationUpdate) -> Result<()> {
        let (kind, record) = {
            let mut state = self.lock();
            let caller = Self::authorize(&state, session)?;
            if caller != update.id {
                return Err(Error::backend(
                    403,
                    "new row violates row-level security policy",
                ));
            }

            state.upserts.push(*update);
            let existing = state.rows.iter_mut().find(|row| row.id == update.id);
            let (kind, member) = match existing {
                Some(row) => {
                    row.lat = Some(update.lat);
                    row.lng = Some(update.lng);
                    row.updated_at = Some(update.updated_at);
                    (ChangeKind::Update, row.clone())
                }
                None => {
                    let member = Member::new(update.id, None).at(
                        update.lat,
                        update.lng,
                        update.updated_at,
                    );
                    state.rows.push(member.clone());
                    (ChangeKind::Insert, member)
                }
            };
            (kind, serde_json::to_value(member)?)
        };

        debug!(id = %update.id, kind = %kind, "Stored location");
        self.emit_change(kind, Some(record));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        table: &str,
        _session: watch::Receiver<Option<Session>>,
    ) -> Result<ChangeSubscription> {
        Self::online(&self.lock())?;

        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let wanted = table.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    change = changes.recv() => match change {
                        Ok(event) if event.table == wanted => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Change subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(ChangeSubscription::new(table, rx, stop_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Position;

    async fn signed_in(backend: &MemoryBackend) -> Session {
        backend.register("a@example.com", "secret1");
        backend
            .sign_in(&Credentials::new("a@example.com", "secret1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sign_in_unconfirmed_account() {
        let backend = MemoryBackend::new();
        let creds = Credentials::new("new@example.com", "secret1");

        let outcome = backend.sign_up(&creds).await.unwrap();
        assert!(matches!(outcome, SignUpOutcome::ConfirmationRequired { .. }));
        assert_eq!(
            backend.sign_in(&creds).await.unwrap_err().to_string(),
            "Email not confirmed"
        );

        assert!(backend.confirm("new@example.com"));
        assert!(backend.sign_in(&creds).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_sign_up() {
        let backend = MemoryBackend::new();
        backend.register("a@example.com", "secret1");
        let err = backend
            .sign_up(&Credentials::new("a@example.com", "secret1"))
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;

        let refreshed = backend.refresh(&session.refresh_token).await.unwrap();
        assert_eq!(refreshed.user.id, session.user.id);
        assert!(backend.refresh(&session.refresh_token).await.is_err());

        assert!(backend.fetch_members(&refreshed).await.is_ok());
        assert!(backend.fetch_members(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_signed_out_token_is_rejected() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        backend.sign_out(&session).await.unwrap();

        let err = backend.fetch_members(&session).await.unwrap_err();
        assert!(matches!(err, Error::Backend { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_id() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let id = session.user_id();

        let first = LocationUpdate::new(id, Position::new(1.0, 1.0).unwrap());
        let second = LocationUpdate::new(id, Position::new(2.0, 2.0).unwrap());
        backend.upsert_location(&session, &first).await.unwrap();
        backend.upsert_location(&session, &second).await.unwrap();

        let rows = backend.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lat, Some(2.0));
        assert_eq!(backend.upserts().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_for_other_user_is_rejected() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let update = LocationUpdate::new(Uuid::new_v4(), Position::new(1.0, 1.0).unwrap());

        let err = backend.upsert_location(&session, &update).await.unwrap_err();
        assert!(matches!(err, Error::Backend { status: 403, .. }));
        assert!(backend.upserts().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_receives_upserts() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let (_tx, rx) = watch::channel(Some(session.clone()));

        let mut subscription = backend.subscribe("profiles", rx).await.unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        let update = LocationUpdate::new(session.user_id(), Position::new(1.0, 1.0).unwrap());
        backend.upsert_location(&session, &update).await.unwrap();

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.table, "profiles");

        subscription.unsubscribe().await;
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_filters_tables() {
        let backend = MemoryBackend::new().with_table("locations");
        let (_tx, rx) = watch::channel(None);

        let mut subscription = backend.subscribe("profiles", rx).await.unwrap();
        backend.emit_change(ChangeKind::Update, None);

        let received =
            tokio::time::timeout(std::time::Duration::from_millis(50), subscription.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_offline_backend_fails_everything() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        backend.set_offline(true);

        assert!(backend.fetch_members(&session).await.is_err());
        assert!(backend.sign_out(&session).await.is_err());
        let (_tx, rx) = watch::channel(None);
        assert!(backend.subscribe("profiles", rx).await.is_err());
    }
}
