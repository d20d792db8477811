//! Session management.
//!
//! [`SessionManager`] owns the current [`Session`]. Every other component
//! reads it through a `watch` receiver and never mutates it. Auth-state
//! changes are also published as [`AuthEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::backend::AuthBackend;
use crate::error::{Error, Result};
use crate::storage::LocalStore;

/// Refresh a session this long before it expires.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Shown after a sign-up that needs email confirmation.
pub const CONFIRMATION_PROMPT: &str = "Check your email for the confirmation link!";

/// Capacity of the auth event channel.
const EVENT_CAPACITY: usize = 16;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id, also the key of the member's location row.
    pub id: Uuid,
    /// Email address, when the auth service reports one.
    #[serde(default)]
    pub email: Option<String>,
}

/// Proof of authenticated identity issued by the auth service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token for backend requests.
    pub access_token: String,
    /// Token used to obtain a new session.
    pub refresh_token: String,
    /// When `access_token` stops being accepted.
    pub expires_at: DateTime<Utc>,
    /// Who this session belongs to.
    pub user: User,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

impl Session {
    /// Id of the signed-in user.
    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    /// Check whether the access token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check whether the access token expires within `margin`.
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_add_signed(margin)
            .map_or(true, |deadline| self.expires_at <= deadline)
    }
}

/// Email and password as typed by the user.
#[derive(Clone, Serialize, Validate)]
pub struct Credentials {
    /// Account email.
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    /// Account password.
    #[validate(length(min = 6, message = "Password should be at least 6 characters"))]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Create credentials.
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into().trim().to_string(),
            password: password.into(),
        }
    }

    /// Validate the credentials before sending them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] naming the failing field.
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|e| Error::InvalidCredentials {
            message: e.to_string(),
        })
    }
}

/// Result of a sign-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The project auto-confirms accounts; the user is signed in.
    SignedIn(Session),
    /// A confirmation email was sent; no session exists yet.
    ConfirmationRequired {
        /// Where the confirmation link went.
        email: String,
    },
}

/// An auth-state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// The session restored at startup, if any.
    InitialSession(Option<Session>),
    /// A user signed in.
    SignedIn(Session),
    /// The user signed out or the session could not be kept.
    SignedOut,
    /// The access token was refreshed.
    TokenRefreshed(Session),
}

/// Owns the current session and wraps the auth backend.
pub struct SessionManager {
    backend: Arc<dyn AuthBackend>,
    store: Option<Arc<LocalStore>>,
    state: watch::Sender<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
    refresh_margin: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("signed_in", &self.state.borrow().is_some())
            .field("persistent", &self.store.is_some())
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with no session.
    ///
    /// With a `store`, sessions survive restarts.
    #[must_use]
    pub fn new(backend: Arc<dyn AuthBackend>, store: Option<Arc<LocalStore>>) -> Self {
        let (state, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            store,
            state,
            events,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Observe the current session.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    /// Observe auth-state changes.
    #[must_use]
    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// The current session, if signed in.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    /// Restore any persisted session.
    ///
    /// A session close to expiry is refreshed first. A failed refresh keeps
    /// the cached session unless it has already expired.
    pub async fn start(&self) -> Option<Session> {
        let restored = match self.restore().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not restore session, starting signed out");
                None
            }
        };

        if let Some(session) = &restored {
            info!(user = %session.user_id(), "Restored session");
        }
        self.state.send_replace(restored.clone());
        self.emit(AuthEvent::InitialSession(restored.clone()));
        restored
    }

    async fn restore(&self) -> Result<Option<Session>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(cached) = store.load_session()? else {
            return Ok(None);
        };
        if !cached.expires_within(self.refresh_margin) {
            return Ok(Some(cached));
        }

        debug!("Cached session is about to expire, refreshing");
        match self.backend.refresh(&cached.refresh_token).await {
            Ok(session) => {
                self.persist(&session);
                Ok(Some(session))
            }
            Err(e) if cached.is_expired() => {
                self.forget();
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Could not refresh cached session, keeping it until expiry");
                Ok(Some(cached))
            }
        }
    }

    /// Sign in with email and password.
    ///
    /// # Errors
    ///
    /// Returns an auth error if the credentials are invalid or rejected.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        credentials.check()?;
        let session = self.backend.sign_in(credentials).await?;
        info!(user = %session.user_id(), "Signed in");
        self.establish(session.clone(), AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Register a new account.
    ///
    /// When the backend asks for email confirmation the manager stays signed
    /// out and the caller shows [`CONFIRMATION_PROMPT`].
    ///
    /// # Errors
    ///
    /// Returns an auth error if the credentials are invalid or rejected.
    pub async fn sign_up(&self, credentials: &Credentials) -> Result<SignUpOutcome> {
        credentials.check()?;
        let outcome = self.backend.sign_up(credentials).await?;
        match &outcome {
            SignUpOutcome::SignedIn(session) => {
                info!(user = %session.user_id(), "Signed up and signed in");
                self.establish(session.clone(), AuthEvent::SignedIn(session.clone()));
            }
            SignUpOutcome::ConfirmationRequired { email } => {
                info!(email = %email, "Sign-up needs email confirmation");
            }
        }
        Ok(outcome)
    }

    /// Sign out.
    ///
    /// A failed backend call is logged; the local session and the cached
    /// roster are cleared anyway.
    pub async fn sign_out(&self) {
        let Some(session) = self.current() else {
            debug!("Sign-out requested without a session");
            return;
        };

        if let Err(e) = self.backend.sign_out(&session).await {
            warn!(error = %e, "Backend sign-out failed, clearing local session anyway");
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                warn!(error = %e, "Could not clear local cache");
            }
        }
        self.state.send_replace(None);
        self.emit(AuthEvent::SignedOut);
        info!(user = %session.user_id(), "Signed out");
    }

    /// Refresh the current session.
    ///
    /// If the refresh fails and the session has already expired, the manager
    /// signs out locally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSignedIn`] without a session, or the backend error.
    pub async fn refresh(&self) -> Result<Session> {
        let current = self.current().ok_or(Error::NotSignedIn)?;
        match self.backend.refresh(&current.refresh_token).await {
            Ok(session) => {
                debug!(user = %session.user_id(), "Refreshed session");
                self.establish(session.clone(), AuthEvent::TokenRefreshed(session.clone()));
                Ok(session)
            }
            Err(e) => {
                if current.is_expired() {
                    warn!(error = %e, "Session expired and could not be refreshed");
                    self.forget();
                    self.state.send_replace(None);
                    self.emit(AuthEvent::SignedOut);
                }
                Err(e)
            }
        }
    }

    /// Keep the session fresh in the background.
    ///
    /// Every `check_every`, a session within the refresh margin of expiry is
    /// refreshed. The task runs until aborted.
    pub fn spawn_auto_refresh(self: &Arc<Self>, check_every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            loop {
                ticker.tick().await;
                let due = manager
                    .current()
                    .is_some_and(|s| s.expires_within(manager.refresh_margin));
                if due {
                    if let Err(e) = manager.refresh().await {
                        warn!(error = %e, "Automatic session refresh failed");
                    }
                }
            }
        })
    }

    fn establish(&self, session: Session, event: AuthEvent) {
        self.persist(&session);
        self.state.send_replace(Some(session));
        self.emit(event);
    }

    fn persist(&self, session: &Session) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(session) {
                warn!(error = %e, "Could not cache session");
            }
        }
    }

    fn forget(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_session() {
                warn!(error = %e, "Could not clear cached session");
            }
        }
    }

    fn emit(&self, event: AuthEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
