//! Application orchestrator.
//!
//! [`App`] follows the session: when one appears it starts publishing the
//! device position, listens for roster changes and fetches the roster; when
//! it ends everything is torn down again. Every roster, session or position
//! change redraws the map surface and the shell view.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{AuthBackend, ChangeFeed, MemberStore, RealtimeFeed, SupabaseClient};
use crate::config::{Config, SourceKind};
use crate::device::{
    FixedPositionSource, GpsdPositionSource, Position, PositionFix, PositionSource,
};
use crate::error::{Error, Result};
use crate::map::{HtmlFileSurface, MapRenderer, MapSurface, PageOptions};
use crate::publisher::{LocationPublisher, PublisherHandle};
use crate::roster::RosterFetcher;
use crate::session::{AuthEvent, Credentials, Session, SessionManager};
use crate::storage::LocalStore;
use crate::subscriber::{RealtimeSubscriber, SubscriberHandle};
use crate::ui::{guard, render_view, AuthForm, ViewSink};

/// How often the session is checked for an upcoming expiry.
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// The backend collaborators the app talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Authentication.
    pub auth: Arc<dyn AuthBackend>,
    /// Member rows.
    pub members: Arc<dyn MemberStore>,
    /// Row change notifications.
    pub feed: Arc<dyn ChangeFeed>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Use one backend for everything.
    pub fn shared<B>(backend: B) -> Self
    where
        B: AuthBackend + MemberStore + ChangeFeed + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            auth: Arc::clone(&backend) as Arc<dyn AuthBackend>,
            members: Arc::clone(&backend) as Arc<dyn MemberStore>,
            feed: backend,
        }
    }

    /// Connect to the Supabase project named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is not configured or its URL is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.require_backend()?;
        let client = Arc::new(SupabaseClient::new(&config.backend)?);
        let feed = RealtimeFeed::new(&config.backend)?;
        Ok(Self {
            auth: Arc::clone(&client) as Arc<dyn AuthBackend>,
            members: client,
            feed: Arc::new(feed),
        })
    }
}

/// Build the position source selected in `config`.
///
/// The fixed source repeats its position once per `maximum_age`.
///
/// # Errors
///
/// Returns an error if the fixed source is selected without valid coordinates.
pub fn position_source(config: &Config) -> Result<Arc<dyn PositionSource>> {
    match config.location.source {
        SourceKind::Gpsd => Ok(Arc::new(GpsdPositionSource::new(
            config.location.gpsd_addr.clone(),
        ))),
        SourceKind::Fixed => {
            let position = config
                .location
                .fixed_lat
                .zip(config.location.fixed_lng)
                .and_then(|(lat, lng)| Position::new(lat, lng))
                .ok_or_else(|| Error::ConfigValidation {
                    message: "location.fixed_lat and location.fixed_lng must be valid coordinates"
                        .to_string(),
                })?;
            Ok(Arc::new(FixedPositionSource::new(
                position,
                config.watch_options().maximum_age,
            )))
        }
    }
}

/// The per-session workers.
#[derive(Debug)]
struct Active {
    user: Uuid,
    publisher: PublisherHandle,
    subscriber: Option<SubscriberHandle>,
}

/// Ties the session, publisher, subscriber, roster and views together.
pub struct App {
    sessions: Arc<SessionManager>,
    roster: Arc<RosterFetcher>,
    publisher: LocationPublisher,
    subscriber: Option<RealtimeSubscriber>,
    renderer: MapRenderer,
    surface: Box<dyn MapSurface>,
    sink: Box<dyn ViewSink>,
    form: AuthForm,
    last_position: watch::Receiver<Option<PositionFix>>,
    active: Option<Active>,
    started: bool,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("sessions", &self.sessions)
            .field("surface", &self.surface.name())
            .field("realtime", &self.subscriber.is_some())
            .field("active", &self.active.as_ref().map(|a| a.user))
            .finish_non_exhaustive()
    }
}

impl App {
    /// Assemble an app from its collaborators.
    #[must_use]
    pub fn new(
        config: &Config,
        backend: Collaborators,
        source: Arc<dyn PositionSource>,
        cache: Option<Arc<LocalStore>>,
        surface: Box<dyn MapSurface>,
        sink: Box<dyn ViewSink>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(backend.auth, cache.clone()));
        let roster_cache = cache.filter(|_| config.storage.cache_roster);
        let roster = Arc::new(RosterFetcher::new(
            Arc::clone(&backend.members),
            sessions.subscribe(),
            roster_cache,
        ));
        let publisher = LocationPublisher::new(source, backend.members, config.watch_options());
        let subscriber = config.realtime.enabled.then(|| {
            RealtimeSubscriber::new(backend.feed, Arc::clone(&roster), &config.backend.table)
                .with_debounce(config.debounce())
        });
        let last_position = publisher.last_position();

        Self {
            sessions,
            roster,
            publisher,
            subscriber,
            renderer: MapRenderer::from_config(&config.map),
            surface,
            sink,
            form: AuthForm::new(),
            last_position,
            active: None,
            started: false,
        }
    }

    /// Assemble the app described by `config`: Supabase, the configured
    /// position source, the on-disk cache and the HTML map page.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend, position source or cache cannot be set up.
    pub fn from_config(config: &Config, sink: Box<dyn ViewSink>) -> Result<Self> {
        let backend = Collaborators::from_config(config)?;
        let source = position_source(config)?;
        let cache = Arc::new(LocalStore::open(config.database_path())?);
        let surface = HtmlFileSurface::new(
            config.map_output_path(),
            PageOptions::from_config(&config.map),
        );
        Ok(Self::new(
            config,
            backend,
            source,
            Some(cache),
            Box::new(surface),
            sink,
        ))
    }

    /// The session manager, for signing in and out.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    /// The roster fetcher.
    #[must_use]
    pub fn roster(&self) -> Arc<RosterFetcher> {
        Arc::clone(&self.roster)
    }

    /// Check whether the per-session workers are running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Restore the session and show the first view.
    ///
    /// The cached roster is shown until the first fetch completes.
    pub async fn start(&mut self) {
        self.started = true;
        let restored = self.sessions.start().await;
        if restored.is_some() {
            let cached = self.roster.load_cached();
            debug!(cached, "Loaded cached roster");
        }
        self.sync().await;
        self.redraw();
    }

    /// Run until `shutdown` resolves, then tear everything down.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth event stream closes unexpectedly.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut auth_events = self.sessions.on_auth_state_change();
        let mut roster = self.roster.subscribe();
        let mut position = self.last_position.clone();
        if !self.started {
            self.start().await;
        }

        let refresher = self.sessions.spawn_auto_refresh(REFRESH_CHECK_INTERVAL);
        tokio::pin!(shutdown);
        info!("Running");

        let result = loop {
            tokio::select! {
                () = &mut shutdown => break Ok(()),
                event = auth_events.recv() => match event {
                    Ok(event) => self.on_auth_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Auth events lagged, resyncing");
                        self.sync().await;
                        self.redraw();
                    }
                    Err(RecvError::Closed) => {
                        break Err(Error::internal("auth event stream closed"));
                    }
                },
                changed = roster.changed() => {
                    if changed.is_err() {
                        break Err(Error::internal("roster stream closed"));
                    }
                    self.redraw();
                }
                changed = position.changed() => {
                    if changed.is_ok() {
                        self.redraw();
                    }
                }
            }
        };

        refresher.abort();
        self.deactivate().await;
        info!("Stopped");
        result
    }

    /// Submit the sign-in form with `credentials`.
    ///
    /// The form is redrawn as processing while the request is in flight.
    /// Returns the session when the user ends up signed in; otherwise the
    /// form carries the error or the confirmation prompt.
    pub async fn submit(&mut self, credentials: &Credentials) -> Option<Session> {
        let mode = self.form.begin();
        self.redraw();
        let outcome = AuthForm::send(mode, &self.sessions, credentials).await;
        let session = self.form.finish(outcome);
        self.sync().await;
        self.redraw();
        session
    }

    /// Switch the sign-in form between signing in and signing up.
    pub fn toggle_form(&mut self) {
        self.form.toggle_mode();
        self.redraw();
    }

    /// The sign-in form.
    #[must_use]
    pub fn form(&self) -> &AuthForm {
        &self.form
    }

    async fn on_auth_event(&mut self, event: &AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) => debug!(user = %session.user_id(), "Auth: signed in"),
            AuthEvent::SignedOut => debug!("Auth: signed out"),
            AuthEvent::TokenRefreshed(_) => debug!("Auth: token refreshed"),
            AuthEvent::InitialSession(_) => debug!("Auth: initial session"),
        }
        self.sync().await;
        self.redraw();
    }

    /// Start or stop the per-session workers to match the current session.
    pub async fn sync(&mut self) {
        let current = self.sessions.current().map(|s| s.user_id());
        let running = self.active.as_ref().map(|a| a.user);
        match (current, running) {
            (Some(user), Some(active)) if user == active => {}
            (Some(_), Some(_)) => {
                self.deactivate().await;
                self.activate().await;
            }
            (Some(_), None) => self.activate().await,
            (None, Some(_)) => self.deactivate().await,
            (None, None) => {}
        }
    }

    async fn activate(&mut self) {
        let session = self.sessions.subscribe();
        let Some(user) = session.borrow().as_ref().map(|s| s.user_id()) else {
            return;
        };

        let publisher = match self.publisher.start(session.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Could not start publishing location");
                return;
            }
        };

        let subscriber = match &self.subscriber {
            Some(subscriber) => match subscriber.start(session).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Could not subscribe to roster changes");
                    None
                }
            },
            None => None,
        };

        self.active = Some(Active {
            user,
            publisher,
            subscriber,
        });
        info!(user = %user, "Session active");

        // Failures are logged by the fetcher
        let _ = self.roster.refresh().await;
    }

    async fn deactivate(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.publisher.stop();
        if let Some(subscriber) = active.subscriber.take() {
            subscriber.stop().await;
        }
        self.roster.clear();
        self.renderer.reset();
        info!(user = %active.user, "Session inactive");
    }

    /// Redraw the map surface and the shell view.
    pub fn redraw(&mut self) {
        let session = self.sessions.current();
        let members = self.roster.members();
        let own_position = self.last_position.borrow().map(|fix| fix.position);
        let renderer = &mut self.renderer;
        let surface = &mut self.surface;
        let form = &self.form;

        let view = guard(|| {
            let map = if session.is_some() {
                let update = renderer.render(&members);
                if let Some(center) = update.pan_to {
                    debug!(center = %center, "Panning map");
                }
                surface.present(&update)?;
                update.view
            } else {
                renderer.placeholder()
            };
            Ok(render_view(
                session.as_ref(),
                form,
                &members,
                &map,
                own_position,
            ))
        });

        if let Err(e) = self.sink.show(&view) {
            warn!(error = %e, "Could not show view");
        }
    }
}
