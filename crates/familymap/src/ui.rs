//! Roster and shell views.
//!
//! The shell shows the sign-in form while signed out and the dashboard (map
//! plus member list) while signed in. View production runs inside
//! [`guard`], which turns any error or panic into a [`Fault`] view.

use std::fmt;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};

use uuid::Uuid;

use crate::device::Position;
use crate::error::{Error, Result};
use crate::map::MapView;
use crate::roster::Member;
use crate::session::{
    Credentials, Session, SessionManager, SignUpOutcome, CONFIRMATION_PROMPT,
};

/// Dashboard heading.
pub const DASHBOARD_TITLE: &str = "Family";

/// Recovery hint shown with a fault.
pub const RECOVERY_HINT: &str = "Run `famap cache clear` to reset local data, then start again.";

/// Which action the sign-in form performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Sign in to an existing account.
    #[default]
    SignIn,
    /// Create an account.
    SignUp,
}

impl AuthMode {
    /// Form heading.
    #[must_use]
    pub fn heading(self) -> &'static str {
        match self {
            Self::SignIn => "Welcome Back",
            Self::SignUp => "Create Account",
        }
    }

    /// Submit button label when idle.
    #[must_use]
    pub fn submit_label(self) -> &'static str {
        match self {
            Self::SignIn => "Sign In",
            Self::SignUp => "Sign Up",
        }
    }

    /// Label of the control switching to the other mode.
    #[must_use]
    pub fn toggle_label(self) -> &'static str {
        match self {
            Self::SignIn => "Don't have an account? Sign Up",
            Self::SignUp => "Already have an account? Sign In",
        }
    }

    /// The other mode.
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::SignIn => Self::SignUp,
            Self::SignUp => Self::SignIn,
        }
    }
}

/// A message shown on the sign-in form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The last request failed.
    Alert(String),
    /// Information, such as the confirmation prompt.
    Info(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alert(message) => write!(f, "! {message}"),
            Self::Info(message) => write!(f, "{message}"),
        }
    }
}

/// Label of the submit button while a request is in flight.
pub const PROCESSING_LABEL: &str = "Processing...";

/// State of the sign-in form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthForm {
    mode: AuthMode,
    loading: bool,
    notice: Option<Notice>,
}

impl AuthForm {
    /// A sign-in form with no notice.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A form in `mode`.
    #[must_use]
    pub fn with_mode(mode: AuthMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Switch between sign-in and sign-up.
    pub fn toggle_mode(&mut self) {
        self.mode = self.mode.toggled();
        self.notice = None;
    }

    /// Form heading.
    #[must_use]
    pub fn heading(&self) -> &'static str {
        self.mode.heading()
    }

    /// Submit button label.
    #[must_use]
    pub fn submit_label(&self) -> &'static str {
        if self.loading {
            PROCESSING_LABEL
        } else {
            self.mode.submit_label()
        }
    }

    /// Whether a request is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// The notice to show, if any.
    #[must_use]
    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    /// Submit `credentials` in the current mode.
    ///
    /// Returns the new session when the user ends up signed in. Failures and
    /// the sign-up confirmation prompt land in [`AuthForm::notice`].
    pub async fn submit(
        &mut self,
        sessions: &SessionManager,
        credentials: &Credentials,
    ) -> Option<Session> {
        let mode = self.begin();
        let outcome = Self::send(mode, sessions, credentials).await;
        self.finish(outcome)
    }

    /// Mark a request as in flight and return the mode to send it in.
    ///
    /// The form shows "Processing..." until [`AuthForm::finish`].
    pub fn begin(&mut self) -> AuthMode {
        self.loading = true;
        self.notice = None;
        self.mode
    }

    /// Send `credentials` to the backend in `mode`.
    ///
    /// A plain sign-in reports its session as [`SignUpOutcome::SignedIn`].
    ///
    /// # Errors
    ///
    /// Returns the auth error from the session manager.
    pub async fn send(
        mode: AuthMode,
        sessions: &SessionManager,
        credentials: &Credentials,
    ) -> Result<SignUpOutcome> {
        match mode {
            AuthMode::SignIn => sessions
                .sign_in(credentials)
                .await
                .map(SignUpOutcome::SignedIn),
            AuthMode::SignUp => sessions.sign_up(credentials).await,
        }
    }

    /// Settle an in-flight request.
    ///
    /// Returns the session when the user ends up signed in.
    pub fn finish(&mut self, outcome: Result<SignUpOutcome>) -> Option<Session> {
        self.loading = false;
        match outcome {
            Ok(SignUpOutcome::SignedIn(session)) => Some(session),
            Ok(SignUpOutcome::ConfirmationRequired { .. }) => {
                self.notice = Some(Notice::Info(CONFIRMATION_PROMPT.to_string()));
                None
            }
            Err(e) => {
                self.notice = Some(Notice::Alert(e.to_string()));
                None
            }
        }
    }
}

impl fmt::Display for AuthForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.heading())?;
        writeln!(f)?;
        writeln!(f, "  Email     your@email.com")?;
        writeln!(f, "  Password  ********")?;
        writeln!(f)?;
        writeln!(f, "  [{}]", self.submit_label())?;
        writeln!(f, "  {}", self.mode.toggle_label())?;
        if let Some(notice) = &self.notice {
            writeln!(f)?;
            writeln!(f, "{notice}")?;
        }
        Ok(())
    }
}

/// One line of the member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRow {
    /// Avatar letter.
    pub initial: String,
    /// Display name.
    pub name: String,
    /// Last update, local time or `"N/A"`.
    pub last_seen: String,
    /// This row is the signed-in user.
    pub is_self: bool,
}

impl MemberRow {
    /// The row for `member`, marking it live if it is `current_user`.
    #[must_use]
    pub fn new(member: &Member, current_user: Option<Uuid>) -> Self {
        Self {
            initial: member.initial(),
            name: member.display_name().to_string(),
            last_seen: member.last_seen(),
            is_self: current_user == Some(member.id),
        }
    }
}

impl fmt::Display for MemberRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = if self.is_self { " ●" } else { "" };
        write!(
            f,
            "({}) {:<24} {:>10}{live}",
            self.initial, self.name, self.last_seen
        )
    }
}

/// The signed-in view.
#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    /// Heading.
    pub title: &'static str,
    /// Member list, in roster order.
    pub rows: Vec<MemberRow>,
    /// The map.
    pub map: MapView,
    /// This device's last published position.
    pub own_position: Option<Position>,
}

impl Dashboard {
    /// Build the dashboard for `user`.
    #[must_use]
    pub fn new(user: Uuid, members: &[Member], map: MapView, own_position: Option<Position>) -> Self {
        Self {
            title: DASHBOARD_TITLE,
            rows: members.iter().map(|m| MemberRow::new(m, Some(user))).collect(),
            map,
            own_position,
        }
    }
}

impl fmt::Display for Dashboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        writeln!(
            f,
            "Map: {} (zoom {}), {} on map",
            self.map.center,
            self.map.zoom,
            self.map.markers.len()
        )?;
        if let Some(position) = self.own_position {
            writeln!(f, "You: {position}")?;
        }
        writeln!(f)?;
        writeln!(f, "MEMBERS")?;
        for row in &self.rows {
            writeln!(f, "  {row}")?;
        }
        Ok(())
    }
}

/// The view shown after a render failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// What went wrong.
    pub message: String,
    /// How to recover.
    pub hint: &'static str,
}

impl Fault {
    /// A fault with the recovery hint.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: RECOVERY_HINT,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Critical render error: {}", self.message)?;
        writeln!(f, "{}", self.hint)
    }
}

/// Everything the shell can show.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    /// Signed out.
    SignIn(AuthForm),
    /// Signed in.
    Dashboard(Dashboard),
    /// Rendering failed.
    Fault(Fault),
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignIn(form) => form.fmt(f),
            Self::Dashboard(dashboard) => dashboard.fmt(f),
            Self::Fault(fault) => fault.fmt(f),
        }
    }
}

/// Pick the view for the current session.
#[must_use]
pub fn render_view(
    session: Option<&Session>,
    form: &AuthForm,
    members: &[Member],
    map: &MapView,
    own_position: Option<Position>,
) -> View {
    match session {
        None => View::SignIn(form.clone()),
        Some(session) => View::Dashboard(Dashboard::new(
            session.user_id(),
            members,
            map.clone(),
            own_position,
        )),
    }
}

/// Run `render`, replacing any error or panic with a [`Fault`] view.
pub fn guard<F>(render: F) -> View
where
    F: FnOnce() -> Result<View>,
{
    match catch_unwind(AssertUnwindSafe(render)) {
        Ok(Ok(view)) => view,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Render failed");
            View::Fault(Fault::new(e.to_string()))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %message, "Render panicked");
            View::Fault(Fault::new(message))
        }
    }
}

/// Somewhere views are shown.
pub trait ViewSink: Send {
    /// Show `view`.
    ///
    /// # Errors
    ///
    /// Returns an error if the view cannot be shown.
    fn show(&mut self, view: &View) -> Result<()>;
}

/// Prints each view to a writer, skipping repeats.
#[derive(Debug)]
pub struct TerminalSink<W: Write + Send> {
    out: W,
    last: Option<String>,
}

impl<W: Write + Send> TerminalSink<W> {
    /// Create a sink writing to `out`.
    pub fn new(out: W) -> Self {
        Self { out, last: None }
    }

    /// The underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ViewSink for TerminalSink<W> {
    fn show(&mut self, view: &View) -> Result<()> {
        let text = view.to_string();
        if self.last.as_deref() == Some(text.as_str()) {
            return Ok(());
        }
        writeln!(self.out, "{text}").map_err(|e| Error::render(e.to_string()))?;
        self.out.flush().map_err(|e| Error::render(e.to_string()))?;
        self.last = Some(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::map::{MapView, FALLBACK_CENTER};

    fn map(members: &[Member]) -> MapView {
        MapView::from_members(members, FALLBACK_CENTER, 13)
    }

    #[test]
    fn test_form_labels() {
        let mut form = AuthForm::new();
        assert_eq!(form.heading(), "Welcome Back");
        assert_eq!(form.submit_label(), "Sign In");

        form.toggle_mode();
        assert_eq!(form.heading(), "Create Account");
        assert_eq!(form.submit_label(), "Sign Up");
        assert_eq!(form.mode().toggle_label(), "Already have an account? Sign In");

        form.loading = true;
        assert_eq!(form.submit_label(), "Processing...");
    }

    #[test]
    fn test_member_row() {
        let me = Uuid::new_v4();
        let member = Member::new(me, Some("dad".to_string())).at(1.0, 2.0, Utc::now());
        let row = MemberRow::new(&member, Some(me));
        assert_eq!(row.initial, "D");
        assert_eq!(row.name, "dad");
        assert!(row.is_self);
        assert!(row.to_string().ends_with('●'));

        let other = MemberRow::new(&Member::new(Uuid::new_v4(), None), Some(me));
        assert_eq!(other.initial, "A");
        assert_eq!(other.name, "Anonymous");
        assert_eq!(other.last_seen, "N/A");
        assert!(!other.is_self);
    }

    #[test]
    fn test_view_is_gated_on_session() {
        let form = AuthForm::new();
        let view = render_view(None, &form, &[], &map(&[]), None);
        assert!(matches!(view, View::SignIn(_)));
        assert!(view.to_string().starts_with("Welcome Back"));

        let session = MemoryBackend::issue_session(Uuid::new_v4(), "a@b.co");
        let members = vec![Member::new(session.user_id(), Some("Me".to_string()))];
        let view = render_view(Some(&session), &form, &members, &map(&members), None);
        let View::Dashboard(dashboard) = &view else {
            panic!("expected dashboard");
        };
        assert_eq!(dashboard.title, "Family");
        assert!(dashboard.rows[0].is_self);
        assert!(view.to_string().contains("MEMBERS"));
    }

    #[test]
    fn test_guard_catches_errors() {
        let view = guard(|| Err(Error::render("tile layer missing")));
        let View::Fault(fault) = view else {
            panic!("expected fault");
        };
        assert!(fault.message.contains("tile layer missing"));
        assert!(fault.to_string().contains("famap cache clear"));
    }

    #[test]
    fn test_guard_catches_panics() {
        let view = guard(|| panic!("boom"));
        assert_eq!(view, View::Fault(Fault::new("boom")));

        let view = guard(|| Ok(View::SignIn(AuthForm::new())));
        assert!(matches!(view, View::SignIn(_)));
    }

    #[test]
    fn test_terminal_sink_skips_repeats() {
        let mut sink = TerminalSink::new(Vec::new());
        let view = View::SignIn(AuthForm::new());
        sink.show(&view).unwrap();
        sink.show(&view).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out.matches("Welcome Back").count(), 1);
    }

    #[tokio::test]
    async fn test_sign_up_shows_confirmation_and_stays_signed_out() {
        let backend = MemoryBackend::new();
        let sessions = SessionManager::new(Arc::new(backend), None);
        let mut form = AuthForm::with_mode(AuthMode::SignUp);

        let session = form
            .submit(&sessions, &Credentials::new("kid@example.com", "secret1"))
            .await;
        assert!(session.is_none());
        assert_eq!(
            form.notice(),
            Some(&Notice::Info(CONFIRMATION_PROMPT.to_string()))
        );
        assert!(!form.is_loading());

        let view = render_view(sessions.current().as_ref(), &form, &[], &map(&[]), None);
        assert!(matches!(view, View::SignIn(_)));
        assert!(view.to_string().contains("Check your email for the confirmation link!"));
    }

    #[tokio::test]
    async fn test_failed_sign_in_shows_alert() {
        let backend = MemoryBackend::new();
        let sessions = SessionManager::new(Arc::new(backend), None);
        let mut form = AuthForm::new();

        let session = form
            .submit(&sessions, &Credentials::new("nobody@example.com", "secret1"))
            .await;
        assert!(session.is_none());
        assert_eq!(
            form.notice(),
            Some(&Notice::Alert("Invalid login credentials".to_string()))
        );
    }

    #[tokio::test]
    async fn test_sign_in_returns_session() {
        let backend = MemoryBackend::new();
        backend.register("mom@example.com", "secret1");
        let sessions = SessionManager::new(Arc::new(backend), None);
        let mut form = AuthForm::new();

        let session = form
            .submit(&sessions, &Credentials::new("mom@example.com", "secret1"))
            .await;
        assert!(session.is_some());
        assert!(form.notice().is_none());
    }
}
