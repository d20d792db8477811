//! Logging configuration for familymap.
//!
//! Installs the tracing subscriber used by the `famap` binary. Library code only
//! emits events; it never installs a subscriber itself.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Targets logged at the requested verbosity.
const OWN_TARGETS: &[&str] = &["familymap", "famap"];

/// Noisy dependency targets kept quieter than our own.
const TRANSPORT_TARGETS: &[&str] = &["reqwest", "hyper", "tungstenite", "tokio_tungstenite"];

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Suppress all output except errors.
    Quiet,
    /// Normal output level (info and above).
    #[default]
    Normal,
    /// Verbose output (debug and above).
    Verbose,
    /// Very verbose output (trace level).
    Trace,
}

impl Verbosity {
    /// Convert verbosity to tracing level filter.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// The default filter directive for this verbosity.
    ///
    /// Our own crates follow `self`. The HTTP and websocket stacks stay at
    /// `warn` unless tracing is requested.
    #[must_use]
    pub fn directive(&self) -> String {
        let level = self.to_level_filter();
        let transport = match self {
            Self::Trace => Level::DEBUG,
            Self::Quiet => Level::ERROR,
            Self::Normal | Self::Verbose => Level::WARN,
        };
        OWN_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .chain(
                TRANSPORT_TARGETS
                    .iter()
                    .map(|target| format!("{target}={transport}")),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `verbosity` when it is set. Log lines go to
/// stderr so they never interleave with command output on stdout.
///
/// # Examples
///
/// ```no_run
/// use familymap::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    );

    // Ignore the error if a subscriber is already set
    let _ = subscriber.try_init();
}

/// Initialize logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_to_level() {
        assert_eq!(Verbosity::Quiet.to_level_filter(), Level::ERROR);
        assert_eq!(Verbosity::Normal.to_level_filter(), Level::INFO);
        assert_eq!(Verbosity::Verbose.to_level_filter(), Level::DEBUG);
        assert_eq!(Verbosity::Trace.to_level_filter(), Level::TRACE);
    }

    #[test]
    fn test_verbosity_default() {
        assert_eq!(Verbosity::default(), Verbosity::Normal);
    }

    #[test]
    fn test_directive() {
        let verbose = Verbosity::Verbose.directive();
        assert!(verbose.starts_with("familymap=DEBUG,famap=DEBUG,"));
        assert!(verbose.contains("reqwest=WARN"));

        let trace = Verbosity::Trace.directive();
        assert!(trace.contains("famap=TRACE"));
        assert!(trace.contains("tokio_tungstenite=DEBUG"));

        assert!(Verbosity::Quiet.directive().contains("hyper=ERROR"));
    }

    #[test]
    fn test_directive_parses() {
        for verbosity in [
            Verbosity::Quiet,
            Verbosity::Normal,
            Verbosity::Verbose,
            Verbosity::Trace,
        ] {
            assert!(EnvFilter::try_new(verbosity.directive()).is_ok());
        }
    }

    #[test]
    fn test_init_logging_with_all_verbosity_levels() {
        // Only the first call installs a subscriber; the rest must not panic
        init_logging(Verbosity::Quiet);
        init_logging(Verbosity::Normal);
        init_logging(Verbosity::Verbose);
        init_logging(Verbosity::Trace);
    }

    #[test]
    fn test_init_test_logging_does_not_panic() {
        init_test_logging();
    }
}
