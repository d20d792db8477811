//! Device position sources.
//!
//! This module defines the watch contract every position source fulfills:
//! a watch streams [`PositionEvent`]s into a channel until its [`WatchHandle`]
//! is cleared. Sources never retry on behalf of the caller; errors are
//! delivered as events and the watch keeps running.

mod fixed;
mod gpsd;
mod manual;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use fixed::FixedPositionSource;
pub use gpsd::GpsdPositionSource;
pub use manual::ManualPositionSource;

use crate::error::Result;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees, -90 to 90.
    pub lat: f64,
    /// Longitude in degrees, -180 to 180.
    pub lng: f64,
}

impl Position {
    /// Create a position, rejecting non-finite or out-of-range coordinates.
    #[must_use]
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.5}, {:.5}", self.lat, self.lng)
    }
}

/// A position reported by a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    /// Where the device is.
    pub position: Position,
    /// Estimated horizontal error in meters, when the source reports one.
    pub accuracy_m: Option<f64>,
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    /// Create a fix taken now.
    #[must_use]
    pub fn now(position: Position) -> Self {
        Self {
            position,
            accuracy_m: None,
            timestamp: Utc::now(),
        }
    }

    /// Check whether this fix is young enough to be reused.
    #[must_use]
    pub fn is_fresh(&self, maximum_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.timestamp);
        age.to_std().map_or(true, |age| age <= maximum_age)
    }
}

/// Options for a position watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Request the most accurate fix the source can give.
    pub high_accuracy: bool,
    /// A cached fix younger than this may be delivered at watch start.
    pub maximum_age: Duration,
    /// Longest wait for the next fix before a timeout error is delivered.
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Errors delivered through a position watch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeolocationError {
    /// The source refused access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No position could be determined.
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    /// No fix arrived within the timeout.
    #[error("timed out after {0:?} waiting for a position")]
    Timeout(Duration),
}

/// One callback of a position watch.
pub type PositionEvent = std::result::Result<PositionFix, GeolocationError>;

/// A source of device positions.
///
/// Implementors stream events into `tx` until the returned handle is cleared.
pub trait PositionSource: Send + Sync {
    /// The name of this source (for logging).
    fn name(&self) -> &'static str;

    /// Begin watching the device position.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch cannot be started at all.
    fn watch(
        &self,
        options: WatchOptions,
        tx: mpsc::Sender<PositionEvent>,
    ) -> Result<WatchHandle>;
}

/// Handle to an active position watch.
///
/// Clearing the handle stops the source from delivering further events.
/// Dropping it clears it too.
#[derive(Debug)]
pub struct WatchHandle {
    source: &'static str,
    stop_signal: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Create a handle for a watch driven by `task`.
    #[must_use]
    pub fn new(
        source: &'static str,
        stop_signal: Arc<AtomicBool>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            source,
            stop_signal,
            task,
        }
    }

    /// Name of the watched source.
    #[must_use]
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Stop the watch.
    pub fn clear(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Check if the watch has been cleared.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.clear();
    }
}
