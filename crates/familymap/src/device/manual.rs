//! A source fed programmatically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use super::{PositionEvent, PositionFix, PositionSource, WatchHandle, WatchOptions};
use crate::error::Result;

#[derive(Debug)]
struct Watcher {
    stop_signal: Arc<AtomicBool>,
    tx: mpsc::Sender<PositionEvent>,
}

#[derive(Debug, Default)]
struct Shared {
    watchers: Vec<Watcher>,
    last_fix: Option<PositionFix>,
}

/// A position source whose events are pushed by the caller.
///
/// Used by `famap publish` to report a single position and by tests to drive
/// the publisher. A new watch receives the last pushed fix if it is younger
/// than the watch's maximum age.
#[derive(Debug, Clone, Default)]
pub struct ManualPositionSource {
    shared: Arc<Mutex<Shared>>,
}

impl ManualPositionSource {
    /// Create a source with no watchers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every active watch.
    ///
    /// Returns the number of watches that received it.
    pub fn push(&self, event: PositionEvent) -> usize {
        let mut shared = self.lock();
        if let Ok(fix) = &event {
            shared.last_fix = Some(*fix);
        }

        shared
            .watchers
            .retain(|w| !w.stop_signal.load(Ordering::SeqCst) && !w.tx.is_closed());

        let mut delivered = 0;
        for watcher in &shared.watchers {
            if watcher.tx.try_send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                trace!("Manual source dropped an event for a full watcher");
            }
        }
        delivered
    }

    /// Number of watches that have not been cleared.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.lock()
            .watchers
            .iter()
            .filter(|w| !w.stop_signal.load(Ordering::SeqCst))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PositionSource for ManualPositionSource {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn watch(
        &self,
        options: WatchOptions,
        tx: mpsc::Sender<PositionEvent>,
    ) -> Result<WatchHandle> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let mut shared = self.lock();

        if let Some(fix) = shared.last_fix {
            if fix.is_fresh(options.maximum_age) {
                let _ = tx.try_send(Ok(fix));
            }
        }

        shared.watchers.push(Watcher {
            stop_signal: Arc::clone(&stop_signal),
            tx,
        });

        Ok(WatchHandle::new(self.name(), stop_signal, None))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::{GeolocationError, Position};

    fn fix(lat: f64, lng: f64) -> PositionEvent {
        Ok(PositionFix::now(Position::new(lat, lng).unwrap()))
    }

    #[tokio::test]
    async fn test_push_reaches_watcher() {
        let source = ManualPositionSource::new();
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = source.watch(WatchOptions::default(), tx).unwrap();

        assert_eq!(source.push(fix(1.0, 2.0)), 1);
        let event = rx.recv().await.unwrap().unwrap();
        assert!((event.position.lat - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_errors_are_delivered() {
        let source = ManualPositionSource::new();
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = source.watch(WatchOptions::default(), tx).unwrap();

        source.push(Err(GeolocationError::Timeout(Duration::from_secs(5))));
        assert!(rx.recv().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cleared_watch_stops_receiving() {
        let source = ManualPositionSource::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut handle = source.watch(WatchOptions::default(), tx).unwrap();
        assert_eq!(source.active_watches(), 1);

        handle.clear();
        assert_eq!(source.active_watches(), 0);
        assert_eq!(source.push(fix(1.0, 2.0)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_watch_gets_fresh_cached_fix() {
        let source = ManualPositionSource::new();
        source.push(fix(3.0, 4.0));

        let (tx, mut rx) = mpsc::channel(4);
        let _handle = source.watch(WatchOptions::default(), tx).unwrap();
        let cached = rx.recv().await.unwrap().unwrap();
        assert!((cached.position.lng - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_new_watch_skips_stale_cached_fix() {
        let source = ManualPositionSource::new();
        source.push(fix(3.0, 4.0));
        std::thread::sleep(Duration::from_millis(5));

        let options = WatchOptions {
            maximum_age: Duration::ZERO,
            ..WatchOptions::default()
        };
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = source.watch(options, tx).unwrap();

        assert!(rx.try_recv().is_err());
    }
}
