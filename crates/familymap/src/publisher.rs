//! Location publisher.
//!
//! While a session is active the publisher watches the device position and
//! upserts every fix into the signed-in user's row. Position errors and
//! failed writes are logged and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::MemberStore;
use crate::device::{PositionFix, PositionSource, WatchHandle, WatchOptions};
use crate::error::{Error, Result};
use crate::roster::LocationUpdate;
use crate::session::Session;

/// Capacity of the position event channel.
const POSITION_CAPACITY: usize = 16;

/// Publishes the device position for the signed-in user.
pub struct LocationPublisher {
    source: Arc<dyn PositionSource>,
    store: Arc<dyn MemberStore>,
    options: WatchOptions,
    last_position: watch::Sender<Option<PositionFix>>,
}

impl std::fmt::Debug for LocationPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationPublisher")
            .field("source", &self.source.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LocationPublisher {
    /// Create a publisher reading `source` and writing to `store`.
    #[must_use]
    pub fn new(
        source: Arc<dyn PositionSource>,
        store: Arc<dyn MemberStore>,
        options: WatchOptions,
    ) -> Self {
        let (last_position, _) = watch::channel(None);
        Self {
            source,
            store,
            options,
            last_position,
        }
    }

    /// Observe the most recent fix.
    #[must_use]
    pub fn last_position(&self) -> watch::Receiver<Option<PositionFix>> {
        self.last_position.subscribe()
    }

    /// Start watching and publishing.
    ///
    /// Every write uses the session current at the time of the fix, so
    /// refreshed tokens are picked up. Fixes arriving while signed out are
    /// not written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSignedIn`] without a session, or an error if the
    /// position source cannot start.
    pub fn start(&self, session: watch::Receiver<Option<Session>>) -> Result<PublisherHandle> {
        let user = session
            .borrow()
            .as_ref()
            .map(Session::user_id)
            .ok_or(Error::NotSignedIn)?;

        let (tx, mut rx) = mpsc::channel(POSITION_CAPACITY);
        let watch = self.source.watch(self.options, tx)?;
        info!(source = watch.source(), user = %user, "Publishing location");

        let store = Arc::clone(&self.store);
        let last_position = self.last_position.clone();
        let writes = Arc::new(AtomicU64::new(0));
        let task_writes = Arc::clone(&writes);

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let fix = match event {
                    Ok(fix) => fix,
                    Err(e) => {
                        warn!(error = %e, "Position unavailable");
                        continue;
                    }
                };
                last_position.send_replace(Some(fix));

                let current = session.borrow().clone();
                let Some(current) = current else {
                    debug!("No session, skipping location write");
                    continue;
                };
                let update = LocationUpdate::new(current.user_id(), fix.position);
                match store.upsert_location(&current, &update).await {
                    Ok(()) => {
                        task_writes.fetch_add(1, Ordering::SeqCst);
                        debug!(position = %fix.position, "Published location");
                    }
                    Err(e) => warn!(error = %e, "Location write failed"),
                }
            }
            debug!("Position stream ended");
        });

        Ok(PublisherHandle {
            watch,
            task: Some(task),
            writes,
        })
    }
}

/// A running publisher. Stops when [`PublisherHandle::stop`] is called or
/// the handle is dropped.
#[derive(Debug)]
pub struct PublisherHandle {
    watch: WatchHandle,
    task: Option<JoinHandle<()>>,
    writes: Arc<AtomicU64>,
}

impl PublisherHandle {
    /// Clear the position watch and cancel publishing. No write starts
    /// after this returns.
    pub fn stop(&mut self) {
        self.watch.clear();
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Stopped publishing location");
        }
    }

    /// Check whether the publisher is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Number of successful writes.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{AuthBackend, MemoryBackend};
    use crate::device::{GeolocationError, ManualPositionSource, Position};
    use crate::session::Credentials;

    async fn setup() -> (
        MemoryBackend,
        ManualPositionSource,
        LocationPublisher,
        watch::Sender<Option<Session>>,
    ) {
        let backend = MemoryBackend::new();
        backend.register("dad@example.com", "secret1");
        let session = backend
            .sign_in(&Credentials::new("dad@example.com", "secret1"))
            .await
            .unwrap();
        let (session_tx, _) = watch::channel(Some(session));

        let source = ManualPositionSource::new();
        let publisher = LocationPublisher::new(
            Arc::new(source.clone()),
            Arc::new(backend.clone()),
            WatchOptions::default(),
        );
        (backend, source, publisher, session_tx)
    }

    fn fix(lat: f64, lng: f64) -> PositionFix {
        PositionFix::now(Position::new(lat, lng).unwrap())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_fix_is_upserted_for_current_user() {
        let (backend, source, publisher, session_tx) = setup().await;
        let user = session_tx.borrow().as_ref().unwrap().user_id();
        let handle = publisher.start(session_tx.subscribe()).unwrap();

        source.push(Ok(fix(37.5, 127.0)));
        settle().await;

        let upserts = backend.upserts();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].id, user);
        assert!((upserts[0].lat - 37.5).abs() < f64::EPSILON);
        assert_eq!(handle.writes(), 1);
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_last_position_is_exposed() {
        let (_backend, source, publisher, session_tx) = setup().await;
        let last = publisher.last_position();
        let _handle = publisher.start(session_tx.subscribe()).unwrap();

        source.push(Ok(fix(1.0, 2.0)));
        settle().await;

        let position = last.borrow().unwrap().position;
        assert_eq!(position, Position::new(1.0, 2.0).unwrap());
    }

    #[tokio::test]
    async fn test_position_errors_are_ignored() {
        let (backend, source, publisher, session_tx) = setup().await;
        let handle = publisher.start(session_tx.subscribe()).unwrap();

        source.push(Err(GeolocationError::PermissionDenied("denied".to_string())));
        source.push(Ok(fix(1.0, 1.0)));
        settle().await;

        assert_eq!(backend.upserts().len(), 1);
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_publishing() {
        let (backend, source, publisher, session_tx) = setup().await;
        let handle = publisher.start(session_tx.subscribe()).unwrap();

        backend.set_offline(true);
        source.push(Ok(fix(1.0, 1.0)));
        settle().await;
        assert_eq!(handle.writes(), 0);

        backend.set_offline(false);
        source.push(Ok(fix(2.0, 2.0)));
        settle().await;
        assert_eq!(handle.writes(), 1);
    }

    #[tokio::test]
    async fn test_no_writes_after_stop() {
        let (backend, source, publisher, session_tx) = setup().await;
        let mut handle = publisher.start(session_tx.subscribe()).unwrap();

        source.push(Ok(fix(1.0, 1.0)));
        settle().await;
        handle.stop();

        assert_eq!(source.active_watches(), 0);
        assert_eq!(source.push(Ok(fix(2.0, 2.0))), 0);
        settle().await;
        assert_eq!(backend.upserts().len(), 1);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_drop_clears_watch() {
        let (_backend, source, publisher, session_tx) = setup().await;
        let handle = publisher.start(session_tx.subscribe()).unwrap();
        assert_eq!(source.active_watches(), 1);

        drop(handle);
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_start_requires_session() {
        let (_backend, source, publisher, _session_tx) = setup().await;
        let (_tx, rx) = watch::channel(None);

        let err = publisher.start(rx).unwrap_err();
        assert!(err.is_not_signed_in());
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_fix_while_signed_out_is_not_written() {
        let (backend, source, publisher, session_tx) = setup().await;
        let _handle = publisher.start(session_tx.subscribe()).unwrap();

        session_tx.send_replace(None);
        source.push(Ok(fix(1.0, 1.0)));
        settle().await;

        assert!(backend.upserts().is_empty());
    }
}
