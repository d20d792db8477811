//! Realtime subscriber.
//!
//! Listens for row changes on the location table and re-fetches the roster
//! for each one. With a debounce window, changes arriving within the window
//! after the first one collapse into a single fetch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{ChangeFeed, ChangeSubscription};
use crate::error::Result;
use crate::roster::RosterFetcher;
use crate::session::Session;

/// Re-fetches the roster whenever the location table changes.
pub struct RealtimeSubscriber {
    feed: Arc<dyn ChangeFeed>,
    roster: Arc<RosterFetcher>,
    table: String,
    debounce: Option<Duration>,
}

impl std::fmt::Debug for RealtimeSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSubscriber")
            .field("table", &self.table)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl RealtimeSubscriber {
    /// Create a subscriber for `table`.
    #[must_use]
    pub fn new(feed: Arc<dyn ChangeFeed>, roster: Arc<RosterFetcher>, table: &str) -> Self {
        Self {
            feed,
            roster,
            table: table.to_string(),
            debounce: None,
        }
    }

    /// Coalesce changes arriving within `window` into one fetch.
    #[must_use]
    pub fn with_debounce(mut self, window: Option<Duration>) -> Self {
        self.debounce = window;
        self
    }

    /// Subscribe and start re-fetching on changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    pub async fn start(
        &self,
        session: watch::Receiver<Option<Session>>,
    ) -> Result<SubscriberHandle> {
        let subscription = self.feed.subscribe(&self.table, session).await?;
        info!(table = %self.table, "Listening for roster changes");

        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(listen(
            subscription,
            Arc::clone(&self.roster),
            self.debounce,
            stop_rx,
            Arc::clone(&counters),
        ));

        Ok(SubscriberHandle {
            stop: Some(stop_tx),
            task: Some(task),
            counters,
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    events: AtomicU64,
    fetches: AtomicU64,
}

async fn listen(
    mut subscription: ChangeSubscription,
    roster: Arc<RosterFetcher>,
    debounce: Option<Duration>,
    mut stop: oneshot::Receiver<()>,
    counters: Arc<Counters>,
) {
    loop {
        let event = tokio::select! {
            _ = &mut stop => break,
            event = subscription.recv() => event,
        };
        let Some(event) = event else {
            warn!(table = %subscription.table(), "Change feed ended");
            break;
        };
        counters.events.fetch_add(1, Ordering::SeqCst);
        debug!(kind = %event.kind, "Roster change");

        let mut stopped = false;
        let mut ended = false;
        if let Some(window) = debounce {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    _ = &mut stop => {
                        stopped = true;
                        break;
                    }
                    more = subscription.recv() => match more {
                        Some(_) => {
                            counters.events.fetch_add(1, Ordering::SeqCst);
                        }
                        None => {
                            ended = true;
                            break;
                        }
                    },
                }
            }
        }
        if stopped {
            break;
        }

        counters.fetches.fetch_add(1, Ordering::SeqCst);
        // Failures are logged by the fetcher and leave the roster as it was
        let _ = roster.refresh().await;

        if ended {
            warn!(table = %subscription.table(), "Change feed ended");
            break;
        }
    }

    subscription.unsubscribe().await;
}

/// A running subscriber.
#[derive(Debug)]
pub struct SubscriberHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl SubscriberHandle {
    /// Unsubscribe and wait for the listener to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Change listener failed");
                }
            }
        }
        info!("Stopped listening for roster changes");
    }

    /// Check whether the listener is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Number of change events received.
    #[must_use]
    pub fn events(&self) -> u64 {
        self.counters.events.load(Ordering::SeqCst)
    }

    /// Number of roster fetches triggered.
    #[must_use]
    pub fn fetches(&self) -> u64 {
        self.counters.fetches.load(Ordering::SeqCst)
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
