//! A source that reports the same coordinates on every tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::{Position, PositionFix, PositionSource, WatchHandle, WatchOptions};
use crate::error::Result;

/// Reports a configured position, once at watch start and then once per
/// `interval`. Used for stationary devices without a GPS receiver.
#[derive(Debug, Clone)]
pub struct FixedPositionSource {
    position: Position,
    interval: Duration,
}

impl FixedPositionSource {
    /// Create a source reporting `position` every `interval`.
    #[must_use]
    pub fn new(position: Position, interval: Duration) -> Self {
        Self {
            position,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    /// The reported position.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }
}

impl PositionSource for FixedPositionSource {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn watch(
        &self,
        _options: WatchOptions,
        tx: mpsc::Sender<super::PositionEvent>,
    ) -> Result<WatchHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = Arc::clone(&stop);
        let position = self.position;
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if task_stop.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(Ok(PositionFix::now(position))).await.is_err() {
                    debug!("Fixed source receiver closed");
                    break;
                }
            }
        });

        Ok(WatchHandle::new(self.name(), stop, Some(task)))
    }
}
