//! gpsd position source.
//!
//! Connects to a gpsd daemon, enables JSON watch mode and turns TPV reports
//! into position fixes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    GeolocationError, Position, PositionEvent, PositionFix, PositionSource, WatchHandle,
    WatchOptions,
};
use crate::error::Result;

/// Command that switches a gpsd connection to streaming JSON reports.
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

/// Pause before reconnecting after the daemon went away.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A gpsd report. Only the fields of TPV (time-position-velocity) reports
/// are read.
#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    /// Estimated horizontal position error in meters (95% confidence).
    eph: Option<f64>,
    time: Option<DateTime<Utc>>,
}

impl Report {
    /// Convert a TPV report with at least a 2D fix into a position fix.
    fn to_fix(&self) -> Option<PositionFix> {
        if self.class != "TPV" || self.mode < 2 {
            return None;
        }
        let position = Position::new(self.lat?, self.lon?)?;
        Some(PositionFix {
            position,
            accuracy_m: self.eph,
            timestamp: self.time.unwrap_or_else(Utc::now),
        })
    }
}

/// Parse one line of gpsd output.
fn parse_line(line: &str) -> Option<PositionFix> {
    match serde_json::from_str::<Report>(line) {
        Ok(report) => report.to_fix(),
        Err(e) => {
            trace!(error = %e, "Ignoring unparsable gpsd line");
            None
        }
    }
}

/// Watches a gpsd daemon.
///
/// gpsd has no accuracy knob, so `high_accuracy` is not forwarded; every fix
/// carries gpsd's own error estimate instead.
#[derive(Debug, Clone)]
pub struct GpsdPositionSource {
    addr: String,
    last_fix: Arc<Mutex<Option<PositionFix>>>,
}

impl GpsdPositionSource {
    /// Create a source for the daemon at `addr` (host:port).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            last_fix: Arc::new(Mutex::new(None)),
        }
    }
}

impl PositionSource for GpsdPositionSource {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    fn watch(
        &self,
        options: WatchOptions,
        tx: mpsc::Sender<PositionEvent>,
    ) -> Result<WatchHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = Arc::clone(&stop);
        let addr = self.addr.clone();
        let last_fix = Arc::clone(&self.last_fix);

        let task = tokio::spawn(async move {
            let cached = (*last_fix.lock().unwrap_or_else(PoisonError::into_inner))
                .filter(|fix| fix.is_fresh(options.maximum_age));
            if let Some(fix) = cached {
                if tx.send(Ok(fix)).await.is_err() {
                    return;
                }
            }

            while !task_stop.load(Ordering::SeqCst) {
                match stream_reports(&addr, options, &tx, &last_fix).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "gpsd connection failed");
                        if tx.send(Err(e)).await.is_err() {
                            break;
                        }
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(WatchHandle::new(self.name(), stop, Some(task)))
    }
}

/// Stream fixes from one gpsd connection.
///
/// Returns `Ok` when the receiver went away, `Err` when the connection failed.
async fn stream_reports(
    addr: &str,
    options: WatchOptions,
    tx: &mpsc::Sender<PositionEvent>,
    last_fix: &Mutex<Option<PositionFix>>,
) -> std::result::Result<(), GeolocationError> {
    let unavailable = |e: std::io::Error| GeolocationError::PositionUnavailable(e.to_string());

    let mut stream = TcpStream::connect(addr).await.map_err(unavailable)?;
    stream.write_all(WATCH_COMMAND).await.map_err(unavailable)?;
    debug!(addr = %addr, "Watching gpsd");

    let mut lines = BufReader::new(stream).lines();
    let mut deadline = tokio::time::Instant::now() + options.timeout;

    loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Ok(line) => line.map_err(unavailable)?,
            Err(_) => {
                if tx.send(Err(GeolocationError::Timeout(options.timeout))).await.is_err() {
                    return Ok(());
                }
                deadline = tokio::time::Instant::now() + options.timeout;
                continue;
            }
        };

        let Some(line) = line else {
            return Err(GeolocationError::PositionUnavailable(
                "gpsd closed the connection".to_string(),
            ));
        };

        if let Some(fix) = parse_line(&line) {
            *last_fix.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix);
            deadline = tokio::time::Instant::now() + options.timeout;
            if tx.send(Ok(fix)).await.is_err() {
                return Ok(());
            }
        }
    }
}
