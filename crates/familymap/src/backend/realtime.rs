//! Supabase Realtime change feed.
//!
//! Realtime speaks the Phoenix channel protocol over a websocket. A
//! subscription joins the topic `realtime:<schema>:<table>` with a
//! `postgres_changes` config, keeps the socket alive with heartbeats,
//! forwards refreshed access tokens and leaves the topic when stopped.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::{ChangeEvent, ChangeFeed, ChangeKind, ChangeSubscription};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::session::Session;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Protocol version sent in the connection URL.
const PROTOCOL_VERSION: &str = "1.0.0";

/// Ref of the join message; the join reply echoes it.
const JOIN_REF: &str = "1";

/// Capacity of the subscription event channel.
const EVENT_CAPACITY: usize = 32;

/// One Phoenix protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl Frame {
    fn new(topic: &str, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
            join_ref: None,
        }
    }

    fn join(topic: &str, schema: &str, table: &str, access_token: Option<&str>) -> Self {
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": schema, "table": table }
                ]
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        let mut frame = Self::new(topic, "phx_join", payload, JOIN_REF.to_string());
        frame.join_ref = Some(JOIN_REF.to_string());
        frame
    }

    fn heartbeat(reference: String) -> Self {
        Self::new("phoenix", "heartbeat", json!({}), reference)
    }

    fn access_token(topic: &str, token: &str, reference: String) -> Self {
        Self::new(
            topic,
            "access_token",
            json!({ "access_token": token }),
            reference,
        )
    }

    fn leave(topic: &str, reference: String) -> Self {
        Self::new(topic, "phx_leave", json!({}), reference)
    }

    fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                trace!(error = %e, "Ignoring unparsable realtime frame");
                None
            }
        }
    }

    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }

    /// The reply status, for `phx_reply` frames.
    fn reply_status(&self) -> Option<&str> {
        if self.event != "phx_reply" {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The row change carried by a `postgres_changes` frame.
    fn change_event(&self) -> Option<ChangeEvent> {
        if self.event != "postgres_changes" {
            return None;
        }
        let data = self.payload.get("data")?;
        let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
        let table = data.get("table")?.as_str()?.to_string();
        let record_key = if kind == ChangeKind::Delete {
            "old_record"
        } else {
            "record"
        };
        let record = data.get(record_key).filter(|v| !v.is_null()).cloned();
        Some(ChangeEvent {
            kind,
            table,
            record,
        })
    }
}

/// Message refs after the join.
#[derive(Debug)]
struct Refs(u64);

impl Refs {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

/// Change feed backed by a Supabase Realtime websocket.
#[derive(Debug, Clone)]
pub struct RealtimeFeed {
    endpoint: Url,
    schema: String,
    heartbeat: Duration,
    join_timeout: Duration,
}

impl RealtimeFeed {
    /// Create a feed for the project in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the project URL cannot be turned into a websocket
    /// URL.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut endpoint = Url::parse(&config.url)
            .map_err(|e| Error::realtime(format!("invalid project URL: {e}")))?;
        let scheme = match endpoint.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(Error::realtime(format!(
                    "unsupported project URL scheme: {other}"
                )))
            }
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|()| Error::realtime("could not build websocket URL"))?;
        endpoint.set_path("/realtime/v1/websocket");
        endpoint
            .query_pairs_mut()
            .clear()
            .append_pair("apikey", &config.anon_key)
            .append_pair("vsn", PROTOCOL_VERSION);

        Ok(Self {
            endpoint,
            schema: config.schema.clone(),
            heartbeat: config.heartbeat_interval(),
            join_timeout: config.request_timeout(),
        })
    }

    /// Websocket URL, including the anon key.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn topic(&self, table: &str) -> String {
        format!("realtime:{}:{table}", self.schema)
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(
        &self,
        table: &str,
        mut session: watch::Receiver<Option<Session>>,
    ) -> Result<ChangeSubscription> {
        let topic = self.topic(table);
        let token = session
            .borrow_and_update()
            .as_ref()
            .map(|s| s.access_token.clone());

        let (mut socket, _) = connect_async(self.endpoint.as_str()).await?;
        socket
            .send(Frame::join(&topic, &self.schema, table, token.as_deref()).to_message()?)
            .await?;

        tokio::time::timeout(self.join_timeout, await_join(&mut socket, &topic))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("joining {topic}"),
            })??;
        info!(topic = %topic, "Subscribed to changes");

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_channel(
            socket,
            topic,
            session,
            tx,
            stop_rx,
            self.heartbeat,
        ));

        Ok(ChangeSubscription::new(table, rx, stop_tx, task))
    }
}

/// Wait for the reply to the join message.
async fn await_join(socket: &mut Socket, topic: &str) -> Result<()> {
    while let Some(message) = socket.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Some(frame) = Frame::parse(&text) else {
            continue;
        };
        if frame.topic != topic || frame.reference.as_deref() != Some(JOIN_REF) {
            continue;
        }
        match frame.reply_status() {
            Some("ok") => return Ok(()),
            Some(status) => {
                let reason = frame
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or(status);
                return Err(Error::realtime(format!("join rejected: {reason}")));
            }
            None => {}
        }
    }
    Err(Error::realtime("socket closed before the join was confirmed"))
}

/// Drive a joined channel until stopped or the socket fails.
async fn run_channel(
    socket: Socket,
    topic: String,
    mut session: watch::Receiver<Option<Session>>,
    events: mpsc::Sender<ChangeEvent>,
    mut stop: oneshot::Receiver<()>,
    heartbeat_every: Duration,
) {
    let (mut sink, mut stream) = socket.split();
    let mut refs = Refs(1);
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_every, heartbeat_every);
    let mut session_open = true;

    loop {
        let outgoing = tokio::select! {
            _ = &mut stop => {
                if let Ok(leave) = Frame::leave(&topic, refs.next()).to_message() {
                    let _ = sink.send(leave).await;
                }
                let _ = sink.close().await;
                debug!(topic = %topic, "Left channel");
                break;
            }
            _ = heartbeat.tick() => Some(Frame::heartbeat(refs.next())),
            changed = session.changed(), if session_open => match changed {
                Ok(()) => session
                    .borrow_and_update()
                    .as_ref()
                    .map(|s| Frame::access_token(&topic, &s.access_token, refs.next())),
                Err(_) => {
                    session_open = false;
                    None
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !forward(&text, &topic, &events).await {
                        break;
                    }
                    None
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(topic = %topic, "Realtime socket closed by server");
                    break;
                }
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    warn!(topic = %topic, error = %e, "Realtime socket failed");
                    break;
                }
            },
        };

        if let Some(frame) = outgoing {
            let sent = match frame.to_message() {
                Ok(message) => sink.send(message).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(topic = %topic, error = %e, "Could not write to realtime socket");
                break;
            }
            trace!(topic = %topic, event = %frame.event, "Sent frame");
        }
    }
}

/// Handle one incoming frame. Returns `false` when the channel should end.
async fn forward(text: &str, topic: &str, events: &mpsc::Sender<ChangeEvent>) -> bool {
    let Some(frame) = Frame::parse(text) else {
        return true;
    };
    if frame.topic != topic {
        return true;
    }

    if let Some(event) = frame.change_event() {
        debug!(kind = %event.kind, table = %event.table, "Change received");
        return events.send(event).await.is_ok();
    }
    match frame.event.as_str() {
        "phx_error" | "phx_close" => {
            warn!(topic = %topic, event = %frame.event, "Channel closed by server");
            false
        }
        "system" => {
            trace!(payload = %frame.payload, "Realtime system message");
            true
        }
        _ => true,
    }
}
