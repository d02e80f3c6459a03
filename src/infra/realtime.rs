//! Supabase Realtime client.
//!
//! Speaks the Phoenix channel protocol over a WebSocket: one channel joined
//! with a `postgres_changes` filter for a single table, a periodic heartbeat
//! on the `phoenix` topic, and automatic reconnection with exponential
//! backoff. Every successful join, the first one included, is reported as
//! [`FeedMessage::Resubscribed`]: rows changed before the channel was live
//! were never notified, so consumers resynchronise from there.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::domain::change::{ChangeEvent, ChangeKind, FeedMessage};
use crate::domain::ticket::{Ticket, TicketId};
use crate::error::{AppError, AppResult};
use crate::services::{ChangeFeed, FeedSubscription};

const CHANNEL_NAME: &str = "tickets-changes";
const PROTOCOL_VERSION: &str = "1.0.0";
const FEED_BUFFER: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for the realtime socket.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Full WebSocket URL, including the `apikey` and `vsn` query parameters.
    pub socket_url: String,
    pub api_key: String,
    pub schema: String,
    pub heartbeat_interval: Duration,
    /// Initial delay for exponential backoff (milliseconds).
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnection attempts (seconds).
    pub max_delay_secs: u64,
}

impl RealtimeConfig {
    /// Derives the realtime endpoint from a project URL such as `https://abc.supabase.co`.
    pub fn for_project(project_url: &str, api_key: &str) -> AppResult<Self> {
        let trimmed = project_url.trim().trim_end_matches('/');
        let host = if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(AppError::Configuration(format!(
                "Supabase URL must start with http:// or https://, got '{project_url}'"
            )));
        };

        Ok(Self {
            socket_url: format!(
                "{host}/realtime/v1/websocket?apikey={api_key}&vsn={PROTOCOL_VERSION}"
            ),
            api_key: api_key.to_string(),
            schema: "public".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            initial_delay_ms: 500,
            max_delay_secs: 10,
        })
    }
}

pub struct RealtimeFeed {
    config: Option<RealtimeConfig>,
}

impl RealtimeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// A feed that refuses every subscription, for when Supabase is not configured.
    pub fn unconfigured() -> Self {
        Self { config: None }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, table: &str) -> AppResult<FeedSubscription> {
        let config = self.config.clone().ok_or_else(|| {
            AppError::Configuration("Supabase URL or key not configured".to_string())
        })?;
        let (events, receiver) = mpsc::channel(FEED_BUFFER);
        let (closer, closed) = oneshot::channel();
        let worker = tokio::spawn(run_channel(
            config,
            table.to_string(),
            events,
            closed,
        ));
        Ok(FeedSubscription::new(receiver, closer, Some(worker)))
    }
}

/// Keeps one channel joined until the subscription is released.
async fn run_channel(
    config: RealtimeConfig,
    table: String,
    events: mpsc::Sender<FeedMessage>,
    mut closed: oneshot::Receiver<()>,
) {
    let mut refs = RefCounter::default();
    let mut delay_ms = config.initial_delay_ms;

    loop {
        let connected = tokio::select! {
            _ = &mut closed => return,
            connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(config.socket_url.as_str())) => connected,
        };

        match connected {
            Ok(Ok((socket, _))) => {
                debug!("realtime socket connected");
                let session = ChannelSession {
                    config: &config,
                    table: &table,
                    topic: format!("realtime:{CHANNEL_NAME}"),
                    events: &events,
                };
                match session.run(socket, &mut refs, &mut closed).await {
                    SessionEnd::Released => return,
                    SessionEnd::Lost { joined, reason } => {
                        warn!("realtime link lost: {reason}");
                        if joined {
                            delay_ms = config.initial_delay_ms;
                        }
                    }
                }
            }
            Ok(Err(err)) => warn!("realtime connection failed: {err}"),
            Err(_) => warn!("realtime connection timed out"),
        }

        debug!(delay_ms, "reconnecting to realtime");
        tokio::select! {
            _ = &mut closed => return,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
        delay_ms = std::cmp::min(delay_ms * 2, config.max_delay_secs * 1000);
    }
}

enum SessionEnd {
    /// The subscription was released, or nobody is listening any more.
    Released,
    Lost { joined: bool, reason: String },
}

struct ChannelSession<'a> {
    config: &'a RealtimeConfig,
    table: &'a str,
    topic: String,
    events: &'a mpsc::Sender<FeedMessage>,
}

impl ChannelSession<'_> {
    async fn run(
        self,
        socket: Socket,
        refs: &mut RefCounter,
        closed: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        let join_ref = refs.next();
        let join = join_frame(
            &self.topic,
            &self.config.schema,
            self.table,
            &self.config.api_key,
            &join_ref,
        );
        if let Err(err) = sink.send(Message::Text(join.into())).await {
            return lost(false, format!("failed to join channel: {err}"));
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut joined = false;

        loop {
            tokio::select! {
                _ = &mut *closed => {
                    leave(&mut sink, &self.topic, refs).await;
                    return SessionEnd::Released;
                }
                _ = heartbeat.tick() => {
                    let frame = heartbeat_frame(&refs.next());
                    if let Err(err) = sink.send(Message::Text(frame.into())).await {
                        return lost(joined, format!("heartbeat failed: {err}"));
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let forwarded = match decode_frame(&text, &self.topic, &join_ref, self.table) {
                            Ok(Inbound::Joined) => {
                                joined = true;
                                info!(table = self.table, "subscribed to ticket changes");
                                Some(FeedMessage::Resubscribed)
                            }
                            Ok(Inbound::Change(event)) => Some(FeedMessage::Change(event)),
                            Ok(Inbound::ChannelError(reason)) => {
                                if self.events.send(FeedMessage::Fault(reason.clone())).await.is_err() {
                                    return SessionEnd::Released;
                                }
                                return lost(joined, reason);
                            }
                            Ok(Inbound::Ignored) => None,
                            Err(reason) => {
                                warn!("undecodable realtime frame: {reason}");
                                Some(FeedMessage::Fault(reason))
                            }
                        };
                        if let Some(message) = forwarded {
                            if self.events.send(message).await.is_err() {
                                leave(&mut sink, &self.topic, refs).await;
                                return SessionEnd::Released;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return lost(joined, "socket closed by server".to_string());
                    }
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry nothing for us.
                    }
                    Some(Err(err)) => return lost(joined, err.to_string()),
                }
            }
        }
    }
}

fn lost(joined: bool, reason: String) -> SessionEnd {
    SessionEnd::Lost { joined, reason }
}

async fn leave(sink: &mut SplitSink<Socket, Message>, topic: &str, refs: &mut RefCounter) {
    let frame = leave_frame(topic, &refs.next());
    if let Err(err) = sink.send(Message::Text(frame.into())).await {
        debug!("failed to leave channel: {err}");
    }
    if let Err(err) = sink.close().await {
        debug!("failed to close realtime socket: {err}");
    }
    info!("unsubscribed from ticket changes");
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

fn join_frame(topic: &str, schema: &str, table: &str, api_key: &str, reference: &str) -> String {
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": schema, "table": table }
                ],
                "private": false
            },
            "access_token": api_key
        },
        "ref": reference,
        "join_ref": reference
    })
    .to_string()
}

fn heartbeat_frame(reference: &str) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference
    })
    .to_string()
}

fn leave_frame(topic: &str, reference: &str) -> String {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": reference
    })
    .to_string()
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Joined,
    Change(ChangeEvent),
    ChannelError(String),
    Ignored,
}

#[derive(Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Value,
}

#[derive(Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

fn decode_frame(text: &str, topic: &str, join_ref: &str, table: &str) -> Result<Inbound, String> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|err| format!("malformed frame: {err}"))?;
    if frame.topic != topic {
        return Ok(Inbound::Ignored);
    }

    match frame.event.as_str() {
        "phx_reply" if reference_matches(&frame.reference, join_ref) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Ok(Inbound::Joined),
                _ => Ok(Inbound::ChannelError(format!(
                    "channel join refused: {}",
                    frame.payload.get("response").unwrap_or(&Value::Null)
                ))),
            }
        }
        "postgres_changes" => {
            let payload: ChangePayload = serde_json::from_value(frame.payload)
                .map_err(|err| format!("malformed change notification: {err}"))?;
            if payload.data.table.as_deref().is_some_and(|name| name != table) {
                return Ok(Inbound::Ignored);
            }
            decode_change(payload.data).map(Inbound::Change)
        }
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            let message = frame
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown realtime error");
            Ok(Inbound::ChannelError(message.to_string()))
        }
        "phx_error" => Ok(Inbound::ChannelError("channel crashed on the server".to_string())),
        "phx_close" => Ok(Inbound::ChannelError("channel closed by the server".to_string())),
        _ => Ok(Inbound::Ignored),
    }
}

fn decode_change(data: ChangeData) -> Result<ChangeEvent, String> {
    let kind = ChangeKind::parse(&data.kind)
        .ok_or_else(|| format!("unsupported change type '{}'", data.kind))?;

    let old_id = data.old_record.as_ref().and_then(row_id);
    let record = match kind {
        ChangeKind::Delete => None,
        ChangeKind::Insert | ChangeKind::Update => {
            let row = data
                .record
                .ok_or_else(|| format!("{} notification without a row", data.kind))?;
            let ticket: Ticket = serde_json::from_value(row)
                .map_err(|err| format!("undecodable {} row: {err}", data.kind))?;
            Some(ticket)
        }
    };

    if kind == ChangeKind::Delete && old_id.is_none() {
        return Err("delete notification without an id".to_string());
    }

    Ok(ChangeEvent {
        kind,
        record,
        old_id,
    })
}

fn row_id(row: &Value) -> Option<TicketId> {
    match row.get("id")? {
        Value::String(id) => Some(TicketId(id.clone())),
        Value::Number(id) => Some(TicketId(id.to_string())),
        _ => None,
    }
}

fn reference_matches(reference: &Value, expected: &str) -> bool {
    match reference {
        Value::String(value) => value == expected,
        Value::Number(value) => value.to_string() == expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::domain::ticket::{TicketCategory, TicketSentiment};
    use crate::sync::{SyncOptions, TicketSync};
    use crate::testing::{MockStore, ticket, wait_until};

    const TOPIC: &str = "realtime:tickets-changes";

    fn change_frame(kind: &str, record: Value, old_record: Value) -> String {
        json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "type": kind,
                    "schema": "public",
                    "table": "tickets",
                    "commit_timestamp": "2024-01-02T00:00:01Z",
                    "errors": null,
                    "record": record,
                    "old_record": old_record
                }
            },
            "ref": null
        })
        .to_string()
    }

    fn classified_row() -> Value {
        json!({
            "id": "a",
            "created_at": "2024-01-02T00:00:00+00:00",
            "description": "El sistema no carga desde esta mañana, necesito ayuda",
            "category": "Técnico",
            "sentiment": "Positivo",
            "processed": true
        })
    }

    #[test]
    fn derives_socket_url_from_project_url() {
        let config = RealtimeConfig::for_project("https://abc.supabase.co/", "anon").unwrap();
        assert_eq!(
            config.socket_url,
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert!(RealtimeConfig::for_project("abc.supabase.co", "anon").is_err());
    }

    #[tokio::test]
    async fn unconfigured_feed_refuses_subscriptions() {
        let result = RealtimeFeed::unconfigured().subscribe("tickets").await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn join_frame_requests_table_changes() {
        let frame: Value =
            serde_json::from_str(&join_frame(TOPIC, "public", "tickets", "anon", "1")).unwrap();
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["ref"], "1");
        let filter = &frame["payload"]["config"]["postgres_changes"][0];
        assert_eq!(filter["event"], "*");
        assert_eq!(filter["schema"], "public");
        assert_eq!(filter["table"], "tickets");
    }

    #[test]
    fn decodes_join_reply() {
        let ok = json!({"topic": TOPIC, "event": "phx_reply", "payload": {"status": "ok", "response": {}}, "ref": "1"});
        assert_eq!(
            decode_frame(&ok.to_string(), TOPIC, "1", "tickets"),
            Ok(Inbound::Joined)
        );

        let heartbeat_reply = json!({"topic": TOPIC, "event": "phx_reply", "payload": {"status": "ok"}, "ref": "7"});
        assert_eq!(
            decode_frame(&heartbeat_reply.to_string(), TOPIC, "1", "tickets"),
            Ok(Inbound::Ignored)
        );

        let refused = json!({"topic": TOPIC, "event": "phx_reply", "payload": {"status": "error", "response": {"reason": "unauthorized"}}, "ref": "1"});
        assert!(matches!(
            decode_frame(&refused.to_string(), TOPIC, "1", "tickets"),
            Ok(Inbound::ChannelError(reason)) if reason.contains("unauthorized")
        ));
    }

    #[test]
    fn decodes_update_notification() {
        let frame = change_frame("UPDATE", classified_row(), json!({"id": "a"}));
        let Ok(Inbound::Change(event)) = decode_frame(&frame, TOPIC, "1", "tickets") else {
            panic!("expected a change");
        };
        assert_eq!(event.kind, ChangeKind::Update);
        let ticket = event.record.unwrap();
        assert!(ticket.processed);
        assert_eq!(ticket.category, Some(TicketCategory::Tecnico));
        assert_eq!(ticket.sentiment, Some(TicketSentiment::Positivo));
    }

    #[test]
    fn decodes_delete_notification() {
        let frame = change_frame("DELETE", json!({}), json!({"id": "a"}));
        assert_eq!(
            decode_frame(&frame, TOPIC, "1", "tickets"),
            Ok(Inbound::Change(ChangeEvent::delete(TicketId::from("a"))))
        );

        let anonymous = change_frame("DELETE", json!({}), json!({}));
        assert!(decode_frame(&anonymous, TOPIC, "1", "tickets").is_err());
    }

    #[test]
    fn ignores_other_topics_and_tables() {
        let other_topic = json!({"topic": "realtime:other", "event": "postgres_changes", "payload": {}, "ref": null});
        assert_eq!(
            decode_frame(&other_topic.to_string(), TOPIC, "1", "tickets"),
            Ok(Inbound::Ignored)
        );

        let other_table = change_frame("INSERT", classified_row(), json!({}))
            .replace("\"table\":\"tickets\"", "\"table\":\"users\"");
        assert_eq!(
            decode_frame(&other_table, TOPIC, "1", "tickets"),
            Ok(Inbound::Ignored)
        );
    }

    #[test]
    fn undecodable_row_is_an_error() {
        let frame = change_frame("INSERT", json!({"id": "a"}), json!({}));
        assert!(decode_frame(&frame, TOPIC, "1", "tickets").is_err());
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_frame(socket: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["event"] != "heartbeat" {
                        return frame;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("expected a frame, got {other:?}"),
            }
        }
    }

    async fn reply_ok(socket: &mut WebSocketStream<TcpStream>, join: &Value) {
        let reply = json!({
            "topic": TOPIC,
            "event": "phx_reply",
            "payload": {"status": "ok", "response": {"postgres_changes": []}},
            "ref": join["ref"]
        });
        socket
            .send(Message::Text(reply.to_string().into()))
            .await
            .unwrap();
    }

    fn loopback_config(addr: std::net::SocketAddr) -> RealtimeConfig {
        RealtimeConfig {
            initial_delay_ms: 10,
            max_delay_secs: 1,
            heartbeat_interval: Duration::from_secs(30),
            ..RealtimeConfig::for_project(&format!("http://{addr}"), "anon").unwrap()
        }
    }

    async fn recv(subscription: &mut FeedSubscription) -> FeedMessage {
        tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("feed message in time")
            .expect("feed still open")
    }

    #[tokio::test]
    async fn streams_changes_and_resubscribes_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let feed = RealtimeFeed::new(loopback_config(listener.local_addr().unwrap()));
        let mut subscription = feed.subscribe("tickets").await.unwrap();

        let mut socket = accept(&listener).await;
        let join = next_frame(&mut socket).await;
        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["topic"], TOPIC);
        reply_ok(&mut socket, &join).await;
        assert_eq!(recv(&mut subscription).await, FeedMessage::Resubscribed);

        let update = change_frame("UPDATE", classified_row(), json!({"id": "a"}));
        socket.send(Message::Text(update.into())).await.unwrap();
        match recv(&mut subscription).await {
            FeedMessage::Change(event) => {
                assert_eq!(event.kind, ChangeKind::Update);
                assert_eq!(event.ticket_id(), Some(&TicketId::from("a")));
            }
            other => panic!("expected a change, got {other:?}"),
        }

        drop(socket);

        let mut socket = accept(&listener).await;
        let rejoin = next_frame(&mut socket).await;
        assert_eq!(rejoin["event"], "phx_join");
        assert_ne!(rejoin["ref"], join["ref"]);
        reply_ok(&mut socket, &rejoin).await;
        assert_eq!(recv(&mut subscription).await, FeedMessage::Resubscribed);

        let closing = tokio::spawn(subscription.close());
        let leave = tokio::time::timeout(Duration::from_secs(5), next_frame(&mut socket))
            .await
            .unwrap();
        assert_eq!(leave["event"], "phx_leave");
        closing.await.unwrap();
    }

    #[tokio::test]
    async fn sync_reloads_once_the_channel_is_live() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let feed = RealtimeFeed::new(loopback_config(listener.local_addr().unwrap()));
        let store = Arc::new(MockStore::with_rows(vec![ticket("a", "2024-01-02T00:00:00Z")]));
        let sync = TicketSync::start(store.clone(), Arc::new(feed), SyncOptions::default()).await;

        let mut socket = accept(&listener).await;
        let join = next_frame(&mut socket).await;
        wait_until(|| store.calls() == 1 && !sync.state().loading).await;

        // Classified after the first listing but before the channel was live.
        let mut classified = ticket("a", "2024-01-02T00:00:00Z");
        classified.processed = true;
        store.set_rows(vec![classified]);
        reply_ok(&mut socket, &join).await;

        wait_until(|| {
            sync.state()
                .tickets
                .get(&TicketId::from("a"))
                .is_some_and(|ticket| ticket.processed)
        })
        .await;
        assert_eq!(store.calls(), 2);

        let (leave, ()) = tokio::join!(next_frame(&mut socket), sync.shutdown());
        assert_eq!(leave["event"], "phx_leave");
    }
}
