//! WebSocket Bridge (C11).
//!
//! A single hub accepts UI clients at `/ws`, replays a bounded message
//! history to each new connection, fans out future events, and exposes a
//! start/stop control channel. Modeled on the accept/dispatch split in the
//! sibling `loom` example repo's `serve::connection::handle_socket` (a
//! `while let Some(res) = socket.recv().await` loop matching `Message::Text`
//! and dispatching a deserialized request to a handler), generalized here
//! from one-request-one-response into one control message driving
//! many-events-out.

use crate::config::{ConfigHandle, LlmConfigOverride};
use crate::domain::ConnectionInfo;
use crate::events::{Event, EventEnvelope, EventSink, SharedSink};
use crate::supervisor::{RunMode, Supervisor};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HISTORY_CAPACITY: usize = 1000;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const STALE_AFTER: Duration = KEEPALIVE_INTERVAL.saturating_mul(4);
const REPLAY_SPACING: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ClientRequest {
    StartSystem(StartSystemData),
    StopSystem,
    KeepaliveAck,
}

#[derive(Debug, Clone, Deserialize)]
struct StartSystemData {
    project_id: String,
    mode: String,
    specific_issue: Option<u64>,
    #[serde(default)]
    auto_merge: bool,
    #[serde(default)]
    debug: bool,
    llm_config: Option<LlmConfigOverride>,
}

#[derive(Debug, Clone, Serialize)]
struct Keepalive {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Default, Clone)]
struct SessionState {
    running: bool,
    current_stage: Option<String>,
}

/// Constructs a fresh [`Supervisor`] for one `start_system` request. The
/// concrete wiring (tool bridge endpoint, logs root) lives with the
/// binary/CLI layer; the hub only needs to be able to build and run one.
pub trait SupervisorFactory: Send + Sync {
    fn build(&self, project_id: &str, sink: SharedSink) -> Supervisor;
}

struct ClientHandle {
    info: ConnectionInfo,
    sender: broadcast::Sender<EventEnvelope>,
    /// Dedicated ping channel so the keepalive loop's send can genuinely
    /// stall against a wedged connection task, instead of racing the
    /// zero-receivers-only failure mode of a non-blocking broadcast send.
    ping_tx: mpsc::Sender<()>,
}

pub struct WebSocketHub {
    history: Mutex<VecDeque<EventEnvelope>>,
    connections: Mutex<HashMap<Uuid, ClientHandle>>,
    session: Mutex<SessionState>,
    running_supervisor: Mutex<Option<CancellationToken>>,
    config: ConfigHandle,
    factory: Arc<dyn SupervisorFactory>,
}

impl WebSocketHub {
    pub fn new(config: ConfigHandle, factory: Arc<dyn SupervisorFactory>) -> Arc<Self> {
        Arc::new(WebSocketHub {
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            connections: Mutex::new(HashMap::new()),
            session: Mutex::new(SessionState::default()),
            running_supervisor: Mutex::new(None),
            config,
            factory,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_handler)).with_state(self.clone())
    }

    /// Publishing an event appends it to history, serializes once, and
    /// fans it out; a send failure on one connection only drops that
    /// connection (via `broadcast::Sender::send`'s per-receiver delivery).
    async fn publish(&self, event: Event) {
        let envelope = EventEnvelope::now(event);
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(envelope.clone());
        drop(history);

        let connections = self.connections.lock().await;
        for handle in connections.values() {
            let _ = handle.sender.send(envelope.clone());
        }
    }

    async fn accept(
        self: &Arc<Self>,
    ) -> (Uuid, broadcast::Receiver<EventEnvelope>, Vec<EventEnvelope>, mpsc::Receiver<()>) {
        let (tx, rx) = broadcast::channel(HISTORY_CAPACITY);
        let (ping_tx, ping_rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        let history_snapshot: Vec<EventEnvelope> = self.history.lock().await.iter().cloned().collect();
        self.connections.lock().await.insert(id, ClientHandle { info: ConnectionInfo::new(), sender: tx, ping_tx });
        (id, rx, history_snapshot, ping_rx)
    }

    async fn remove(&self, id: Uuid) {
        self.connections.lock().await.remove(&id);
    }

    async fn touch_activity(&self, id: Uuid) {
        if let Some(handle) = self.connections.lock().await.get_mut(&id) {
            handle.info.last_activity_at = chrono::Utc::now();
        }
    }

    async fn handle_start_system(self: &Arc<Self>, data: StartSystemData) {
        let mut running = self.running_supervisor.lock().await;
        if running.is_some() {
            self.publish(Event::Error { message: "a supervisor run is already in progress".to_string(), traceback: None }).await;
            return;
        }

        if let Some(llm) = data.llm_config.clone() {
            if !self.config.try_update(llm).await {
                self.publish(Event::Error { message: "config update rejected: a run is in progress".to_string(), traceback: None }).await;
                return;
            }
        }

        let mode = match data.mode.as_str() {
            "implement" | "single_issue" => RunMode::Implement,
            _ => RunMode::Analyze,
        };
        let specific_issue = if data.mode == "single_issue" { data.specific_issue } else { None };
        let _ = data.auto_merge;
        let _ = data.debug;

        let ctx = CancellationToken::new();
        *running = Some(ctx.clone());
        drop(running);

        self.session.lock().await.running = true;

        let hub = self.clone();
        let project_id = data.project_id.clone();
        tokio::spawn(async move {
            let sink: SharedSink = Arc::new(HubSink { hub: hub.clone() });
            let supervisor = hub.factory.build(&project_id, sink);
            let result = supervisor.execute(mode, specific_issue, false, ctx).await;
            if let Err(e) = result {
                hub.publish(Event::Error { message: e.to_string(), traceback: None }).await;
            }
            *hub.running_supervisor.lock().await = None;
            hub.session.lock().await.running = false;
        });
    }

    async fn handle_stop_system(&self) {
        if let Some(ctx) = self.running_supervisor.lock().await.as_ref() {
            ctx.cancel();
        }
    }

    pub async fn run_keepalive_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            let now = chrono::Utc::now();
            let mut stale = Vec::new();
            {
                let mut connections = self.connections.lock().await;
                for (id, handle) in connections.iter_mut() {
                    handle.info.last_ping_sent_at = Some(now);
                    let send = tokio::time::timeout(KEEPALIVE_SEND_TIMEOUT, handle.ping_tx.send(())).await;
                    if !matches!(send, Ok(Ok(()))) {
                        stale.push(*id);
                        continue;
                    }
                    if now.signed_duration_since(handle.info.last_activity_at).to_std().unwrap_or_default() > STALE_AFTER {
                        log::warn!("connection {} looks stale (no activity in {:?})", id, STALE_AFTER);
                    }
                }
                for id in &stale {
                    connections.remove(id);
                }
            }
        }
    }
}

struct HubSink {
    hub: Arc<WebSocketHub>,
}

impl EventSink for HubSink {
    fn emit(&self, event: Event) {
        let hub = self.hub.clone();
        tokio::spawn(async move { hub.publish(event).await });
    }
}

async fn ws_handler(State(hub): State<Arc<WebSocketHub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<WebSocketHub>) {
    let (id, mut rx, history, mut ping_rx) = hub.accept().await;

    for envelope in history {
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if socket.send(Message::Text(payload.into())).await.is_err() {
            hub.remove(id).await;
            return;
        }
        tokio::time::sleep(REPLAY_SPACING).await;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let msg = match incoming {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        log::warn!("ws read error, dropping connection: {}", e);
                        break;
                    }
                    None => break,
                };
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                hub.touch_activity(id).await;
                match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(ClientRequest::StartSystem(data)) => hub.handle_start_system(data).await,
                    Ok(ClientRequest::StopSystem) => hub.handle_stop_system().await,
                    Ok(ClientRequest::KeepaliveAck) => {}
                    Err(e) => log::warn!("ws: ignoring unparseable client message: {}", e),
                }
            }
            broadcast_msg = rx.recv() => {
                match broadcast_msg {
                    Ok(envelope) => {
                        let payload = match serde_json::to_string(&envelope) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            ping = ping_rx.recv() => {
                if ping.is_none() {
                    break;
                }
                let payload = match serde_json::to_string(&Keepalive { kind: "keepalive" }) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.remove(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_appends_to_history_up_to_capacity() {
        let config = ConfigHandle::new(crate::config::Config::from_env());
        struct DummyFactory;
        impl SupervisorFactory for DummyFactory {
            fn build(&self, _project_id: &str, _sink: SharedSink) -> Supervisor {
                unimplemented!("not exercised in this test")
            }
        }
        let hub = WebSocketHub::new(config, Arc::new(DummyFactory));
        for i in 0..5 {
            hub.publish(Event::McpLog { message: format!("line {}", i), level: "info".to_string() }).await;
        }
        assert_eq!(hub.history.lock().await.len(), 5);
    }

    struct DummyFactory;
    impl SupervisorFactory for DummyFactory {
        fn build(&self, _project_id: &str, _sink: SharedSink) -> Supervisor {
            unimplemented!("not exercised in this test")
        }
    }

    fn log_event(message: &str) -> Event {
        Event::McpLog { message: message.to_string(), level: "info".to_string() }
    }

    fn envelope_message(envelope: &EventEnvelope) -> String {
        match &envelope.event {
            Event::McpLog { message, .. } => message.clone(),
            other => panic!("unexpected event in test stream: {:?}", other),
        }
    }

    /// Mirrors the WebSocket replay scenario: client A connects at t=0 and
    /// observes E1..E5 live; client B connects after E6/E7 have already been
    /// broadcast and must receive E1..E7 via replay before observing E8 live
    /// alongside A.
    #[tokio::test]
    async fn late_joiner_replays_full_history_then_sees_live_events_with_earlier_client() {
        let config = ConfigHandle::new(crate::config::Config::from_env());
        let hub = WebSocketHub::new(config, Arc::new(DummyFactory));

        let (_id_a, mut rx_a, history_a, _ping_rx_a) = hub.accept().await;
        assert!(history_a.is_empty());

        for i in 1..=5 {
            hub.publish(log_event(&format!("E{}", i))).await;
        }
        for i in 1..=5 {
            let envelope = rx_a.recv().await.unwrap();
            assert_eq!(envelope_message(&envelope), format!("E{}", i));
        }

        for i in 6..=7 {
            hub.publish(log_event(&format!("E{}", i))).await;
        }

        let (_id_b, mut rx_b, history_b, _ping_rx_b) = hub.accept().await;
        let replayed: Vec<String> = history_b.iter().map(envelope_message).collect();
        assert_eq!(replayed, vec!["E1", "E2", "E3", "E4", "E5", "E6", "E7"]);

        // A, having been connected the whole time, also observed E6/E7 live.
        for i in 6..=7 {
            let envelope = rx_a.recv().await.unwrap();
            assert_eq!(envelope_message(&envelope), format!("E{}", i));
        }

        hub.publish(log_event("E8")).await;
        assert_eq!(envelope_message(&rx_a.recv().await.unwrap()), "E8");
        assert_eq!(envelope_message(&rx_b.recv().await.unwrap()), "E8");
    }

    #[test]
    fn keepalive_serializes_to_bare_type_tag() {
        let payload = serde_json::to_string(&Keepalive { kind: "keepalive" }).unwrap();
        assert_eq!(payload, r#"{"type":"keepalive"}"#);
    }

    /// A connection whose task never drains `ping_rx` (e.g. wedged on a slow
    /// socket write) must make the keepalive loop's bounded send actually
    /// stall rather than fail immediately, so the timeout can detect it.
    #[tokio::test]
    async fn ping_send_blocks_once_the_bounded_channel_is_full() {
        let config = ConfigHandle::new(crate::config::Config::from_env());
        let hub = WebSocketHub::new(config, Arc::new(DummyFactory));
        let (id, _rx, _history, _ping_rx) = hub.accept().await;

        let ping_tx = {
            let connections = hub.connections.lock().await;
            connections.get(&id).unwrap().ping_tx.clone()
        };
        // Capacity is 1 and nothing ever calls `ping_rx.recv()` here, so the
        // first send fills the channel and the second must block.
        ping_tx.send(()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), ping_tx.send(())).await;
        assert!(second.is_err(), "send on a full bounded channel with no reader should stall, not return immediately");
    }
}
