use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use marionette_core::ids::{ClientId, RequestId, SubscriptionId};
use marionette_core::wire::{
    error_frame, progress_frame, result_frame, subscription_frame, CommandProgress, EnvelopeKind,
    InvocationPayload, RequestEnvelope, SubscriptionAction, INVOKE_MANIFEST,
};

use crate::engine::{Engine, ProgressSink};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PEER_TIMEOUT: Duration = Duration::from_secs(90);

/// A connected WebSocket peer. The channel is set once a join envelope is
/// accepted; every other envelope is rejected until then.
pub struct Peer {
    pub id: ClientId,
    pub channel: RwLock<Option<String>>,
    pub tx: mpsc::Sender<String>,
    pub connected: AtomicBool,
    pub last_pong: AtomicU64,
}

impl Peer {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            channel: RwLock::new(None),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < PEER_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected peers.
pub struct PeerRegistry {
    peers: DashMap<ClientId, Arc<Peer>>,
    max_send_queue: usize,
}

impl PeerRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            peers: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new peer and return its ID + outbound queue receiver.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.peers.insert(id.clone(), Arc::new(Peer::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, peer)) = self.peers.remove(id) {
            peer.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn set_channel(&self, id: &ClientId, channel: &str) {
        if let Some(peer) = self.peers.get(id) {
            *peer.channel.write() = Some(channel.to_owned());
        }
    }

    pub fn channel_of(&self, id: &ClientId) -> Option<String> {
        self.peers.get(id).and_then(|p| p.channel.read().clone())
    }

    /// Send a message to one peer. A full queue drops the message and logs.
    pub fn send_to(&self, id: &ClientId, message: String) -> bool {
        let Some(peer) = self.peers.get(id) else { return false };
        match peer.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Push a message to every connected peer joined to a channel.
    pub fn broadcast_to_channel(&self, channel: &str, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.peers.iter() {
            let peer = entry.value();
            let joined = peer.channel.read().as_deref() == Some(channel);
            if joined && peer.is_connected() && peer.tx.try_send(message.to_owned()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn channel_has_peers(&self, channel: &str) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.value().channel.read().as_deref() == Some(channel))
    }

    /// Peers that have not answered pings within the timeout.
    pub fn dead_peers(&self) -> Vec<ClientId> {
        self.peers
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Routing state shared by the message processor and the pump tasks:
/// subscriptions route to the channel they were created in, progress
/// updates route to the peer whose request is still in flight.
pub struct ServerCore {
    pub engine: Arc<Engine>,
    pub peers: Arc<PeerRegistry>,
    channel_of_sub: DashMap<SubscriptionId, String>,
    active_requests: DashMap<RequestId, ClientId>,
    progress_tx: mpsc::UnboundedSender<(RequestId, CommandProgress)>,
}

impl ServerCore {
    fn new(
        engine: Arc<Engine>,
        peers: Arc<PeerRegistry>,
        progress_tx: mpsc::UnboundedSender<(RequestId, CommandProgress)>,
    ) -> Self {
        Self {
            engine,
            peers,
            channel_of_sub: DashMap::new(),
            active_requests: DashMap::new(),
            progress_tx,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.channel_of_sub.len()
    }

    /// Forget a peer. When it was the last peer of its channel, the
    /// channel's subscriptions transition to absent: the hub bindings are
    /// unbound and the routing entries dropped.
    pub fn release_peer(&self, client_id: &ClientId) {
        let channel = self.peers.channel_of(client_id);
        self.peers.unregister(client_id);
        if let Some(channel) = channel {
            if !self.peers.channel_has_peers(&channel) {
                self.drop_channel_subscriptions(&channel);
            }
        }
    }

    fn drop_channel_subscriptions(&self, channel: &str) {
        let orphaned: Vec<SubscriptionId> = self
            .channel_of_sub
            .iter()
            .filter(|entry| entry.value() == channel)
            .map(|entry| entry.key().clone())
            .collect();
        for id in orphaned {
            self.channel_of_sub.remove(&id);
            self.engine.scene().hub().unbind(&id);
            tracing::info!(subscription_id = %id, channel, "Dropped subscription with its channel");
        }
    }

    /// Release peers that have stopped answering pings.
    pub fn reap_dead_peers(&self) -> usize {
        let dead = self.peers.dead_peers();
        for id in &dead {
            self.release_peer(id);
            tracing::info!(client_id = %id, "Cleaned up dead peer");
        }
        dead.len()
    }

    fn send_frame(&self, client_id: &ClientId, frame: Value) {
        self.peers.send_to(client_id, frame.to_string());
    }

    /// Handle one raw inbound frame from a peer.
    pub async fn handle_frame(self: Arc<Self>, client_id: ClientId, raw: String) {
        let envelope: RequestEnvelope = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(e) => {
                // Salvage the request id if the frame was valid JSON so the
                // sender's correlation can still reject.
                let id = serde_json::from_str::<Value>(&raw)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_str).map(RequestId::from_raw));
                tracing::warn!(client_id = %client_id, error = %e, "Malformed envelope");
                if let Some(id) = id {
                    self.send_frame(&client_id, error_frame(&id, "malformed envelope"));
                }
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::Join => {
                self.peers.set_channel(&client_id, &envelope.channel);
                tracing::info!(client_id = %client_id, channel = %envelope.channel, "Peer joined channel");
                let ack = json!({ "channel": envelope.channel, "joined": true });
                self.send_frame(&client_id, result_frame(&envelope.message.id, &ack));
            }
            EnvelopeKind::Message => {
                let Some(channel) = self.peers.channel_of(&client_id) else {
                    self.send_frame(
                        &client_id,
                        error_frame(
                            &envelope.message.id,
                            "must join a channel before sending messages",
                        ),
                    );
                    return;
                };
                self.dispatch_command(client_id, channel, envelope).await;
            }
        }
    }

    async fn dispatch_command(
        self: Arc<Self>,
        client_id: ClientId,
        channel: String,
        envelope: RequestEnvelope,
    ) {
        let request_id = envelope.message.id.clone();
        if envelope.message.command != INVOKE_MANIFEST {
            self.send_frame(
                &client_id,
                error_frame(
                    &request_id,
                    &format!("unknown command: {}", envelope.message.command),
                ),
            );
            return;
        }

        let payload: InvocationPayload = match serde_json::from_value(envelope.message.params) {
            Ok(p) => p,
            Err(e) => {
                self.send_frame(
                    &client_id,
                    error_frame(&request_id, &format!("invalid invocation payload: {e}")),
                );
                return;
            }
        };

        // Execute off the processor loop so a slow invocation cannot stall
        // other peers, and so progress frames interleave with it.
        let core = Arc::clone(&self);
        tokio::spawn(async move {
            core.active_requests.insert(request_id.clone(), client_id.clone());
            let sink = ProgressSink::new(request_id.clone(), payload.method.clone(), core.progress_tx.clone());
            let outcome = core.engine.execute(&payload, &sink).await;
            core.active_requests.remove(&request_id);

            match outcome {
                Ok(body) => {
                    if let (Some(sub_id), Some(action)) =
                        (body.subscription_id.clone(), body.subscription_action)
                    {
                        match action {
                            SubscriptionAction::Subscribe => {
                                core.channel_of_sub.insert(sub_id, channel);
                            }
                            SubscriptionAction::Unsubscribe => {
                                core.channel_of_sub.remove(&sub_id);
                            }
                        }
                    }
                    match serde_json::to_value(&body) {
                        Ok(value) => {
                            core.send_frame(&client_id, result_frame(&request_id, &value));
                        }
                        Err(e) => {
                            core.send_frame(
                                &client_id,
                                error_frame(&request_id, &format!("unserializable result: {e}")),
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(request_id = %request_id, error = %e, "Invocation failed");
                    core.send_frame(&client_id, error_frame(&request_id, &e.to_string()));
                }
            }
        });
    }
}

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3055,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ServerCore>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, engine: Arc<Engine>) -> Result<ServerHandle, std::io::Error> {
    let peers = Arc::new(PeerRegistry::new(config.max_send_queue));
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let core = Arc::new(ServerCore::new(engine, Arc::clone(&peers), progress_tx));

    // Message processing channel
    let (msg_tx, mut msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let proc_core = Arc::clone(&core);
    let proc_handle = tokio::spawn(async move {
        while let Some((client_id, raw)) = msg_rx.recv().await {
            Arc::clone(&proc_core).handle_frame(client_id, raw).await;
        }
    });

    let events_handle = tokio::spawn(pump_subscription_events(Arc::clone(&core)));
    let progress_handle = tokio::spawn(pump_progress(Arc::clone(&core), progress_rx));

    // Dead-peer cleanup task (every 60s)
    let cleanup_core = Arc::clone(&core);
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let removed = cleanup_core.reap_dead_peers();
            if removed > 0 {
                tracing::info!(removed, "Dead peer cleanup");
            }
        }
    });

    let app_state = AppState {
        core: Arc::clone(&core),
        message_tx: msg_tx,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Bridge host started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        core,
        _server: server_handle,
        _proc: proc_handle,
        _events: events_handle,
        _progress: progress_handle,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub core: Arc<ServerCore>,
    _server: tokio::task::JoinHandle<()>,
    _proc: tokio::task::JoinHandle<()>,
    _events: tokio::task::JoinHandle<()>,
    _progress: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// Forward host-emitted subscription events to the channel each
/// subscription was created in. Events for unrouted subscriptions drop.
async fn pump_subscription_events(core: Arc<ServerCore>) {
    let mut rx = core.engine.scene().hub().subscribe_events();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(channel) = core
                    .channel_of_sub
                    .get(&event.subscription_id)
                    .map(|c| c.value().clone())
                else {
                    tracing::trace!(subscription_id = %event.subscription_id, "Dropping unrouted event");
                    continue;
                };
                let frame = subscription_frame(&event).to_string();
                core.peers.broadcast_to_channel(&channel, &frame);
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Subscription event pump lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Forward progress keep-alives to the peer whose request is in flight.
async fn pump_progress(
    core: Arc<ServerCore>,
    mut rx: mpsc::UnboundedReceiver<(RequestId, CommandProgress)>,
) {
    while let Some((request_id, update)) = rx.recv().await {
        let Some(client_id) = core.active_requests.get(&request_id).map(|c| c.value().clone())
        else {
            continue;
        };
        core.peers
            .send_to(&client_id, progress_frame(&request_id, &update).to_string());
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.core.peers.register();
    tracing::info!(client_id = %client_id, "WebSocket peer connected");

    handle_ws_connection(socket, client_id, rx, Arc::clone(&state.core), state.message_tx).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "peers": state.core.peers.count(),
        "subscriptions": state.core.subscription_count(),
        "entities": state.core.engine.scene().entity_count(),
    }))
}

/// Drive one WebSocket connection: split into reader/writer, manage
/// lifecycle with a heartbeat.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    core: Arc<ServerCore>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued frames + periodic ping
    let writer_cid = client_id.clone();
    let writer_peers = Arc::clone(&core.peers);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "Sent ping");
                }
            }
        }

        if let Some(peer) = writer_peers.peers.get(&writer_cid) {
            peer.connected.store(false, Ordering::Relaxed);
        }
    });

    // Reader task: forward frames to the processor, track pongs
    let reader_cid = client_id.clone();
    let reader_peers = Arc::clone(&core.peers);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(peer) = reader_peers.peers.get(&reader_cid) {
                        peer.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pings automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    core.release_peer(&client_id);
}
