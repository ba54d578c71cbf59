//! Persistent WebSocket transport: one connection, request/response
//! correlation by id, progress-aware timeouts, and automatic reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use marionette_core::errors::BridgeError;
use marionette_core::ids::RequestId;
use marionette_core::wire::{classify_inbound, Inbound, RequestEnvelope};

use crate::subscriptions::SubscriptionRelay;

/// Transport tuning. Defaults mirror the host's expectations: commands
/// joining a channel get a short window, synchronous invocations a medium
/// one, and asynchronous invocations the same window a progress update
/// refreshes.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub join_timeout: Duration,
    pub sync_timeout: Duration,
    pub async_timeout: Duration,
    pub progress_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3055/ws".to_owned(),
            reconnect_delay: Duration::from_secs(2),
            join_timeout: Duration::from_secs(15),
            sync_timeout: Duration::from_secs(30),
            async_timeout: Duration::from_secs(60),
            progress_grace: Duration::from_secs(60),
        }
    }
}

struct Pending {
    resolver: oneshot::Sender<Result<Value, BridgeError>>,
    deadline: Instant,
}

/// Everything that changes with the connection, owned by one lock so a
/// disconnect transitions it atomically: liveness, joined channel, the
/// outbound queue, and the correlation map.
struct ConnState {
    connected: bool,
    channel: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<RequestId, Pending>,
}

struct Shared {
    state: Mutex<ConnState>,
    relay: SubscriptionRelay,
    cfg: TransportConfig,
    shutdown: AtomicBool,
}

impl Shared {
    fn new(cfg: TransportConfig) -> Self {
        Self {
            state: Mutex::new(ConnState {
                connected: false,
                channel: None,
                outbound: None,
                pending: HashMap::new(),
            }),
            relay: SubscriptionRelay::new(),
            cfg,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Dispatch one raw inbound frame.
    fn handle_raw(&self, raw: &str) {
        match classify_inbound(raw) {
            Ok(Inbound::Progress { request_id, update }) => {
                let mut state = self.state.lock();
                if let Some(pending) = state.pending.get_mut(&request_id) {
                    pending.deadline = Instant::now() + self.cfg.progress_grace;
                    tracing::debug!(
                        request_id = %request_id,
                        progress = update.progress,
                        status = ?update.status,
                        "Progress update"
                    );
                } else {
                    tracing::trace!(request_id = %request_id, "Progress for unknown request");
                }
            }
            Ok(Inbound::Subscription { event }) => self.relay.handle_event(&event),
            Ok(Inbound::Terminal { request_id, outcome }) => {
                let pending = self.state.lock().pending.remove(&request_id);
                match pending {
                    Some(p) => {
                        let _ = p.resolver.send(outcome.map_err(BridgeError::Remote));
                    }
                    None => {
                        tracing::trace!(request_id = %request_id, "Dropping orphaned response");
                    }
                }
            }
            Ok(Inbound::Intermediate { request_id }) => {
                tracing::trace!(request_id = %request_id, "Intermediate envelope, still pending");
            }
            Ok(Inbound::Broadcast { .. }) => {
                tracing::trace!("Dropping broadcast frame");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable inbound frame");
            }
        }
    }

    /// Reject everything overdue.
    fn sweep(&self, now: Instant) {
        let expired: Vec<Pending> = {
            let mut state = self.state.lock();
            let ids: Vec<RequestId> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .collect()
        };
        for pending in expired {
            let _ = pending.resolver.send(Err(BridgeError::Timeout));
        }
    }

    /// Drop connection state and reject every in-flight request. The
    /// joined channel does not survive a reconnect.
    fn on_disconnect(&self) {
        let rejected: Vec<Pending> = {
            let mut state = self.state.lock();
            state.connected = false;
            state.channel = None;
            state.outbound = None;
            state.pending.drain().map(|(_, p)| p).collect()
        };
        if !rejected.is_empty() {
            tracing::warn!(count = rejected.len(), "Rejecting in-flight requests on disconnect");
        }
        for pending in rejected {
            let _ = pending.resolver.send(Err(BridgeError::ConnectionClosed));
        }
    }

    /// Queue one envelope and register its correlation. Fails fast when
    /// not connected, or when a channel is required but not joined.
    fn enqueue(
        &self,
        envelope: &RequestEnvelope,
        require_channel: bool,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Value, BridgeError>>, BridgeError> {
        let text = serde_json::to_string(envelope)
            .map_err(|e| BridgeError::InvalidEnvelope(e.to_string()))?;

        let mut state = self.state.lock();
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        if require_channel && state.channel.is_none() {
            return Err(BridgeError::ChannelNotJoined);
        }
        let Some(outbound) = state.outbound.clone() else {
            return Err(BridgeError::NotConnected);
        };

        let (resolver, rx) = oneshot::channel();
        state.pending.insert(
            envelope.message.id.clone(),
            Pending {
                resolver,
                deadline: Instant::now() + timeout,
            },
        );

        if outbound.send(text).is_err() {
            state.pending.remove(&envelope.message.id);
            return Err(BridgeError::ConnectionClosed);
        }
        Ok(rx)
    }
}

/// Handle to the persistent connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Validate the endpoint and spawn the connection supervisor. The
    /// supervisor retries with a fixed delay until `close` is called.
    pub fn connect(cfg: TransportConfig) -> Result<Self, BridgeError> {
        Url::parse(&cfg.url).map_err(|e| BridgeError::InvalidArgument {
            name: "url".to_owned(),
            reason: e.to_string(),
        })?;

        let shared = Arc::new(Shared::new(cfg));
        tokio::spawn(supervise(Arc::clone(&shared)));
        Ok(Self { shared })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.cfg
    }

    pub fn relay(&self) -> &SubscriptionRelay {
        &self.shared.relay
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn channel(&self) -> Option<String> {
        self.shared.state.lock().channel.clone()
    }

    /// Poll until the supervisor establishes a connection, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.is_connected()
    }

    /// Join a channel; required before any command is accepted.
    pub async fn join_channel(&self, channel: &str) -> Result<(), BridgeError> {
        let envelope = RequestEnvelope::join(RequestId::new(), channel);
        let rx = self
            .shared
            .enqueue(&envelope, false, self.shared.cfg.join_timeout)?;
        let ack = await_resolution(rx).await?;
        self.shared.state.lock().channel = Some(channel.to_owned());
        tracing::info!(channel, ack = %ack, "Joined channel");
        Ok(())
    }

    /// Send one command and await its terminal response.
    pub async fn send_command(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let channel = self
            .channel()
            .ok_or(BridgeError::ChannelNotJoined)?;
        let envelope = RequestEnvelope::message(RequestId::new(), &channel, command, params);
        let rx = self.shared.enqueue(&envelope, true, timeout)?;
        await_resolution(rx).await
    }

    /// Stop reconnecting and drop the connection.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.on_disconnect();
    }
}

async fn await_resolution(
    rx: oneshot::Receiver<Result<Value, BridgeError>>,
) -> Result<Value, BridgeError> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(BridgeError::ConnectionClosed),
    }
}

async fn supervise(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match connect_async(&shared.cfg.url).await {
            Ok((socket, _)) => {
                tracing::info!(url = %shared.cfg.url, "Connected to host");
                drive(&shared, socket).await;
                tracing::warn!("Connection lost");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connection attempt failed");
            }
        }
        shared.on_disconnect();
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(shared.cfg.reconnect_delay).await;
    }
}

async fn drive<S>(shared: &Arc<Shared>, socket: S)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    {
        let mut state = shared.state.lock();
        state.connected = true;
        state.outbound = Some(out_tx);
    }

    let mut sweep_interval = tokio::time::interval(Duration::from_millis(500));
    sweep_interval.tick().await; // consume first immediate tick

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            let _ = ws_tx.send(Message::Close(None)).await;
            break;
        }
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => shared.handle_raw(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
            queued = out_rx.recv() => {
                match queued {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = sweep_interval.tick() => {
                shared.sweep(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marionette_core::wire::{progress_frame, result_frame, CommandProgress, ProgressStatus};
    use serde_json::json;

    fn connected_shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<String>) {
        let shared = Arc::new(Shared::new(TransportConfig::default()));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        {
            let mut state = shared.state.lock();
            state.connected = true;
            state.channel = Some("alpha".to_owned());
            state.outbound = Some(out_tx);
        }
        (shared, out_rx)
    }

    fn progress(status: ProgressStatus) -> CommandProgress {
        CommandProgress {
            command_type: "invoke_manifest".into(),
            status,
            progress: 50,
            processed_items: 0,
            total_items: 0,
            message: "working".into(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn terminal_result_resolves_the_correlation() {
        let (shared, mut out_rx) = connected_shared();
        let envelope = RequestEnvelope::message(
            RequestId::from_raw("req_1"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        let rx = shared.enqueue(&envelope, true, Duration::from_secs(30)).unwrap();
        assert!(out_rx.try_recv().is_ok());

        shared.handle_raw(&result_frame(&RequestId::from_raw("req_1"), &json!({"ok": true})).to_string());
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["ok"], json!(true));
    }

    #[tokio::test]
    async fn terminal_error_rejects_with_remote() {
        let (shared, _out_rx) = connected_shared();
        let envelope = RequestEnvelope::message(
            RequestId::from_raw("req_2"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        let rx = shared.enqueue(&envelope, true, Duration::from_secs(30)).unwrap();

        shared.handle_raw(r#"{"message":{"id":"req_2","error":"no manifest entry found"}}"#);
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Remote(msg) if msg.contains("manifest")));
    }

    #[tokio::test]
    async fn sweep_times_out_overdue_requests() {
        let (shared, _out_rx) = connected_shared();
        let envelope = RequestEnvelope::message(
            RequestId::from_raw("req_3"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        let rx = shared.enqueue(&envelope, true, Duration::from_millis(0)).unwrap();

        shared.sweep(Instant::now() + Duration::from_millis(1));
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Timeout)));
        assert!(shared.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn progress_extends_the_deadline() {
        let (shared, _out_rx) = connected_shared();
        let id = RequestId::from_raw("req_4");
        let envelope =
            RequestEnvelope::message(id.clone(), "alpha", "invoke_manifest", json!({}));
        let rx = shared.enqueue(&envelope, true, Duration::from_millis(0)).unwrap();

        shared.handle_raw(&progress_frame(&id, &progress(ProgressStatus::InProgress)).to_string());

        // The original deadline has long passed, but the progress grace
        // keeps the request alive.
        shared.sweep(Instant::now() + Duration::from_secs(1));
        assert!(shared.state.lock().pending.contains_key(&id));

        shared.handle_raw(&result_frame(&id, &json!(1)).to_string());
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn disconnect_rejects_all_and_clears_channel() {
        let (shared, _out_rx) = connected_shared();
        let first = RequestEnvelope::message(
            RequestId::from_raw("req_5"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        let second = RequestEnvelope::message(
            RequestId::from_raw("req_5b"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        let rx1 = shared.enqueue(&first, true, Duration::from_secs(30)).unwrap();
        let rx2 = shared.enqueue(&second, true, Duration::from_secs(30)).unwrap();

        shared.on_disconnect();
        assert!(matches!(rx1.await.unwrap(), Err(BridgeError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(BridgeError::ConnectionClosed)));

        let state = shared.state.lock();
        assert!(!state.connected);
        assert!(state.channel.is_none());
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn dropped_connection_rejects_pendings_then_reconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (drop_tx, drop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            // First connection: hold it open until told to hang up.
            let (stream, _) = listener.accept().await.unwrap();
            let first = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop_rx.await.ok();
            drop(first);
            // Second connection: keep it alive.
            let (stream, _) = listener.accept().await.unwrap();
            let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
            while second.next().await.is_some() {}
        });

        let cfg = TransportConfig {
            url: format!("ws://127.0.0.1:{port}/ws"),
            reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let transport = Transport::connect(cfg).unwrap();
        assert!(transport.wait_connected(Duration::from_secs(5)).await);

        transport.shared.state.lock().channel = Some("alpha".to_owned());
        let rx1 = transport
            .shared
            .enqueue(
                &RequestEnvelope::message(
                    RequestId::from_raw("req_r1"),
                    "alpha",
                    "invoke_manifest",
                    json!({}),
                ),
                true,
                Duration::from_secs(30),
            )
            .unwrap();
        let rx2 = transport
            .shared
            .enqueue(
                &RequestEnvelope::message(
                    RequestId::from_raw("req_r2"),
                    "alpha",
                    "invoke_manifest",
                    json!({}),
                ),
                true,
                Duration::from_secs(30),
            )
            .unwrap();

        drop_tx.send(()).unwrap();
        assert!(matches!(rx1.await.unwrap(), Err(BridgeError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(BridgeError::ConnectionClosed)));
        assert!(transport.shared.state.lock().pending.is_empty());

        // The supervisor retries after the delay and lands on the second
        // accepted connection.
        assert!(transport.wait_connected(Duration::from_secs(5)).await);
        transport.close();
    }

    #[tokio::test]
    async fn enqueue_fails_fast_when_not_connected() {
        let shared = Arc::new(Shared::new(TransportConfig::default()));
        let envelope = RequestEnvelope::message(
            RequestId::from_raw("req_6"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        assert!(matches!(
            shared.enqueue(&envelope, true, Duration::from_secs(1)),
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn enqueue_requires_a_joined_channel() {
        let (shared, _out_rx) = connected_shared();
        shared.state.lock().channel = None;

        let envelope = RequestEnvelope::message(
            RequestId::from_raw("req_7"),
            "alpha",
            "invoke_manifest",
            json!({}),
        );
        assert!(matches!(
            shared.enqueue(&envelope, true, Duration::from_secs(1)),
            Err(BridgeError::ChannelNotJoined)
        ));
        // Join envelopes are exempt from the channel gate.
        let join = RequestEnvelope::join(RequestId::from_raw("req_8"), "alpha");
        assert!(shared.enqueue(&join, false, Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn orphan_response_is_dropped() {
        let (shared, _out_rx) = connected_shared();
        shared.handle_raw(&result_frame(&RequestId::from_raw("req_ghost"), &json!(1)).to_string());
        assert!(shared.state.lock().pending.is_empty());
    }

    #[test]
    fn connect_rejects_invalid_url() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        let cfg = TransportConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            Transport::connect(cfg),
            Err(BridgeError::InvalidArgument { name, .. }) if name == "url"
        ));
    }
}
