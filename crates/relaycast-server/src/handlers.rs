//! Connection handlers for the relaycast server.
//!
//! This module handles the connection lifecycle: upgrading WebSockets,
//! registering clients with the hub, relaying inbound updates, and tearing
//! connections down when the read path ends.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relaycast_core::{Client, ClientError, ClientId, Hub, HubHandle};
use relaycast_protocol::{codec, Envelope, MessageKind};
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The relayed payload type: raw JSON, passed through byte-for-byte.
pub type Payload = Box<RawValue>;

/// Shared server state.
pub struct AppState {
    /// Handle to the relay hub.
    pub hub: HubHandle<Payload>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// Spawns the hub control loop, then serves until the process exits.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (hub, hub_handle) = Hub::with_capacity(config.hub.queue_capacity);
    tokio::spawn(hub.run());

    let state = Arc::new(AppState {
        hub: hub_handle,
        config: config.clone(),
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("relaycast server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.client_count().await,
        "evictions": state.hub.eviction_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// A connected WebSocket client as seen by the hub.
///
/// Owns the socket's send half; the read half stays with the connection
/// task. The open flag makes close idempotent and rejects sends after the
/// connection is torn down.
struct WsClient {
    id: ClientId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    open: AtomicBool,
}

impl WsClient {
    fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::generate(),
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        })
    }

    async fn pong(&self, data: Vec<u8>) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Pong(data)).await
    }

    async fn try_send(&self, message: Envelope<Payload>) -> Result<(), ClientError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let text = codec::encode(&message).map_err(|e| ClientError::SendFailed(e.to_string()))?;
        metrics::record_message(text.len(), "outbound");

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            ClientError::SendFailed(e.to_string())
        })
    }
}

#[async_trait]
impl Client<Payload> for WsClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn send(&self, message: Envelope<Payload>) -> Result<(), ClientError> {
        let result = self.try_send(message).await;
        if result.is_err() {
            // Only the hub calls send, and it evicts a client after any
            // failed send.
            metrics::record_eviction();
        }
        result
    }

    async fn close(&self) -> Result<(), ClientError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| ClientError::CloseFailed(e.to_string()))
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sender, mut receiver) = socket.split();
    let client = WsClient::new(sender);

    debug!(client = %client.id(), "WebSocket connected");

    if state.hub.register(client.clone()).await.is_err() {
        warn!(client = %client.id(), "Hub is stopped, dropping connection");
        return;
    }

    // Read loop: decode inbound frames and relay updates to the hub.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if handle_text(&text, &client, &state).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    if handle_text(text, &client, &state).await.is_err() {
                        break;
                    }
                }
                Err(_) => {
                    warn!(client = %client.id(), "Non-UTF-8 binary frame");
                    metrics::record_error("encoding");
                }
            },
            Ok(Message::Ping(data)) => {
                if client.pong(data).await.is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                // Ignore pongs
            }
            Ok(Message::Close(_)) => {
                debug!(client = %client.id(), "Received close frame");
                break;
            }
            Err(e) => {
                warn!(client = %client.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    // The hub is the authoritative point of teardown; it closes the client
    // when it removes it.
    if state.hub.unregister(client.clone()).await.is_err() {
        debug!(client = %client.id(), "Hub stopped before unregister");
    }

    debug!(client = %client.id(), "WebSocket disconnected");
}

/// Handle one inbound text frame.
///
/// Malformed frames and unexpected kinds are logged and skipped; they never
/// reach the hub. Returns an error only when the hub is stopped and the
/// connection should end.
async fn handle_text(
    text: &str,
    client: &Arc<WsClient>,
    state: &Arc<AppState>,
) -> Result<(), relaycast_core::HubError> {
    if text.len() > state.config.limits.max_message_size {
        warn!(
            client = %client.id(),
            size = text.len(),
            max = state.config.limits.max_message_size,
            "Message too large"
        );
        metrics::record_error("oversized");
        return Ok(());
    }

    let envelope: Envelope<Payload> = match codec::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(client = %client.id(), error = %e, "Malformed message");
            metrics::record_error("decode");
            return Ok(());
        }
    };

    metrics::record_message(text.len(), "inbound");

    match envelope.kind {
        MessageKind::Update => {
            state.hub.broadcast(envelope, client.clone()).await?;
            metrics::record_broadcast();
        }
        kind => {
            warn!(client = %client.id(), kind = %kind, "Unexpected message kind");
        }
    }

    Ok(())
}
