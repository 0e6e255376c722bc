//! HTTP surface: health, metrics, monitor diagnostics and the observer WebSocket.

use crate::broadcaster::Broadcaster;
use crate::metrics::MetricsRegistry;
use crate::registry::MonitorRegistry;
use crate::types::{MachineId, ObserverMessage};
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Greeting sent to every observer on connect
pub const CONNECTION_GREETING: &str = "Connected to status updates";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MonitorRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Option<Arc<MetricsRegistry>>,
    pub observer_buffer: usize,
}

/// HTTP server
pub struct HttpServer {
    state: AppState,
    listen_addr: String,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(state: AppState, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    /// Build the router
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/monitors", get(monitors_handler))
            .route("/monitors/:id", get(monitor_handler))
            .route("/ws/status", get(ws_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        let app = Self::router(self.state);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Handler for /health
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "monitors": state.registry.len(),
    }))
}

/// Handler for /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(registry) = state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    match registry.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /monitors
async fn monitors_handler(State(state): State<AppState>) -> Response {
    Json(state.registry.all_statuses()).into_response()
}

/// Handler for /monitors/:id
async fn monitor_handler(State(state): State<AppState>, Path(id): Path<MachineId>) -> Response {
    match state.registry.status(id) {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("machine {} is not monitored", id) })),
        )
            .into_response(),
    }
}

/// Handler for /ws/status
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observer_session(socket, state))
}

/// Serve one observer until either side goes away.
///
/// Client messages are read only to notice a close.
async fn observer_session(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let greeting = ObserverMessage::Connection {
        message: CONNECTION_GREETING.to_string(),
    };
    match serde_json::to_string(&greeting) {
        Ok(text) => {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize greeting"),
    }

    let (observer_id, mut events) = state.broadcaster.subscribe(state.observer_buffer);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(text) => {
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        debug!(observer_id, error = %e, "Observer send failed");
                        break;
                    }
                }
                // Pruned by the broadcaster
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(observer_id, error = %e, "Observer socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.broadcaster.disconnect(observer_id);
}
