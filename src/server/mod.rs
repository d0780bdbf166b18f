//! HTTP surface: workflow runs, SSE streams, stats and health.

pub mod error;
pub mod stream;
pub mod workflows;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::Coordinator;
use crate::streaming::{ChannelTransport, StreamEvent, StreamingManager};

pub use error::ApiError;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub streams: StreamingManager,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, streams: StreamingManager) -> Self {
        Self {
            coordinator,
            streams,
        }
    }

    /// Open a session on a fresh channel transport; the receiver feeds
    /// the SSE response
    pub(crate) async fn open_channel(
        &self,
        session_id: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, ApiError> {
        let (transport, rx) = ChannelTransport::new(self.streams.config().channel_capacity);
        self.streams.open(Arc::new(transport), session_id).await?;
        Ok(rx)
    }
}

/// Server-Sent Events response draining a session's channel; the session
/// id is echoed in `x-session-id`
pub(crate) fn sse_response(
    session_id: String,
    rx: mpsc::Receiver<StreamEvent>,
) -> impl IntoResponse {
    let events = ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.event.as_str())
                .data(event.wire_data().to_string()),
        )
    });
    (
        [("x-session-id", session_id)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workflows/run", post(workflows::run_workflow))
        .route("/api/workflows/stream", post(workflows::stream_workflow))
        .route("/api/workflows/{id}/status", get(workflows::workflow_status))
        .route("/api/stream", post(stream::start_stream))
        .route("/api/stream/{id}", delete(stream::cancel_stream))
        .route("/api/stats", get(stats))
        .route("/api/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c, reaping idle sessions in the background
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid address: {}:{}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr().context("Failed to get local address")?;

    let streams = state.streams.clone();
    let reaper = streams.spawn_idle_reaper(
        streams.config().cleanup_interval(),
        streams.config().idle_timeout(),
    );

    info!(%local_addr, "conduit server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    let closed = streams.shutdown().await;
    info!(closed, "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until the process is killed
        std::future::pending::<()>().await;
    }
}

/// GET /api/stats
async fn stats(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Value> {
    let resilience = state.coordinator.resilience();
    Json(json!({
        "workflows": state.coordinator.get_stats().await,
        "resilience": resilience.stats().await,
        "breakers": resilience.breaker_snapshot().await,
        "streams": state.streams.get_stats().await,
        "activeStreams": state.streams.list_active_ids().await,
    }))
}

/// GET /api/health
async fn health_check(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": "conduit",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.coordinator.provider_names().await,
        "activeStreams": state.streams.list_active_ids().await.len(),
    }))
}
