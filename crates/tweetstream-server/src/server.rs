use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tweetstream_core::{FilterParams, StreamSource};
use tweetstream_telemetry::MetricsRecorder;

use crate::auth::{self, CredentialResolver};
use crate::registry::SessionRegistry;
use crate::session::{ConnectionSession, SessionConfig, SessionError};
use crate::sink::{SseSink, Transport, WsSink};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub filter: FilterParams,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            filter: FilterParams::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn StreamSource>,
    pub resolver: Arc<dyn CredentialResolver>,
    pub filter: Arc<FilterParams>,
    pub session_config: SessionConfig,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<MetricsRecorder>,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream", get(sse_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/logout", post(logout_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve in the background.
pub async fn start(
    config: ServerConfig,
    source: Arc<dyn StreamSource>,
    resolver: Arc<dyn CredentialResolver>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SessionRegistry::new());
    let state = AppState {
        source,
        resolver,
        filter: Arc::new(config.filter),
        session_config: config.session,
        registry: Arc::clone(&registry),
        metrics,
        started_at: Instant::now(),
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        _server: server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    pub registry: Arc<SessionRegistry>,
    _server: tokio::task::JoinHandle<()>,
}

/// Authorize the caller and open the upstream, before committing to a
/// streaming response. Failures here become plain HTTP errors.
async fn prepare(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(ConnectionSession, tweetstream_core::UpstreamStream), SessionError> {
    let mut session =
        ConnectionSession::new(state.session_config.clone(), Arc::clone(&state.metrics));
    session.authorize(state.resolver.as_ref(), headers).await?;
    let upstream = session
        .open_upstream(state.source.as_ref(), &state.filter)
        .await?;
    Ok((session, upstream))
}

/// Server-sent events stream of content items.
async fn sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, SessionError> {
    let (session, upstream) = prepare(&state, &headers).await?;
    let registration = state
        .registry
        .register(session.id().clone(), Transport::Sse);
    let (sink, events) = SseSink::channel(state.session_config.write_timeout);

    tokio::spawn(async move {
        let _registration = registration;
        session.stream(upstream, sink).await;
    });

    Ok(Sse::new(ReceiverStream::new(events)).into_response())
}

/// WebSocket stream of content items.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, SessionError> {
    let (session, upstream) = prepare(&state, &headers).await?;
    let registration = state
        .registry
        .register(session.id().clone(), Transport::WebSocket);
    let write_timeout = state.session_config.write_timeout;

    Ok(ws.on_upgrade(move |socket| async move {
        let _registration = registration;
        session
            .stream(upstream, WsSink::new(socket, write_timeout))
            .await;
    }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "active_sessions": state.registry.count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "metrics": state.metrics.snapshot(),
        "sessions": state.registry.list(),
    }))
}

async fn logout_handler() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, auth::clear_cookie())],
        Redirect::to("/"),
    )
}
