#![forbid(unsafe_code)]

// Signaling server - WebSocket accept path and operational endpoints

pub mod connection;
pub mod protocol;

use crate::auth::token::{Expect, TokenCodec};
use crate::media::MediaEngine;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use crate::session::SessionRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state shared across connections.
#[derive(Clone)]
pub struct SignalingServer {
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    engine: Arc<MediaEngine>,
    tokens: Arc<TokenCodec>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(engine: Arc<MediaEngine>, tokens: Arc<TokenCodec>, metrics: ServerMetrics) -> Self {
        let max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(10_000);
        info!("max concurrent connections: {}", max_connections);

        Self {
            sessions: Arc::new(SessionRegistry::new()),
            rooms: Arc::new(RoomRegistry::new(engine.clone(), metrics.clone())),
            engine,
            tokens,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves until the listener fails.
    ///
    /// # Errors
    /// Returns an error if the port cannot be bound.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.rooms.room_count(),
        "sessions": server.sessions.session_count(),
    }))
}

async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let body = server
        .metrics
        .render_prometheus(server.rooms.room_count(), server.sessions.session_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade with the token gate. A missing or invalid token still
/// upgrades, then closes 1008 carrying the failure kind; nothing else is sent
/// on that socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(server): State<SignalingServer>,
) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("connection limit reached, rejecting upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
        }
    };

    let auth = match params.get("token") {
        None => Err("no_token".to_string()),
        Some(token) => server
            .tokens
            .verify(token, Expect::default(), true)
            .map_err(|e| e.to_string()),
    };

    let SignalingServer {
        sessions,
        rooms,
        engine,
        metrics,
        ..
    } = server;

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| warn!("websocket upgrade failed: {}", error))
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, sessions, rooms, engine, metrics, auth, permit)
        })
}
