use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use shared::protocol::{COMMAND_PATH, COMMAND_VOLUME, INFO_PATH, PING_PATH};
use shared::types::{CommandAck, CommandEnvelope, CommandRecord, Identity, PingResponse};
use crate::command_log::CommandLog;

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<Identity>,
    pub log: CommandLog,
}

/// Every path and method outside the three routes below answers 404.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(INFO_PATH, get(get_info).fallback(not_found))
        .route(PING_PATH, get(get_ping).fallback(not_found))
        .route(COMMAND_PATH, post(post_command).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

async fn get_info(State(state): State<AppState>) -> Json<Identity> {
    Json(state.identity.as_ref().clone())
}

async fn get_ping() -> Json<PingResponse> {
    Json(PingResponse { ok: true })
}

async fn post_command(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<CommandAck>, (StatusCode, String)> {
    tracing::debug!("POST {} from {}", COMMAND_PATH, peer);

    if body.is_empty() {
        tracing::warn!("Command from {} had no body", peer);
        return Err((StatusCode::BAD_REQUEST, "no post data".to_string()));
    }

    let envelope: CommandEnvelope = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!("Unparseable command from {}: {}", peer, e);
        (StatusCode::BAD_REQUEST, format!("bad request: {}", e))
    })?;

    if envelope.command_type != COMMAND_VOLUME {
        tracing::warn!("Unknown command type: {}", envelope.command_type);
        return Err((StatusCode::BAD_REQUEST, "bad request".to_string()));
    }

    let count = state.log.record(CommandRecord {
        command_type: envelope.command_type,
        delta: envelope.delta,
        from_ip: peer.ip().to_string(),
        timestamp: Local::now().format("%H:%M:%S").to_string(),
    });
    tracing::info!("Volume command ({:+}) from {}; total commands: {}", envelope.delta, peer.ip(), count);

    Ok(Json(CommandAck::ok()))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
