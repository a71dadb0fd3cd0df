use axum::extract::{Path as AxumPath, Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::media::MediaDecoder;
use crate::pool::DbPool;
use crate::queries;

pub struct AppState {
    pub pool: Arc<DbPool>,
    pub media: Arc<MediaDecoder>,
}

/// Starts the async web server: builds a `Router`, binds per the
/// `online` flag, serves. Extends the bare `/api/health`/`/api/info`
/// pair with the query-layer routes.
pub async fn start_server_async(state: Arc<AppState>, online: bool, port: u16) -> CoreResult<()> {
    let app: Router<()> = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/info", get(get_info))
        .route("/api/contacts", get(get_contacts))
        .route("/api/chatrooms", get(get_chatrooms))
        .route("/api/sessions", get(get_sessions))
        .route("/api/messages", get(get_messages))
        .route("/api/media/:kind/:hash", get(get_media))
        .with_state(state);

    let addr = if online {
        SocketAddr::from(([0, 0, 0, 0], port))
    } else {
        SocketAddr::from(([127, 0, 0, 1], port))
    };

    info!("starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(CoreError::Io)?;
    axum::serve(listener, app).await.map_err(CoreError::Io)?;
    Ok(())
}

/// Blocking entry point: builds its own multi-thread runtime and calls
/// `block_on`, for callers (the CLI) that don't have a runtime already.
pub fn start_server(state: Arc<AppState>, online: bool, port: u16) -> CoreResult<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CoreError::Io)?;
    runtime.block_on(start_server_async(state, online, port))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn get_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "data_dir": state.pool.data_dir().to_string_lossy(),
        "message_shard_count": state.pool.group_count(crate::model::GroupName::MessageShards),
    }))
}

async fn get_contacts(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, CoreError> {
    let pool = Arc::clone(&state.pool);
    let contacts = tokio::task::spawn_blocking(move || queries::contacts(&pool))
        .await
        .map_err(|e| CoreError::Other(e.to_string()))??;
    Ok(Json(contacts))
}

async fn get_chatrooms(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, CoreError> {
    let pool = Arc::clone(&state.pool);
    let rooms = tokio::task::spawn_blocking(move || queries::chatrooms(&pool))
        .await
        .map_err(|e| CoreError::Other(e.to_string()))??;
    Ok(Json(rooms))
}

async fn get_sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, CoreError> {
    let pool = Arc::clone(&state.pool);
    let sessions = tokio::task::spawn_blocking(move || queries::sessions(&pool))
        .await
        .map_err(|e| CoreError::Other(e.to_string()))??;
    Ok(Json(sessions))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, CoreError> {
    let pool = Arc::clone(&state.pool);
    let talker = params.get("talker").cloned().unwrap_or_default();
    let limit: usize = params.get("limit").and_then(|s| s.parse().ok()).unwrap_or(50);
    let offset: usize = params.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0);

    let messages = tokio::task::spawn_blocking(move || queries::messages_for_talker(&pool, &talker, limit, offset))
        .await
        .map_err(|e| CoreError::Other(e.to_string()))??;
    Ok(Json(messages))
}

async fn get_media(
    State(state): State<Arc<AppState>>,
    AxumPath((_kind, hash)): AxumPath<(String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    let pool = Arc::clone(&state.pool);
    let media = Arc::clone(&state.media);

    let (bytes, tag) = tokio::task::spawn_blocking(move || -> CoreResult<(Vec<u8>, &'static str)> {
        let path = queries::media_path_by_hash(&pool, &hash)?.ok_or(CoreError::UnknownMediaFormat)?;
        let blob = std::fs::read(path)?;
        media.decode(&blob)
    })
    .await
    .map_err(|e| CoreError::Other(e.to_string()))??;

    Ok(([(axum::http::header::CONTENT_TYPE, format!("application/octet-stream; format={}", tag))], bytes))
}
