use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::HeaderMap,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    catalog::{ModelEntry, list_models_or_empty},
    config::ServerConfig,
    error::ServiceError,
    registry::ConnectionRegistry,
    supervisor::ProcessStatus,
    upload::{UploadResponse, preview},
    upstream::{ChatRequest, CompletionBackend, build_prompt},
    ws::ws_handler,
};

/// Explicit process context handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub backend: Arc<dyn CompletionBackend>,
    pub connections: Arc<ConnectionRegistry>,
    pub llama_status: watch::Receiver<ProcessStatus>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        backend: Arc<dyn CompletionBackend>,
        llama_status: watch::Receiver<ProcessStatus>,
    ) -> Self {
        Self {
            config,
            backend,
            connections: Arc::new(ConnectionRegistry::new()),
            llama_status,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    llama: ProcessStatus,
    websocket: WebSocketHealth,
    timestamp: DateTime<Utc>,
    config: ServerConfig,
}

#[derive(Serialize)]
struct WebSocketHealth {
    connected: usize,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub tokens_used: u64,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelEntry>,
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.config.upload_limit_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/models", get(models))
        .route("/api/upload", post(upload))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Router for the dedicated WebSocket port.
pub fn build_ws_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the API and WebSocket listeners until `state.shutdown` fires.
pub async fn serve(state: AppState) -> Result<(), ServiceError> {
    let config = state.config.clone();
    let shutdown = state.shutdown.clone();

    let api_listener = TcpListener::bind(config.listen_addr()).await?;
    let ws_listener = if config.ws_port == config.port {
        None
    } else {
        Some(TcpListener::bind(config.ws_addr()).await?)
    };

    let liveness = tokio::spawn({
        let connections = state.connections.clone();
        let shutdown = shutdown.clone();
        let interval = config.ping_interval();
        async move { connections.run_liveness(interval, shutdown).await }
    });
    tokio::spawn({
        let connections = state.connections.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            connections.shutdown_all();
        }
    });

    info!(addr = %api_listener.local_addr()?, "HTTP API ready");
    let api = axum::serve(api_listener, build_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let result = match ws_listener {
        None => api.await,
        Some(ws_listener) => {
            info!(addr = %ws_listener.local_addr()?, "WebSocket server ready");
            let ws = axum::serve(ws_listener, build_ws_router(state))
                .with_graceful_shutdown(shutdown.clone().cancelled_owned());
            tokio::try_join!(async { api.await }, async { ws.await }).map(|_| ())
        }
    };

    shutdown.cancel();
    let _ = liveness.await;
    result.map_err(ServiceError::from)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let llama = *state.llama_status.borrow();
    Json(HealthResponse {
        status: "ok",
        llama,
        websocket: WebSocketHealth {
            connected: state.connections.len(),
            port: state.config.ws_port,
        },
        timestamp: Utc::now(),
        config: state.config.as_ref().clone(),
    })
}

async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatReply>, ServiceError> {
    let Json(body) = body.map_err(|e| ServiceError::BadRequest(e.body_text()))?;
    let request = ChatRequest {
        message: body.message,
        max_tokens: body.max_tokens.unwrap_or(state.config.max_tokens),
        temperature: body.temperature.unwrap_or(state.config.temperature),
        connection_id: None,
    };
    request
        .validate()
        .map_err(|reason| ServiceError::BadRequest(reason.into()))?;
    let prompt = build_prompt(state.config.system_prompt.as_deref(), &request.message);
    let reply = state
        .backend
        .complete(request.to_completion(prompt, false))
        .await?;

    info!(origin = %request.origin(), tokens = reply.tokens_used(), "chat completion served");
    Ok(Json(ChatReply {
        tokens_used: reply.tokens_used(),
        response: reply.content,
    }))
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: list_models_or_empty(&state.config.models_dir),
    })
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, ServiceError> {
    let filename = header_value(&headers, "x-filename")
        .ok_or_else(|| ServiceError::BadRequest("missing X-Filename header".into()))?
        .to_string();
    let size = header_value(&headers, "x-file-size")
        .and_then(|v| v.parse().ok())
        .unwrap_or(body.len() as u64);
    let file_type = header_value(&headers, "x-file-type").map(str::to_string);

    info!(%filename, size, received = body.len(), "file uploaded");
    Ok(Json(UploadResponse {
        success: true,
        content: preview(
            &body,
            file_type.as_deref(),
            state.config.upload_preview_chars,
        ),
        filename,
        size,
        file_type,
    }))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
