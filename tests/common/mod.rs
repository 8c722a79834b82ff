//! Stub inference server shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use llama_chat_relay::{AppState, LlamaClient, ServerConfig, Supervisor};

/// Event-stream body, deliberately cut mid-line and with one malformed payload.
pub const SSE_CHUNKS: &[&str] = &[
    "data: {\"content\":\"Hel\"}\n\ndata: {\"con",
    "tent\":\"lo\"}\n\ndata: {broken\n\n",
    "data: {\"content\":\" there\"}\n\n",
    "data: [DONE]\n\n",
];

#[derive(Clone, Default)]
pub struct Stub {
    pub requests: Arc<Mutex<Vec<Value>>>,
    pub fail: bool,
    /// Stream the first chunk, then hold the response open.
    pub stall: bool,
}

async fn completion(State(stub): State<Stub>, Json(body): Json<Value>) -> Response {
    stub.requests.lock().push(body.clone());
    if stub.fail {
        return (StatusCode::INTERNAL_SERVER_ERROR, "model crashed").into_response();
    }
    if body["stream"] == json!(true) && stub.stall {
        let chunks = futures_util::stream::iter([Ok::<_, std::io::Error>(SSE_CHUNKS[0])])
            .chain(futures_util::stream::pending());
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap();
    }
    if body["stream"] == json!(true) {
        let chunks = futures_util::stream::iter(
            SSE_CHUNKS
                .iter()
                .map(|chunk| Ok::<_, std::io::Error>(*chunk)),
        );
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap();
    }
    Json(json!({"content": "hello", "tokens_used": 3})).into_response()
}

/// Serves the stub on an ephemeral port and returns its base URL.
pub async fn spawn_stub(stub: Stub) -> String {
    let app = Router::new()
        .route("/completion", post(completion))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .with_state(stub);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Serves the relay's own router on an ephemeral port.
pub async fn spawn_app(state: AppState) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = llama_chat_relay::build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn state_for(base_url: &str, config: ServerConfig) -> AppState {
    AppState::new(
        Arc::new(config),
        Arc::new(LlamaClient::new(base_url)),
        Supervisor::external(),
    )
}
