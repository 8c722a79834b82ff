mod common;

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use common::{Stub, spawn_stub};
use llama_chat_relay::{
    ClientMessage, LlamaClient, Relay, ServerConfig, ServerMessage, StreamEvent,
    upstream::{CompletionBackend, CompletionRequest},
};

fn request() -> CompletionRequest {
    CompletionRequest {
        prompt: "User: hi\nAssistant:".into(),
        n_predict: 16,
        temperature: 0.7,
        stream: true,
    }
}

#[tokio::test]
async fn client_decodes_split_event_stream() {
    let url = spawn_stub(Stub::default()).await;
    let client = LlamaClient::new(url);

    let events: Vec<_> = client.stream(request()).collect().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Token { text: "Hel".into() },
            StreamEvent::Token { text: "lo".into() },
            StreamEvent::Token {
                text: " there".into()
            },
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn client_reports_non_success_status_as_error_event() {
    let url = spawn_stub(Stub {
        fail: true,
        ..Stub::default()
    })
    .await;
    let client = LlamaClient::new(url);

    let events: Vec<_> = client.stream(request()).collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("500")));
}

#[tokio::test]
async fn relay_streams_tokens_to_its_connection() {
    let stub = Stub::default();
    let url = spawn_stub(stub.clone()).await;
    let backend: Arc<dyn CompletionBackend> = Arc::new(LlamaClient::new(url));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut relay = Relay::new(
        Uuid::new_v4(),
        backend,
        Arc::new(ServerConfig::default()),
        tx,
    );

    relay.handle(ClientMessage::Chat {
        message: "hi".into(),
        max_tokens: Some(16),
        temperature: Some(0.1),
    });
    relay.pump().await;

    let mut received = Vec::new();
    while let Ok(message) = rx.try_recv() {
        received.push(message);
    }
    assert_eq!(
        received,
        vec![
            ServerMessage::Token { token: "Hel".into() },
            ServerMessage::Token { token: "lo".into() },
            ServerMessage::Token {
                token: " there".into()
            },
            ServerMessage::Done,
        ]
    );
    assert_eq!(stub.requests.lock()[0]["stream"], true);
}

#[tokio::test]
async fn health_check_against_stub() {
    let url = spawn_stub(Stub::default()).await;
    let backend: Arc<dyn CompletionBackend> = Arc::new(LlamaClient::new(url));
    backend.health().await.unwrap();
    assert!(LlamaClient::new("http://127.0.0.1:9").health().await.is_err());
}
