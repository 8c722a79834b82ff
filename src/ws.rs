//! WebSocket endpoint driving one [`Relay`] per browser connection.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{protocol::ServerMessage, relay::Relay, server::AppState};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut incoming) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (id, cancel) = state.connections.register(tx.clone());

    // Single writer keeps relay output and pings in queue order.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(err) = sink.send(Message::Text(message.to_json())).await {
                debug!(connection = %id, %err, "socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let _ = tx.send(ServerMessage::Info {
        message: "connected".to_string(),
        connection_id: Some(id),
    });
    let mut relay = Relay::new(id, state.backend.clone(), state.config.clone(), tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = state.shutdown.cancelled() => break,
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => relay.handle_text(&text),
                Some(Ok(Message::Binary(_))) => relay.reject("binary frames are not supported"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(connection = %id, %err, "socket read failed");
                    break;
                }
            },
            event = relay.next_event() => relay.forward(event),
        }
    }

    state.connections.unregister(id);
    // Dropping the relay releases the last sender, which lets the writer drain and close.
    drop(relay);
    if let Err(err) = writer.await {
        debug!(connection = %id, %err, "writer task failed");
    }
}
