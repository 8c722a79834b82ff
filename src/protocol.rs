//! Message types for the browser-facing WebSocket protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages a browser sends over its persistent connection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Chat {
        message: String,
        #[serde(rename = "maxTokens")]
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    },
    Stop,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Messages the relay sends to a browser.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Token {
        token: String,
    },
    Done,
    Error {
        message: String,
    },
    Info {
        message: String,
        #[serde(rename = "connectionId", skip_serializing_if = "Option::is_none")]
        connection_id: Option<Uuid>,
    },
    Ping {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::Info {
            message: message.into(),
            connection_id: None,
        }
    }

    pub fn ping() -> Self {
        ServerMessage::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: every field is a string or integer.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// One step of a generation as decoded from the upstream event-stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token { text: String },
    Done,
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token { .. })
    }
}

impl From<StreamEvent> for ServerMessage {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Token { text } => ServerMessage::Token { token: text },
            StreamEvent::Done => ServerMessage::Done,
            StreamEvent::Error { message } => ServerMessage::Error { message },
        }
    }
}
