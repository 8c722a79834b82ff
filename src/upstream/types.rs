use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /completion` on the inference server.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub n_predict: u32,
    pub temperature: f32,
    pub stream: bool,
}

/// Non-streaming `/completion` reply.
///
/// llama.cpp reports the generated token count as `tokens_predicted`; some
/// compatible servers use `tokens_used`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    tokens_used: Option<u64>,
    #[serde(default)]
    tokens_predicted: Option<u64>,
}

impl CompletionResponse {
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.or(self.tokens_predicted).unwrap_or(0)
    }
}

/// One `data:` payload of a streaming `/completion` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stop: bool,
}

/// A single chat turn as submitted by a browser, before prompt rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Owning persistent connection; `None` for plain HTTP requests.
    pub connection_id: Option<Uuid>,
}

impl ChatRequest {
    /// Rejects turns that must not reach the inference server.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.message.trim().is_empty() {
            return Err("message must not be empty");
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err("temperature must be a non-negative number");
        }
        Ok(())
    }

    /// Log label for where the turn came from: the connection id, or `http`.
    pub fn origin(&self) -> String {
        self.connection_id
            .map_or_else(|| "http".to_string(), |id| id.to_string())
    }

    pub fn to_completion(&self, prompt: String, stream: bool) -> CompletionRequest {
        CompletionRequest {
            prompt,
            n_predict: self.max_tokens,
            temperature: self.temperature,
            stream,
        }
    }
}
