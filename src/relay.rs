//! Per-connection streaming relay.
//!
//! A [`Relay`] owns at most one in-flight generation. It is driven by the
//! connection task: client frames go to [`Relay::handle_text`], and while a
//! generation is active the task awaits [`Relay::next_event`] and hands the
//! result to [`Relay::forward`]. Because both happen on one task, a `stop`
//! that has been handled can never be followed by a token of the stopped
//! generation.

use std::{sync::Arc, time::Instant};

use futures_util::StreamExt;
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    protocol::{ClientMessage, ServerMessage, StreamEvent},
    registry::Outbound,
    upstream::{ChatRequest, CompletionBackend, EventStream, build_prompt},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Streaming,
}

struct Generation {
    events: EventStream,
    tokens: usize,
    started: Instant,
}

pub struct Relay {
    connection_id: Uuid,
    backend: Arc<dyn CompletionBackend>,
    config: Arc<ServerConfig>,
    outbound: Outbound,
    generation: Option<Generation>,
}

impl Relay {
    pub fn new(
        connection_id: Uuid,
        backend: Arc<dyn CompletionBackend>,
        config: Arc<ServerConfig>,
        outbound: Outbound,
    ) -> Self {
        Self {
            connection_id,
            backend,
            config,
            outbound,
            generation: None,
        }
    }

    pub fn state(&self) -> RelayState {
        if self.generation.is_some() {
            RelayState::Streaming
        } else {
            RelayState::Idle
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == RelayState::Streaming
    }

    /// Handles one raw text frame from the browser.
    pub fn handle_text(&mut self, raw: &str) {
        match ClientMessage::parse(raw) {
            Ok(message) => self.handle(message),
            Err(err) => {
                tracing::debug!(connection = %self.connection_id, %err, "invalid client message");
                self.send(ServerMessage::error(format!("invalid message: {err}")));
            }
        }
    }

    /// Answers a frame the relay cannot interpret.
    pub fn reject(&self, reason: &str) {
        self.send(ServerMessage::error(reason));
    }

    pub fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Chat {
                message,
                max_tokens,
                temperature,
            } => self.start_chat(message, max_tokens, temperature),
            ClientMessage::Stop => self.stop(),
        }
    }

    fn start_chat(&mut self, message: String, max_tokens: Option<u32>, temperature: Option<f32>) {
        if self.is_streaming() {
            tracing::debug!(connection = %self.connection_id, "chat rejected, generation in flight");
            self.send(ServerMessage::error("generation already in progress"));
            return;
        }
        let request = ChatRequest {
            message,
            max_tokens: max_tokens.unwrap_or(self.config.max_tokens),
            temperature: temperature.unwrap_or(self.config.temperature),
            connection_id: Some(self.connection_id),
        };
        if let Err(reason) = request.validate() {
            self.send(ServerMessage::error(reason));
            return;
        }
        let prompt = build_prompt(self.config.system_prompt.as_deref(), &request.message);
        tracing::info!(
            origin = %request.origin(),
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            "starting generation"
        );

        self.generation = Some(Generation {
            events: self.backend.stream(request.to_completion(prompt, true)),
            tokens: 0,
            started: Instant::now(),
        });
    }

    /// Abandons the active generation. The upstream server may keep
    /// generating; its output is no longer read.
    fn stop(&mut self) {
        let Some(generation) = self.generation.take() else {
            return;
        };
        tracing::info!(
            connection = %self.connection_id,
            tokens = generation.tokens,
            elapsed_ms = generation.started.elapsed().as_millis() as u64,
            "generation stopped by client"
        );
        drop(generation);
        self.send(ServerMessage::info("stopped"));
    }

    /// Waits for the next upstream event. Never resolves while idle.
    pub async fn next_event(&mut self) -> StreamEvent {
        match self.generation.as_mut() {
            Some(generation) => generation
                .events
                .next()
                .await
                .unwrap_or(StreamEvent::Done),
            None => std::future::pending().await,
        }
    }

    /// Re-emits an upstream event to the browser, returning to idle on a
    /// terminal event.
    pub fn forward(&mut self, event: StreamEvent) {
        let Some(generation) = self.generation.as_mut() else {
            return;
        };
        if matches!(event, StreamEvent::Token { .. }) {
            generation.tokens += 1;
        }
        let terminal = event.is_terminal();

        if terminal {
            if let Some(generation) = self.generation.take() {
                let elapsed_ms = generation.started.elapsed().as_millis() as u64;
                match &event {
                    StreamEvent::Error { message } => tracing::warn!(
                        connection = %self.connection_id,
                        tokens = generation.tokens,
                        elapsed_ms,
                        %message,
                        "generation failed"
                    ),
                    _ => tracing::info!(
                        connection = %self.connection_id,
                        tokens = generation.tokens,
                        elapsed_ms,
                        "generation finished"
                    ),
                }
            }
        }

        if !self.send(event.into()) {
            self.generation = None;
        }
    }

    /// Forwards events until the active generation ends.
    pub async fn pump(&mut self) {
        while self.is_streaming() {
            let event = self.next_event().await;
            self.forward(event);
        }
    }

    fn send(&self, message: ServerMessage) -> bool {
        if self.outbound.send(message).is_err() {
            tracing::debug!(connection = %self.connection_id, "outbound queue closed");
            return false;
        }
        true
    }
}
