//! HTTP client for the inference server's native llama.cpp API.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::{
    config::ServerConfig,
    error::ServiceError,
    protocol::StreamEvent,
    sse,
    upstream::{CompletionBackend, CompletionRequest, CompletionResponse, EventStream},
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one inference server instance.
#[derive(Debug, Clone)]
pub struct LlamaClient {
    client: reqwest::Client,
    base_url: String,
    idle_timeout: Option<Duration>,
}

impl LlamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout: None,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let idle = config.stream_idle_timeout();
        Self::new(config.llama_url()).with_idle_timeout((!idle.is_zero()).then_some(idle))
    }

    /// Limits how long a streaming read may wait for the next chunk.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completion_url(&self) -> String {
        format!("{}/completion", self.base_url)
    }

    pub async fn check_health(&self) -> Result<(), ServiceError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ServiceError::UpstreamUnavailable(self.base_url.clone())
                } else {
                    ServiceError::Upstream(e)
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::UpstreamStatus {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ServiceError> {
        let response = self
            .client
            .post(self.completion_url())
            .json(request)
            .send()
            .await
            .map_err(|e| ServiceError::from_upstream(e, &self.base_url))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::UpstreamStatus { status, body });
        }

        Ok(response.json().await?)
    }

    pub fn stream_completion(&self, request: CompletionRequest) -> EventStream {
        let client = self.client.clone();
        let url = self.completion_url();
        let base_url = self.base_url.clone();
        let idle_timeout = self.idle_timeout;

        let events = async_stream::stream! {
            let send = client.post(&url).json(&request).send();
            let sent = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, send).await {
                    Ok(sent) => sent,
                    Err(_) => {
                        yield StreamEvent::Error {
                            message: format!("inference server did not respond within {}s", limit.as_secs()),
                        };
                        return;
                    }
                },
                None => send.await,
            };

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    let err = ServiceError::from_upstream(err, &base_url);
                    tracing::warn!(%err, "streaming completion request failed");
                    yield StreamEvent::Error { message: err.to_string() };
                    return;
                }
            };

            if !response.status().is_success() {
                let err = ServiceError::UpstreamStatus {
                    status: response.status().as_u16(),
                    body: response.text().await.unwrap_or_default(),
                };
                tracing::warn!(%err, "streaming completion rejected");
                yield StreamEvent::Error { message: err.to_string() };
                return;
            }

            let mut decoded = Box::pin(sse::decode_stream(response.bytes_stream(), idle_timeout));
            while let Some(event) = decoded.next().await {
                yield event;
            }
        };
        events.boxed()
    }
}

#[async_trait]
impl CompletionBackend for LlamaClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ServiceError> {
        LlamaClient::complete(self, &request).await
    }

    fn stream(&self, request: CompletionRequest) -> EventStream {
        self.stream_completion(request)
    }

    async fn health(&self) -> Result<(), ServiceError> {
        self.check_health().await
    }
}
