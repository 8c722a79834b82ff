use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{
    error::ServiceError,
    protocol::StreamEvent,
    upstream::{CompletionRequest, CompletionResponse},
};

/// Ordered generation events, ending in exactly one `Done` or `Error`.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Anything that can serve `/completion` requests.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Blocking completion: the full text once generation finishes.
    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, ServiceError>;

    /// Streaming completion. The request is only sent once the returned
    /// stream is first polled, and dropping the stream abandons the read.
    /// Failures surface as a trailing `StreamEvent::Error`.
    fn stream(&self, request: CompletionRequest) -> EventStream;

    async fn health(&self) -> Result<(), ServiceError>;
}
