mod backend;
mod client;
mod prompt;
mod types;

pub use backend::{CompletionBackend, EventStream};
pub use client::LlamaClient;
pub use prompt::build_prompt;
pub use types::{ChatRequest, CompletionChunk, CompletionRequest, CompletionResponse};
