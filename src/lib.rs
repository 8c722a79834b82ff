pub mod app;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod sse;
pub mod supervisor;
pub mod upload;
pub mod upstream;
pub mod ws;

pub use config::ServerConfig;
pub use error::ServiceError;
pub use protocol::{ClientMessage, ServerMessage, StreamEvent};
pub use registry::ConnectionRegistry;
pub use relay::{Relay, RelayState};
pub use server::{AppState, build_router};
pub use supervisor::{LaunchSpec, ProcessStatus, Supervisor};
pub use upstream::{CompletionBackend, LlamaClient};
