//! Foreground run: supervise the inference server and serve browsers.

use std::sync::Arc;

use tracing::info;

use crate::{
    catalog::resolve_model,
    config::ServerConfig,
    error::ServiceError,
    server::{self, AppState},
    supervisor::{LaunchSpec, Supervisor},
    upstream::LlamaClient,
};

pub async fn run(config: ServerConfig) -> Result<(), ServiceError> {
    let config = Arc::new(config);
    let client = LlamaClient::from_config(&config);

    let supervisor = if config.spawn_llama {
        let model = resolve_model(config.model_path.as_deref(), &config.models_dir).ok_or_else(
            || {
                ServiceError::ProcessLaunch(format!(
                    "no model configured and no .gguf file in {}",
                    config.models_dir.display()
                ))
            },
        )?;
        let supervisor =
            Supervisor::launch(LaunchSpec::llama(&config, &model), config.max_restarts)?;
        if let Err(err) = supervisor
            .wait_ready(&client, config.startup_timeout())
            .await
        {
            supervisor.shutdown().await;
            return Err(err);
        }
        Some(supervisor)
    } else {
        info!(url = client.base_url(), "using external inference server");
        None
    };

    let status = supervisor
        .as_ref()
        .map(Supervisor::subscribe)
        .unwrap_or_else(Supervisor::external);
    let state = AppState::new(config, Arc::new(client), status);

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    let result = server::serve(state).await;
    if let Some(supervisor) = supervisor {
        supervisor.shutdown().await;
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
