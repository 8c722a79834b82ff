use std::{fs, path::Path, sync::Mutex};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llama_chat_relay::{
    app,
    cli::{self, Cli, Command, PidFile},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    let pid_path = cli.pid_path();

    match cli.command {
        Command::Start => {
            init_tracing(config.verbose, config.log_file.as_deref())?;
            let _pid = PidFile::create(&pid_path)?;
            app::run(config).await?;
        }
        Command::Restart => {
            init_tracing(config.verbose, config.log_file.as_deref())?;
            cli::stop_running(&pid_path).await?;
            let _pid = PidFile::create(&pid_path)?;
            app::run(config).await?;
        }
        Command::Stop => {
            cli::stop_running(&pid_path).await?;
        }
        Command::Status => cli::show_status(&config, &pid_path).await?,
        Command::Logs { lines } => cli::show_logs(&config, lines)?,
        Command::Config { save } => {
            let path = cli.config_path();
            cli::show_config(&config, save.then_some(path.as_path()))?;
        }
        Command::CleanLogs => cli::clean_logs(&config)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let default_filter = if verbose {
        "debug,hyper=info,reqwest=info"
    } else {
        "info,hyper=warn,axum::rejection=trace"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();
    Ok(())
}
