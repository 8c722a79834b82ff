//! Command-line surface: subcommands and configuration flags.

use std::{
    fs,
    io::{BufRead, BufReader},
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};

use crate::config::{ServerConfig, default_config_path, pid_file_path};

/// Local chat relay for a llama.cpp inference server
#[derive(Debug, Parser)]
#[command(name = "llama-chat")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.llama-chat/config.json)
    #[arg(long, global = true, env = "LLAMA_CHAT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the relay and the inference server in the foreground
    Start,
    /// Stop a running instance
    Stop,
    /// Stop a running instance, then start in the foreground
    Restart,
    /// Show the health of a running instance
    Status,
    /// Print the tail of the log file
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Print the resolved configuration
    Config {
        /// Persist the resolved configuration to the config file
        #[arg(long)]
        save: bool,
    },
    /// Delete the log file
    CleanLogs,
}

/// Flags that override the config file. Each also reads an environment variable.
#[derive(Debug, Default, Args)]
pub struct ConfigOverrides {
    /// Address the HTTP API and WebSocket listeners bind to
    #[arg(long, global = true, env = "LLAMA_CHAT_HOST")]
    pub host: Option<IpAddr>,
    /// HTTP API port
    #[arg(long, global = true, env = "LLAMA_CHAT_PORT")]
    pub port: Option<u16>,
    /// WebSocket port
    #[arg(long, global = true, env = "LLAMA_CHAT_WS_PORT")]
    pub ws_port: Option<u16>,
    /// Port of the inference server
    #[arg(long, global = true, env = "LLAMA_PORT")]
    pub llama_port: Option<u16>,
    /// Model file to load
    #[arg(long, global = true, env = "LLAMA_MODEL")]
    pub model: Option<PathBuf>,
    /// Directory scanned for model files
    #[arg(long, global = true, env = "LLAMA_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,
    /// Context size in tokens
    #[arg(long, global = true, env = "LLAMA_CTX_SIZE")]
    pub ctx_size: Option<u32>,
    /// Layers offloaded to the GPU
    #[arg(long, global = true, env = "LLAMA_GPU_LAYERS")]
    pub gpu_layers: Option<u32>,
    /// Parallel sequences served by the inference server
    #[arg(long, global = true, env = "LLAMA_PARALLEL")]
    pub parallel: Option<u32>,
    /// Log file path
    #[arg(long, global = true, env = "LLAMA_CHAT_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    /// Path to the llama-server binary
    #[arg(long, global = true, env = "LLAMA_SERVER_BIN")]
    pub llama_binary: Option<PathBuf>,
    /// Attach to an already running inference server instead of spawning one
    #[arg(long, global = true)]
    pub no_spawn: bool,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.ws_port {
            config.ws_port = port;
        }
        if let Some(port) = self.llama_port {
            config.llama_port = port;
        }
        if let Some(model) = &self.model {
            config.model_path = Some(model.clone());
        }
        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        if let Some(ctx) = self.ctx_size {
            config.ctx_size = ctx;
        }
        if let Some(layers) = self.gpu_layers {
            config.gpu_layers = layers;
        }
        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
        if let Some(binary) = &self.llama_binary {
            config.llama_binary = binary.clone();
        }
        if self.no_spawn {
            config.spawn_llama = false;
        }
        if self.verbose {
            config.verbose = true;
        }
    }
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    pub fn pid_path(&self) -> PathBuf {
        pid_file_path(&self.config_path())
    }

    /// Defaults, then the config file, then flags.
    pub fn resolve_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::load(&self.config_path())?;
        self.overrides.apply(&mut config);
        Ok(config)
    }
}

pub fn show_config(config: &ServerConfig, save_to: Option<&Path>) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if let Some(path) = save_to {
        config.save(path)?;
        println!();
        println!("Saved to {}", path.display());
    }
    Ok(())
}

pub fn show_logs(config: &ServerConfig, lines: usize) -> anyhow::Result<()> {
    let Some(path) = config.log_file.as_deref() else {
        println!("File logging is disabled.");
        return Ok(());
    };
    if !path.exists() {
        println!("No log file at {}", path.display());
        return Ok(());
    }
    for line in tail(path, lines)? {
        println!("{line}");
    }
    Ok(())
}

fn tail(path: &Path, count: usize) -> anyhow::Result<Vec<String>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut window = std::collections::VecDeque::with_capacity(count);
    for line in BufReader::new(file).lines() {
        if window.len() == count {
            window.pop_front();
        }
        if count > 0 {
            window.push_back(line?);
        }
    }
    Ok(window.into_iter().collect())
}

pub fn clean_logs(config: &ServerConfig) -> anyhow::Result<()> {
    match config.log_file.as_deref() {
        Some(path) if path.exists() => {
            fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
            println!("Removed {}", path.display());
        }
        _ => println!("No log file to remove."),
    }
    Ok(())
}

pub async fn show_status(config: &ServerConfig, pid_path: &Path) -> anyhow::Result<()> {
    let url = format!("http://{}/api/health", config.listen_addr());
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            let health: serde_json::Value = response.json().await?;
            println!("Relay:       running at http://{}", config.listen_addr());
            println!("Inference:   {}", health["llama"].as_str().unwrap_or("unknown"));
            println!(
                "WebSocket:   port {}, {} connected",
                health["websocket"]["port"],
                health["websocket"]["connected"]
            );
        }
        Ok(response) => println!("Relay answered with {}", response.status()),
        Err(_) => {
            println!("Relay:       not running");
            if let Some(pid) = read_pid(pid_path)? {
                println!("Stale pid file for process {pid} at {}", pid_path.display());
            }
        }
    }
    Ok(())
}

/// Records this process's pid for `stop`; removes the file when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, std::process::id().to_string())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> anyhow::Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse().ok())
}

/// Sends SIGTERM to the recorded instance and waits for it to exit.
/// Returns `false` when nothing was running.
pub async fn stop_running(pid_path: &Path) -> anyhow::Result<bool> {
    let Some(pid) = read_pid(pid_path)? else {
        println!("No running instance.");
        return Ok(false);
    };

    terminate_pid(pid, pid_path).await
}

#[cfg(unix)]
async fn terminate_pid(pid: u32, pid_path: &Path) -> anyhow::Result<bool> {
    let pid = pid as libc::pid_t;
    // SAFETY: signalling a pid has no memory-safety implications.
    let alive = |pid| unsafe { libc::kill(pid, 0) } == 0;

    if !alive(pid) {
        println!("Process {pid} is not running; removing stale pid file.");
        let _ = fs::remove_file(pid_path);
        return Ok(false);
    }
    // SAFETY: as above.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    for _ in 0..100 {
        if !alive(pid) {
            println!("Stopped process {pid}.");
            let _ = fs::remove_file(pid_path);
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("process {pid} did not exit within 10s")
}

#[cfg(not(unix))]
async fn terminate_pid(pid: u32, _pid_path: &Path) -> anyhow::Result<bool> {
    bail!("stopping process {pid} is only supported on unix")
}
