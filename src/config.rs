use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Name of the per-user data directory under `$HOME`.
pub const DATA_DIR_NAME: &str = ".llama-chat";
pub const PID_FILE_NAME: &str = "llama-chat.pid";

/// Process-wide configuration, resolved once at startup.
///
/// Layers apply in increasing precedence: built-in defaults, the persisted
/// config file, then command-line flags (each flag may also come from its
/// environment variable).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub ws_port: u16,
    pub llama_host: IpAddr,
    pub llama_port: u16,
    pub llama_binary: PathBuf,
    pub spawn_llama: bool,
    pub model_path: Option<PathBuf>,
    pub models_dir: PathBuf,
    pub ctx_size: u32,
    pub gpu_layers: u32,
    pub parallel: u32,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    pub ping_interval_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub max_restarts: u32,
    pub upload_limit_bytes: usize,
    pub upload_preview_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
            ws_port: 3001,
            llama_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            llama_port: 8080,
            llama_binary: PathBuf::from(if cfg!(target_os = "windows") {
                "llama-server.exe"
            } else {
                "llama-server"
            }),
            spawn_llama: true,
            model_path: None,
            models_dir: data_dir.join("models"),
            ctx_size: 4096,
            gpu_layers: 0,
            parallel: 4,
            log_file: Some(data_dir.join("logs").join("llama-chat.log")),
            verbose: false,
            max_tokens: 512,
            temperature: 0.7,
            system_prompt: None,
            ping_interval_secs: 30,
            stream_idle_timeout_secs: 120,
            startup_timeout_secs: 60,
            max_restarts: 5,
            upload_limit_bytes: 10 * 1024 * 1024,
            upload_preview_chars: 2000,
        }
    }
}

impl ServerConfig {
    /// Loads defaults overlaid with the config file at `path`, if it exists.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ServiceError::Config(format!("invalid config file {}: {e}", path.display()))
        })
    }

    /// Persists this configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ServiceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        fs::write(path, body)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ws_port)
    }

    /// Base URL of the inference server's HTTP interface.
    pub fn llama_url(&self) -> String {
        format!("http://{}", SocketAddr::new(self.llama_host, self.llama_port))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// `~/.llama-chat`, or a relative `.llama-chat` when no home directory is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Pid file of the instance started with `config_path`, kept beside it.
pub fn pid_file_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from(PID_FILE_NAME), |dir| dir.join(PID_FILE_NAME))
}
