//! Lifecycle management for the `llama-server` child process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::ServerConfig, error::ServiceError, upstream::CompletionBackend};

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// A child that stayed up this long resets the consecutive-restart budget.
const STABLE_UPTIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed,
    /// The inference server is managed outside this process.
    External,
}

/// Program and arguments for the inference process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    /// Arguments for llama.cpp's `llama-server`.
    pub fn llama(config: &ServerConfig, model: &Path) -> Self {
        let args = vec![
            "--model".to_string(),
            model.display().to_string(),
            "--host".to_string(),
            config.llama_host.to_string(),
            "--port".to_string(),
            config.llama_port.to_string(),
            "--ctx-size".to_string(),
            config.ctx_size.to_string(),
            "--n-gpu-layers".to_string(),
            config.gpu_layers.to_string(),
            "--parallel".to_string(),
            config.parallel.to_string(),
            "--cont-batching".to_string(),
        ];
        Self::new(&config.llama_binary, args)
    }

    fn spawn(&self) -> Result<Child, ServiceError> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::ProcessLaunch(format!("{}: {e}", self.binary.display())))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }
        debug!(pid = child.id(), binary = %self.binary.display(), "inference process spawned");
        Ok(child)
    }
}

/// Logs the child's output line by line. Bytes that are not valid UTF-8 are
/// replaced rather than ending the read, since dropping the pipe would kill
/// the child on its next write.
async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end();
                if !line.is_empty() {
                    info!(source = "llama", stream, "{line}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(stream, %err, "stopped reading inference process output");
                break;
            }
        }
    }
}

/// Owns the running inference process.
///
/// The child is spawned with `kill_on_drop`, so it cannot outlive the
/// supervisor on any exit path. [`Supervisor::shutdown`] is the graceful
/// path: SIGTERM first, kill after a grace period.
pub struct Supervisor {
    status: watch::Receiver<ProcessStatus>,
    shutdown: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawns the process and starts monitoring it. A spawn failure here is
    /// returned to the caller; failures after a crash are handled by restarts.
    pub fn launch(spec: LaunchSpec, max_restarts: u32) -> Result<Self, ServiceError> {
        info!(binary = %spec.binary.display(), args = ?spec.args, "launching inference process");
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Starting);
        let child = spec.spawn()?;
        status_tx.send_replace(ProcessStatus::Running);

        let shutdown = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            spec,
            child,
            max_restarts,
            status_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            status: status_rx,
            shutdown,
            monitor: Some(monitor),
        })
    }

    /// Status channel for a server that is not managed by this process.
    pub fn external() -> watch::Receiver<ProcessStatus> {
        watch::channel(ProcessStatus::External).1
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Polls the inference server's health endpoint until it answers.
    pub async fn wait_ready(
        &self,
        backend: &dyn CompletionBackend,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        let start = Instant::now();
        info!("waiting for inference server to become ready");
        while start.elapsed() < timeout {
            if self.status() == ProcessStatus::Failed {
                return Err(ServiceError::ProcessLaunch(
                    "inference process exited during startup".into(),
                ));
            }
            match backend.health().await {
                Ok(()) => {
                    info!(elapsed_ms = start.elapsed().as_millis() as u64, "inference server is ready");
                    return Ok(());
                }
                Err(err) => {
                    debug!(%err, "inference server not ready yet");
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
            }
        }
        Err(ServiceError::StartupTimeout)
    }

    /// Terminates the process and waits for the monitor to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor.take() {
            if let Err(err) = monitor.await {
                warn!(%err, "supervisor task ended abnormally");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn monitor(
    spec: LaunchSpec,
    mut child: Child,
    max_restarts: u32,
    status: watch::Sender<ProcessStatus>,
    shutdown: CancellationToken,
) {
    let mut restarts = 0u32;
    let mut started = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                terminate(&mut child).await;
                status.send_replace(ProcessStatus::Stopped);
                return;
            }
            exit = child.wait() => {
                match exit {
                    Ok(code) => error!(%code, "inference process exited unexpectedly"),
                    Err(err) => error!(%err, "lost track of inference process"),
                }
                if started.elapsed() >= STABLE_UPTIME {
                    restarts = 0;
                }
                if restarts >= max_restarts {
                    error!(restarts, "giving up on inference process");
                    status.send_replace(ProcessStatus::Failed);
                    return;
                }

                let delay = backoff(restarts);
                restarts += 1;
                status.send_replace(ProcessStatus::Restarting);
                warn!(attempt = restarts, delay_ms = delay.as_millis() as u64, "restarting inference process");

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        status.send_replace(ProcessStatus::Stopped);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match spec.spawn() {
                    Ok(next) => {
                        child = next;
                        started = Instant::now();
                        status.send_replace(ProcessStatus::Running);
                    }
                    Err(err) => {
                        error!(%err, "failed to restart inference process");
                        status.send_replace(ProcessStatus::Failed);
                        return;
                    }
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    RESTART_BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(RESTART_BACKOFF_MAX)
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            info!(pid, "stopping inference process");
            // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(code)) => {
                    debug!(%code, "inference process exited");
                    return;
                }
                Ok(Err(err)) => warn!(%err, "error waiting for inference process"),
                Err(_) => warn!("inference process ignored SIGTERM, killing"),
            }
        }
    }
    if let Err(err) = child.kill().await {
        debug!(%err, "kill failed, process already gone");
    }
}
