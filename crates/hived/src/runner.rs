//! Engine process runner.
//!
//! The runner owns the mechanics of spawning and tearing down one engine
//! process. The engine instance decides *when* to start; the runner
//! reports *whether* the process is running and delivers a single
//! [`RunnerExit`] when it terminates.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_proto::defaults::{
    DEFAULT_ENGINE_BIN, DEFAULT_HUGEPAGE_SIZE_MB, DEFAULT_SOCKET_DIR, DEFAULT_TARGET_COUNT,
};
use hive_proto::{CtlError, CtlResult};

/// Per-engine process configuration.
///
/// The control plane reads and writes these fields but does not interpret
/// them beyond building the engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Position of the instance within the harness.
    pub index: u32,
    pub target_count: u32,
    /// Engine memory size in megabytes (0 = engine default).
    pub mem_size_mb: u32,
    pub hugepage_size_mb: u32,
    /// Start the engine with the checker module set loaded.
    pub checker_enabled: bool,
    pub binary: PathBuf,
    pub scm_mount: PathBuf,
    pub socket_dir: PathBuf,
    pub fabric_provider: String,
    pub env: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index: 0,
            target_count: DEFAULT_TARGET_COUNT,
            mem_size_mb: 0,
            hugepage_size_mb: DEFAULT_HUGEPAGE_SIZE_MB,
            checker_enabled: false,
            binary: PathBuf::from(DEFAULT_ENGINE_BIN),
            scm_mount: PathBuf::new(),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            fabric_provider: "ofi+tcp".to_string(),
            env: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Path of the engine's own dRPC listener socket.
    pub fn drpc_socket_path(&self) -> PathBuf {
        self.socket_dir
            .join(format!("hive_engine_{}.sock", self.index))
    }

    /// Command-line arguments passed to the engine binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-I".to_string(),
            self.index.to_string(),
            "-t".to_string(),
            self.target_count.to_string(),
            "-s".to_string(),
            self.scm_mount.display().to_string(),
            "-d".to_string(),
            self.socket_dir.display().to_string(),
            "-H".to_string(),
            self.hugepage_size_mb.to_string(),
        ];
        if self.mem_size_mb > 0 {
            args.push("-r".to_string());
            args.push(self.mem_size_mb.to_string());
        }
        if self.checker_enabled {
            args.push("--checker".to_string());
        }
        args
    }
}

/// How an engine process terminated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunnerExit {
    pub pid: Option<u32>,
    /// `None` when the process exited cleanly.
    pub error: Option<String>,
}

/// Opaque process-spawning capability.
#[async_trait]
pub trait EngineRunner: Send + Sync {
    fn is_running(&self) -> bool;

    /// Spawn the engine. The process is killed when `token` is cancelled.
    /// The returned receiver resolves once, when the process has exited.
    async fn start(
        &self,
        cfg: &EngineConfig,
        token: CancellationToken,
    ) -> CtlResult<oneshot::Receiver<RunnerExit>>;
}

/// Runs the engine as a child process.
#[derive(Default)]
pub struct ProcessRunner {
    running: Arc<AtomicBool>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineRunner for ProcessRunner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn start(
        &self,
        cfg: &EngineConfig,
        token: CancellationToken,
    ) -> CtlResult<oneshot::Receiver<RunnerExit>> {
        if self.is_running() {
            return Err(CtlError::Runner(format!(
                "engine {} already running",
                cfg.index
            )));
        }

        let mut cmd = Command::new(&cfg.binary);
        cmd.args(cfg.args())
            .envs(cfg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("FI_PROVIDER", &cfg.fabric_provider)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CtlError::Runner(format!("spawn {}: {}", cfg.binary.display(), e))
        })?;
        let pid = child.id();
        self.running.store(true, Ordering::Release);
        info!("engine {} started (pid={:?})", cfg.index, pid);

        let (tx, rx) = oneshot::channel();
        let running = self.running.clone();
        let index = cfg.index;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    debug!("engine {} cancelled, killing pid {:?}", index, pid);
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill engine {}: {}", index, e);
                    }
                    child.wait().await
                }
            };
            running.store(false, Ordering::Release);

            let error = match status {
                Ok(s) if s.success() => None,
                Ok(s) => Some(format!("engine exited: {}", s)),
                Err(e) => Some(format!("wait for engine: {}", e)),
            };
            info!("engine {} exited (pid={:?}, error={:?})", index, pid, error);
            let _ = tx.send(RunnerExit { pid, error });
        });

        Ok(rx)
    }
}
