//! Engine instance: control-plane state for one supervised engine process.
//!
//! An [`EngineInstance`] tracks a single engine from "not yet formatted"
//! through "joined and ready". It owns the engine's persistent identity
//! (the superblock), the liveness flags from which [`MemberState`] is
//! derived, a per-device health cache, and the lifecycle callbacks.
//!
//! Concurrency: the mutable fields live in one `RwLock<InstanceState>`.
//! The lock is held only to read or write those fields; membership joins,
//! dRPC calls and superblock I/O always run with the lock released, and
//! their results are written back under a fresh acquisition. The liveness
//! flags are atomics so that status queries never wait on the lock, but
//! they are only ever changed while the write lock is held.

mod callbacks;
mod drpc;
mod exec;
mod join;
#[cfg(test)]
mod tests;

pub use callbacks::{
    await_format_fn, instance_exit_fn, ready_fn, storage_ready_fn, BoxFuture, InstanceExit,
    OnAwaitFormatFn, OnInstanceExitFn, OnReadyFn, OnStorageReadyFn,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::net::remove_stale_socket;
use hive_core::{ControlChannel, UnixDrpcClient};
use hive_proto::drpc::{BioHealthResp, NotifyReadyReq};
use hive_proto::{CtlError, CtlResult, FaultDomain, MemberState, Rank};

use crate::events::EventPublisher;
use crate::membership::MembershipClient;
use crate::runner::{EngineConfig, EngineRunner};
use crate::storage::StorageProvider;
use crate::superblock::Superblock;

use self::callbacks::Callbacks;

/// Builds the control channel used to reach an engine's dRPC socket.
pub type DrpcClientFn = Arc<dyn Fn(&Path) -> Arc<dyn ControlChannel> + Send + Sync>;

const DRPC_READY_QUEUE: usize = 8;

/// Mutable instance fields, guarded by [`EngineInstance::state`].
struct InstanceState {
    config: EngineConfig,
    host_fault_domain: Option<FaultDomain>,
    superblock: Option<Superblock>,
    /// Cancels the currently running engine process, if any.
    cancel: Option<CancellationToken>,
    /// Populated when the engine process exits with an error.
    last_err: Option<String>,
    /// Lazily created on first write; dropped when the engine exits.
    last_health_stats: Option<HashMap<String, BioHealthResp>>,
}

pub struct EngineInstance {
    index: OnceLock<u32>,
    runner: Arc<dyn EngineRunner>,
    storage: StorageProvider,
    membership: Arc<dyn MembershipClient>,
    events: EventPublisher,
    drpc_client_fn: DrpcClientFn,
    callbacks: Callbacks,

    wait_format: AtomicBool,
    wait_drpc: AtomicBool,
    ready: AtomicBool,

    start_tx: mpsc::Sender<()>,
    start_rx: Mutex<mpsc::Receiver<()>>,
    storage_ready_tx: mpsc::Sender<()>,
    storage_ready_rx: Mutex<mpsc::Receiver<()>>,
    drpc_ready_tx: mpsc::Sender<NotifyReadyReq>,
    drpc_ready_rx: Mutex<mpsc::Receiver<NotifyReadyReq>>,

    state: RwLock<InstanceState>,
}

impl EngineInstance {
    pub fn new(
        config: EngineConfig,
        storage: StorageProvider,
        membership: Arc<dyn MembershipClient>,
        runner: Arc<dyn EngineRunner>,
        events: EventPublisher,
    ) -> Self {
        let (start_tx, start_rx) = mpsc::channel(1);
        let (storage_ready_tx, storage_ready_rx) = mpsc::channel(1);
        let (drpc_ready_tx, drpc_ready_rx) = mpsc::channel(DRPC_READY_QUEUE);

        Self {
            index: OnceLock::new(),
            runner,
            storage,
            membership,
            events,
            drpc_client_fn: Arc::new(|path: &Path| -> Arc<dyn ControlChannel> {
                Arc::new(UnixDrpcClient::new(path))
            }),
            callbacks: Callbacks::default(),
            wait_format: AtomicBool::new(false),
            wait_drpc: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            start_tx,
            start_rx: Mutex::new(start_rx),
            storage_ready_tx,
            storage_ready_rx: Mutex::new(storage_ready_rx),
            drpc_ready_tx,
            drpc_ready_rx: Mutex::new(drpc_ready_rx),
            state: RwLock::new(InstanceState {
                config,
                host_fault_domain: None,
                superblock: None,
                cancel: None,
                last_err: None,
                last_health_stats: None,
            }),
        }
    }

    /// Replace the factory used to build control channels.
    pub fn with_drpc_client_fn(mut self, f: DrpcClientFn) -> Self {
        self.drpc_client_fn = f;
        self
    }

    /// Set the fault domain of the host this instance runs on.
    pub fn with_host_fault_domain(mut self, fd: FaultDomain) -> Self {
        self.state.get_mut().host_fault_domain = Some(fd);
        self
    }

    // ─── Callback registration ──────────────────────────────────────────

    /// Add callbacks to invoke when the instance requires formatting.
    pub fn on_await_format(&mut self, fns: impl IntoIterator<Item = OnAwaitFormatFn>) {
        self.callbacks.add_await_format(fns);
    }

    /// Add callbacks to invoke when the instance storage becomes ready.
    pub fn on_storage_ready(&mut self, fns: impl IntoIterator<Item = OnStorageReadyFn>) {
        self.callbacks.add_storage_ready(fns);
    }

    /// Add callbacks to invoke when the instance becomes ready.
    pub fn on_ready(&mut self, fns: impl IntoIterator<Item = OnReadyFn>) {
        self.callbacks.add_ready(fns);
    }

    /// Add callbacks to invoke when the engine process terminates.
    pub fn on_instance_exit(&mut self, fns: impl IntoIterator<Item = OnInstanceExitFn>) {
        self.callbacks.add_instance_exit(fns);
    }

    // ─── Liveness ───────────────────────────────────────────────────────

    fn is_awaiting_format(&self) -> bool {
        self.wait_format.load(Ordering::Acquire)
    }

    /// Whether the engine process is running.
    pub fn is_started(&self) -> bool {
        self.runner.is_running()
    }

    /// Whether bring-up has completed and the engine is still running.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.is_started()
    }

    /// Local view of the instance state, ignoring what the membership
    /// authority believes.
    ///
    /// Checked in fixed priority order: a started process supersedes an
    /// earlier await-format flag.
    pub fn local_state(&self) -> MemberState {
        if self.is_ready() {
            MemberState::Ready
        } else if self.is_started() {
            MemberState::Starting
        } else if self.is_awaiting_format() {
            MemberState::AwaitFormat
        } else {
            MemberState::Stopped
        }
    }

    async fn set_ready(&self, ready: bool) {
        let _guard = self.state.write().await;
        self.ready.store(ready, Ordering::Release);
    }

    async fn set_awaiting_format(&self, waiting: bool) {
        let _guard = self.state.write().await;
        self.wait_format.store(waiting, Ordering::Release);
    }

    async fn set_awaiting_drpc(&self, waiting: bool) {
        let _guard = self.state.write().await;
        self.wait_drpc.store(waiting, Ordering::Release);
    }

    // ─── Index and engine configuration ─────────────────────────────────

    /// Position of this instance within the harness.
    pub fn index(&self) -> u32 {
        self.index.get().copied().unwrap_or_default()
    }

    /// Assign the harness index. May only be called once.
    pub(crate) async fn set_index(&self, idx: u32) -> CtlResult<()> {
        let mut s = self.state.write().await;
        self.index
            .set(idx)
            .map_err(|_| CtlError::Runner(format!("instance index already set to {}", self.index())))?;
        s.config.index = idx;
        Ok(())
    }

    /// Enable or disable starting the engine in checker mode.
    pub async fn set_checker_mode(&self, enabled: bool) {
        let mut s = self.state.write().await;
        s.config.checker_enabled = enabled;
    }

    pub async fn set_mem_size(&self, mem_size_mb: u32) {
        let mut s = self.state.write().await;
        s.config.mem_size_mb = mem_size_mb;
    }

    pub async fn set_hugepage_size(&self, hugepage_size_mb: u32) {
        let mut s = self.state.write().await;
        s.config.hugepage_size_mb = hugepage_size_mb;
    }

    pub async fn set_target_count(&self, target_count: u32) {
        let mut s = self.state.write().await;
        s.config.target_count = target_count;
    }

    pub async fn get_target_count(&self) -> u32 {
        self.state.read().await.config.target_count
    }

    /// Snapshot of the engine configuration.
    pub async fn config(&self) -> EngineConfig {
        self.state.read().await.config.clone()
    }

    pub async fn host_fault_domain(&self) -> Option<FaultDomain> {
        self.state.read().await.host_fault_domain.clone()
    }

    /// Update the host fault domain after a topology change. The superblock
    /// picks it up on the next ready notification.
    pub async fn set_host_fault_domain(&self, fd: FaultDomain) {
        let mut s = self.state.write().await;
        s.host_fault_domain = Some(fd);
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_err.clone()
    }

    // ─── Identity ───────────────────────────────────────────────────────

    pub async fn superblock(&self) -> Option<Superblock> {
        self.state.read().await.superblock.clone()
    }

    pub fn storage(&self) -> &StorageProvider {
        &self.storage
    }

    /// Load the superblock from storage into memory.
    pub async fn read_superblock(&self) -> CtlResult<Option<Superblock>> {
        let sb = self.storage.read_superblock().await?;
        let mut s = self.state.write().await;
        s.superblock = sb.clone();
        Ok(sb)
    }

    /// Persist `sb` and, once it is durable, make it the in-memory copy.
    /// On failure the previous in-memory superblock is kept.
    async fn commit_superblock(&self, sb: Superblock) -> CtlResult<()> {
        self.storage.write_superblock(&sb).await?;
        let mut s = self.state.write().await;
        s.superblock = Some(sb);
        Ok(())
    }

    /// Write a fresh superblock for a newly formatted engine.
    pub async fn create_superblock(&self, system: &str) -> CtlResult<Superblock> {
        if let Some(existing) = self.storage.read_superblock().await? {
            return Err(CtlError::Superblock(format!(
                "instance {} already formatted as {}",
                self.index(),
                existing.uuid
            )));
        }

        let mut sb = Superblock::new(system);
        if let Some(fd) = self.host_fault_domain().await {
            sb.host_fault_domain = fd.to_string();
        }
        info!(
            "instance {} creating superblock {} at {}",
            self.index(),
            sb.uuid,
            self.storage.superblock_path().display()
        );
        self.commit_superblock(sb.clone()).await?;
        Ok(sb)
    }

    /// Rank assigned to this instance by a successful join.
    pub async fn get_rank(&self) -> CtlResult<Rank> {
        let s = self.state.read().await;
        let sb = s.superblock.as_ref().ok_or(CtlError::NoSuperblock)?;
        match sb.rank {
            Some(rank) if sb.valid_rank => Ok(rank),
            _ => Err(CtlError::NoRank),
        }
    }

    // ─── Health cache ───────────────────────────────────────────────────

    pub async fn get_last_health_stats(&self, dev_addr: &str) -> Option<BioHealthResp> {
        let s = self.state.read().await;
        s.last_health_stats
            .as_ref()
            .and_then(|m| m.get(dev_addr).cloned())
    }

    pub async fn set_last_health_stats(&self, dev_addr: &str, health: BioHealthResp) {
        let mut s = self.state.write().await;
        s.last_health_stats
            .get_or_insert_with(HashMap::new)
            .insert(dev_addr.to_string(), health);
    }

    // ─── Signals into the run loop ──────────────────────────────────────

    /// Ask the run loop to start (or restart) the engine. Does not wait;
    /// a request already pending absorbs this one.
    pub fn request_start(&self) {
        match self.start_tx.try_send(()) {
            Ok(()) => debug!("instance {} start requested", self.index()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("instance {} start already pending", self.index())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("instance {} start requested after shutdown", self.index())
            }
        }
    }

    /// Fire-and-forget start request that waits for room in the start queue
    /// on its own task.
    fn request_start_async(&self) {
        let tx = self.start_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(()).await;
        });
    }

    /// Signal that the instance's storage has been formatted.
    pub fn notify_storage_ready(&self) {
        let _ = self.storage_ready_tx.try_send(());
    }

    /// Hand a NotifyReady message from the engine to the run loop.
    pub fn notify_drpc_ready(&self, req: NotifyReadyReq) -> CtlResult<()> {
        self.drpc_ready_tx.try_send(req).map_err(|e| {
            CtlError::Runner(format!(
                "instance {} cannot accept ready notification: {}",
                self.index(),
                e
            ))
        })
    }

    #[cfg(test)]
    pub(crate) async fn take_ready_notification(&self) -> Option<NotifyReadyReq> {
        self.drpc_ready_rx.lock().await.try_recv().ok()
    }

    /// Stop the running engine process, if any.
    pub async fn stop(&self) {
        let s = self.state.read().await;
        if let Some(token) = &s.cancel {
            info!("instance {} stopping engine", self.index());
            token.cancel();
        }
    }

    /// Remove the engine's dRPC socket file and clear the ready state.
    pub async fn remove_socket(&self) -> CtlResult<()> {
        let path = self.state.read().await.config.drpc_socket_path();
        remove_stale_socket(&path).map_err(|e| {
            warn!(
                "removing instance {} socket file {}: {}",
                self.index(),
                path.display(),
                e
            );
            e
        })?;
        self.set_ready(false).await;
        Ok(())
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("index", &self.index())
            .field("state", &self.local_state())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}
