//! Engine supervision loop.

use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hive_proto::{CtlError, CtlResult, Rank};

use super::{EngineInstance, InstanceExit};
use crate::events::InstanceEvent;
use crate::runner::RunnerExit;
use crate::superblock::Superblock;

impl EngineInstance {
    /// Supervise the engine until `token` is cancelled.
    ///
    /// Each start request runs one engine lifetime: wait for formatted
    /// storage, spawn the process, service its ready notifications, and
    /// record its exit. A start request that arrives while the engine is
    /// running restarts it; further requests before the new engine is
    /// spawned are absorbed by that restart.
    pub async fn run(&self, token: CancellationToken) {
        let mut restart = false;
        loop {
            if !restart && !self.wait_start_request(&token).await {
                break;
            }
            restart = match self.run_engine(&token).await {
                Ok(restart) => restart,
                Err(CtlError::Canceled) => false,
                Err(e) => {
                    error!("instance {}: start failed: {}", self.index(), e);
                    false
                }
            };
            if token.is_cancelled() {
                break;
            }
        }
        self.clear_flags().await;
        info!("instance {} stopped", self.index());
    }

    async fn wait_start_request(&self, token: &CancellationToken) -> bool {
        let mut start_rx = self.start_rx.lock().await;
        tokio::select! {
            r = start_rx.recv() => r.is_some(),
            _ = token.cancelled() => false,
        }
    }

    /// Block until the instance has a superblock, prompting for a format
    /// if there is none.
    async fn await_storage_ready(&self, token: &CancellationToken) -> CtlResult<Superblock> {
        if let Some(sb) = self.read_superblock().await? {
            return Ok(sb);
        }

        let idx = self.index();
        info!("instance {} awaiting storage format", idx);
        self.set_awaiting_format(true).await;
        self.events.publish(InstanceEvent::AwaitFormat { index: idx });
        if let Err(e) = self
            .callbacks
            .run_await_format(idx, self.storage.scm_mount().to_path_buf())
            .await
        {
            error!("instance {}: await-format callbacks: {}", idx, e);
        }

        let notified = {
            let mut storage_rx = self.storage_ready_rx.lock().await;
            tokio::select! {
                r = storage_rx.recv() => r.is_some(),
                _ = token.cancelled() => false,
            }
        };
        self.set_awaiting_format(false).await;
        if !notified {
            return Err(CtlError::Canceled);
        }

        self.read_superblock().await?.ok_or(CtlError::NoSuperblock)
    }

    /// One engine lifetime. Returns true if a restart was requested while
    /// the engine was running.
    async fn run_engine(&self, token: &CancellationToken) -> CtlResult<bool> {
        let sb = self.await_storage_ready(token).await?;
        debug!("instance {} storage ready, uuid {}", self.index(), sb.uuid);
        self.callbacks.run_storage_ready().await?;

        let proc_token = token.child_token();
        let cfg = {
            let mut s = self.state.write().await;
            s.cancel = Some(proc_token.clone());
            self.wait_drpc.store(true, Ordering::Release);
            s.config.clone()
        };

        let mut drpc_rx = self.drpc_ready_rx.lock().await;
        while drpc_rx.try_recv().is_ok() {
            debug!("instance {}: dropping stale ready notification", self.index());
        }

        // Requests made before this lifetime began are satisfied by it.
        let mut start_rx = self.start_rx.lock().await;
        while start_rx.try_recv().is_ok() {
            debug!("instance {}: start request already satisfied", self.index());
        }

        if let Err(e) = self.remove_socket().await {
            warn!("instance {}: {}", self.index(), e);
        }

        let mut exit_rx = match self.runner.start(&cfg, proc_token.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                let mut s = self.state.write().await;
                s.cancel = None;
                self.wait_drpc.store(false, Ordering::Release);
                return Err(e);
            }
        };
        info!("instance {} engine started", self.index());

        let mut restart = false;
        let exit = loop {
            tokio::select! {
                exit = &mut exit_rx => break exit_status(exit),
                Some(ready) = drpc_rx.recv() => {
                    let res = tokio::select! {
                        r = self.handle_ready(&ready) => r,
                        _ = proc_token.cancelled() => Err(CtlError::Canceled),
                        exit = &mut exit_rx => {
                            warn!("instance {}: engine exited during bring-up", self.index());
                            break exit_status(exit);
                        }
                    };
                    match res {
                        Ok(()) => {
                            if let Err(e) = self.callbacks.run_ready().await {
                                error!("instance {}: ready callbacks: {}", self.index(), e);
                            }
                        }
                        Err(e) => error!("instance {}: ready notification: {}", self.index(), e),
                    }
                }
                Some(()) = start_rx.recv() => {
                    if restart {
                        debug!("instance {}: restart already pending", self.index());
                    } else {
                        info!("instance {}: restart requested", self.index());
                        restart = true;
                        proc_token.cancel();
                    }
                }
            }
        };

        self.handle_exit(exit).await;
        Ok(restart)
    }

    async fn handle_exit(&self, exit: RunnerExit) {
        let idx = self.index();
        let rank = self.get_rank().await.unwrap_or(Rank::NIL);
        {
            let mut s = self.state.write().await;
            s.last_err = exit.error.clone();
            s.cancel = None;
            s.last_health_stats = None;
            self.ready.store(false, Ordering::Release);
            self.wait_drpc.store(false, Ordering::Release);
        }

        match &exit.error {
            Some(e) => warn!("instance {} (rank {}) exited: {}", idx, rank, e),
            None => info!("instance {} (rank {}) exited", idx, rank),
        }
        self.events.publish(InstanceEvent::EngineDied {
            index: idx,
            rank,
            pid: exit.pid,
            error: exit.error.clone(),
        });

        let exit = InstanceExit {
            index: idx,
            rank,
            error: exit.error,
            pid: exit.pid,
        };
        if let Err(e) = self.callbacks.run_instance_exit(exit).await {
            error!("instance {}: exit callbacks: {}", idx, e);
        }
    }

    async fn clear_flags(&self) {
        let mut s = self.state.write().await;
        s.cancel = None;
        self.ready.store(false, Ordering::Release);
        self.wait_format.store(false, Ordering::Release);
        self.wait_drpc.store(false, Ordering::Release);
    }
}

fn exit_status(exit: Result<RunnerExit, oneshot::error::RecvError>) -> RunnerExit {
    exit.unwrap_or_else(|_| RunnerExit {
        pid: None,
        error: Some("runner dropped exit status".to_string()),
    })
}
