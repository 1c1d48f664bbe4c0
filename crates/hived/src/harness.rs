//! Engine harness.
//!
//! Owns every engine instance on this host, runs their supervision loops,
//! and routes engine-originated dRPC calls to the right instance.

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::DrpcHandler;
use hive_proto::drpc::{BioErrorReq, DaosResp, DrpcMethod, NotifyReadyReq};
use hive_proto::{CtlError, CtlResult, MemberState, Rank};

use crate::instance::EngineInstance;
use crate::superblock::Superblock;

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub index: u32,
    pub state: MemberState,
    pub rank: Option<Rank>,
    pub target_count: u32,
    pub last_error: Option<String>,
}

pub struct EngineHarness {
    instances: Vec<Arc<EngineInstance>>,
    tasks: Mutex<JoinSet<()>>,
    token: CancellationToken,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
            tasks: Mutex::new(JoinSet::new()),
            token: CancellationToken::new(),
        }
    }

    /// Take ownership of a fully constructed instance and assign it the
    /// next index.
    pub async fn add_instance(&mut self, inst: EngineInstance) -> CtlResult<Arc<EngineInstance>> {
        let idx = self.instances.len() as u32;
        inst.set_index(idx).await?;
        let inst = Arc::new(inst);
        self.instances.push(inst.clone());
        Ok(inst)
    }

    pub fn instances(&self) -> &[Arc<EngineInstance>] {
        &self.instances
    }

    pub fn instance(&self, idx: u32) -> CtlResult<&Arc<EngineInstance>> {
        self.instances
            .get(idx as usize)
            .ok_or(CtlError::NoInstance(idx))
    }

    /// Spawn every instance's supervision loop and request a start.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        for inst in &self.instances {
            let runner = inst.clone();
            let token = self.token.child_token();
            tasks.spawn(async move { runner.run(token).await });
            inst.request_start();
        }
        info!("harness started {} engine instance(s)", self.instances.len());
    }

    /// Stop all engines and wait for their supervision loops to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!("engine supervision task failed: {}", e);
            }
        }
        info!("harness stopped");
    }

    /// Ranks of all instances that have completed bring-up.
    pub async fn ready_ranks(&self) -> Vec<Rank> {
        let mut ranks = Vec::new();
        for inst in &self.instances {
            if !inst.is_ready() {
                continue;
            }
            if let Ok(rank) = inst.get_rank().await {
                ranks.push(rank);
            }
        }
        ranks
    }

    /// Write a fresh superblock for instance `idx` and release its run
    /// loop if it is waiting for storage.
    pub async fn format_instance(&self, idx: u32, system: &str) -> CtlResult<Superblock> {
        let inst = self.instance(idx)?;
        let sb = inst.create_superblock(system).await?;
        info!("instance {} formatted, uuid {}", idx, sb.uuid);
        inst.notify_storage_ready();
        Ok(sb)
    }

    pub async fn status(&self) -> Vec<InstanceStatus> {
        let mut out = Vec::with_capacity(self.instances.len());
        for inst in &self.instances {
            out.push(InstanceStatus {
                index: inst.index(),
                state: inst.local_state(),
                rank: inst.get_rank().await.ok(),
                target_count: inst.get_target_count().await,
                last_error: inst.last_error().await,
            });
        }
        out
    }

    fn notify_ready(&self, body: &[u8]) -> CtlResult<Vec<u8>> {
        let req = NotifyReadyReq::decode(body).map_err(|e| CtlError::Decode {
            what: "NotifyReady",
            reason: e.to_string(),
        })?;
        debug!(
            "instance {} ready notification, uri {} incarnation {}",
            req.instance_idx, req.uri, req.incarnation
        );
        self.instance(req.instance_idx)?.notify_drpc_ready(req)?;
        Ok(DaosResp { status: 0 }.encode_to_vec())
    }

    fn bio_error(&self, body: &[u8]) -> CtlResult<Vec<u8>> {
        let req = BioErrorReq::decode(body).map_err(|e| CtlError::Decode {
            what: "BioErr",
            reason: e.to_string(),
        })?;
        warn!(
            "instance {} target {} reported blob I/O error (read={} write={} unmap={})",
            req.instance_idx, req.tgt_id, req.read_err, req.write_err, req.unmap_err
        );
        Ok(DaosResp { status: 0 }.encode_to_vec())
    }
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DrpcHandler for EngineHarness {
    async fn handle(&self, method: DrpcMethod, body: &[u8]) -> CtlResult<Vec<u8>> {
        match method {
            DrpcMethod::NotifyReady => self.notify_ready(body),
            DrpcMethod::BioErr => self.bio_error(body),
            other => Err(CtlError::UnknownMethod {
                module: other.module() as i32,
                method: other.id(),
            }),
        }
    }
}
