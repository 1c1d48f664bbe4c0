//! Rank resolution for a freshly started engine.

use tracing::{error, info, warn};

use hive_proto::drpc::NotifyReadyReq;
use hive_proto::{CtlError, CtlResult, MemberState, Rank, ResultExt, SystemJoinRequest};

use super::EngineInstance;

/// Rank and pool map handed back by a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct JoinedRank {
    pub rank: Rank,
    pub map_version: u32,
    pub pool_uuids: Vec<String>,
    pub local_join: bool,
}

impl EngineInstance {
    /// Process a NotifyReady message from the engine: resolve the rank with
    /// the membership authority, persist it, and push it to the engine.
    pub async fn handle_ready(&self, ready: &NotifyReadyReq) -> CtlResult<()> {
        if let Err(e) = self.update_fault_domain_in_superblock().await {
            error!("instance {}: updating fault domain: {}", self.index(), e);
        }

        let joined = self.determine_rank(ready).await?;
        if joined.local_join {
            return Ok(());
        }

        self.setup_rank(joined.rank, joined.map_version, &joined.pool_uuids)
            .await
    }

    /// Bring the persisted fault domain in line with the configured one.
    async fn update_fault_domain_in_superblock(&self) -> CtlResult<()> {
        let (sb, fd) = {
            let s = self.state.read().await;
            (s.superblock.clone(), s.host_fault_domain.clone())
        };
        let mut sb = sb.ok_or(CtlError::NoSuperblock)?;
        let fd = fd.ok_or(CtlError::NoFaultDomain)?.to_string();

        if sb.host_fault_domain == fd {
            return Ok(());
        }

        info!(
            "instance {}: fault domain changed from {:?} to {:?}",
            self.index(),
            sb.host_fault_domain,
            fd
        );
        sb.host_fault_domain = fd;
        self.commit_superblock(sb).await
    }

    /// Join the cluster and record the resulting rank.
    pub(super) async fn determine_rank(&self, ready: &NotifyReadyReq) -> CtlResult<JoinedRank> {
        let (sb, fault_domain) = {
            let s = self.state.read().await;
            (s.superblock.clone(), s.host_fault_domain.clone())
        };
        let sb = sb.ok_or(CtlError::NoSuperblock)?;

        let req = SystemJoinRequest {
            uuid: sb.uuid,
            rank: sb.rank.unwrap_or(Rank::NIL),
            uri: ready.uri.clone(),
            secondary_uris: ready.secondary_uris.clone(),
            num_contexts: ready.nctxs,
            num_secondary_contexts: ready.secondary_nctxs.clone(),
            fault_domain,
            instance_idx: self.index(),
            incarnation: ready.incarnation,
            check_mode: ready.check_mode,
        };

        let resp = self.membership.join(req).await.context("join failed")?;

        match resp.state {
            MemberState::Excluded | MemberState::AdminExcluded => {
                return Err(CtlError::RankExcluded(resp.rank));
            }
            MemberState::CheckerStarted if !ready.check_mode => {
                warn!(
                    "instance {}: engine not started in checker mode but checker is running, restarting rank {}",
                    self.index(),
                    resp.rank
                );
                self.request_start_async();
                self.set_checker_mode(true).await;
                return Err(CtlError::CheckerRestart(resp.rank));
            }
            _ => {}
        }

        let joined = JoinedRank {
            rank: resp.rank,
            map_version: resp.map_version,
            pool_uuids: resp.pool_uuids,
            local_join: resp.local_join,
        };
        if joined.local_join {
            return Ok(joined);
        }

        if !sb.valid_rank || sb.uri != ready.uri {
            let mut updated = sb;
            if !updated.valid_rank {
                info!("instance {}: joined as rank {}", self.index(), joined.rank);
            } else {
                info!(
                    "instance {}: rank {} uri changed from {:?} to {:?}",
                    self.index(),
                    joined.rank,
                    updated.uri,
                    ready.uri
                );
            }
            updated.rank = Some(joined.rank);
            updated.valid_rank = true;
            updated.uri = ready.uri.clone();
            self.commit_superblock(updated).await?;
        }

        Ok(joined)
    }
}
