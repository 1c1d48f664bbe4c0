//! Bring-up calls pushed to the engine over its control channel.

use prost::Message;
use tracing::{debug, info};

use hive_proto::drpc::{BioHealthReq, BioHealthResp, DaosResp, DrpcMethod, SetRankReq};
use hive_proto::{CtlError, CtlResult, Rank};

use super::EngineInstance;
use crate::events::InstanceEvent;

/// Failures reported by the engine (a non-zero status or a malformed
/// reply) name the failing call; transport errors pass through as they are.
fn status_context(err: CtlError, context: &'static str) -> CtlError {
    match err {
        CtlError::Status { .. } | CtlError::Decode { .. } => err.context(context),
        other => other,
    }
}

impl EngineInstance {
    /// Issue a dRPC call to the running engine and return the reply body.
    ///
    /// The call is abandoned if the engine process is stopped meanwhile.
    pub(super) async fn call_drpc(
        &self,
        method: DrpcMethod,
        body: Vec<u8>,
    ) -> CtlResult<Vec<u8>> {
        let (socket, token) = {
            let s = self.state.read().await;
            (s.config.drpc_socket_path(), s.cancel.clone())
        };
        let channel = (self.drpc_client_fn)(socket.as_path());

        debug!("instance {}: dRPC {}", self.index(), method);
        let resp = match token {
            Some(token) => tokio::select! {
                r = channel.call(method, body) => r?,
                _ = token.cancelled() => return Err(CtlError::Canceled),
            },
            None => channel.call(method, body).await?,
        };
        Ok(resp.body)
    }

    async fn call_engine_status(
        &self,
        method: DrpcMethod,
        op: &'static str,
        body: Vec<u8>,
    ) -> CtlResult<()> {
        let reply = self.call_drpc(method, body).await?;
        let resp = DaosResp::decode(reply.as_slice()).map_err(|e| CtlError::Decode {
            what: "engine response",
            reason: e.to_string(),
        })?;
        if resp.status != 0 {
            return Err(CtlError::Status {
                op,
                status: resp.status,
            });
        }
        Ok(())
    }

    /// Tell the engine its rank and the current pool map.
    pub(super) async fn call_set_rank(
        &self,
        rank: Rank,
        map_version: u32,
        pool_uuids: &[String],
    ) -> CtlResult<()> {
        let req = SetRankReq {
            rank: rank.get(),
            map_version,
            pool_uuids: pool_uuids.to_vec(),
        };
        self.call_engine_status(DrpcMethod::SetRank, "SetRank", req.encode_to_vec())
            .await
    }

    /// Tell the engine to finish bring-up.
    pub(super) async fn call_set_up(&self) -> CtlResult<()> {
        self.call_engine_status(DrpcMethod::SetUp, "SetUp", Vec::new())
            .await
    }

    /// Push `rank` to the engine and mark the instance ready.
    ///
    /// Does nothing if the instance is already ready.
    pub async fn setup_rank(
        &self,
        rank: Rank,
        map_version: u32,
        pool_uuids: &[String],
    ) -> CtlResult<()> {
        if self.is_ready() {
            return Ok(());
        }

        self.call_set_rank(rank, map_version, pool_uuids)
            .await
            .map_err(|e| status_context(e, "SetRank failed"))?;
        self.call_set_up()
            .await
            .map_err(|e| status_context(e, "SetUp failed"))?;

        self.set_ready(true).await;
        self.set_awaiting_drpc(false).await;

        let uri = self
            .superblock()
            .await
            .map(|sb| sb.uri)
            .unwrap_or_default();
        info!("instance {} ready as rank {}", self.index(), rank);
        self.events.publish(InstanceEvent::RankReady {
            index: self.index(),
            rank,
            uri,
        });
        Ok(())
    }

    /// Query the engine for a device's health and cache the answer.
    pub async fn bio_health_query(&self, dev_uuid: &str) -> CtlResult<BioHealthResp> {
        let req = BioHealthReq {
            dev_uuid: dev_uuid.to_string(),
        };
        let reply = self
            .call_drpc(DrpcMethod::BioHealthQuery, req.encode_to_vec())
            .await?;
        let resp = BioHealthResp::decode(reply.as_slice())?;
        if resp.status != 0 {
            return Err(CtlError::Status {
                op: "BioHealthQuery",
                status: resp.status,
            });
        }
        self.set_last_health_stats(dev_uuid, resp.clone()).await;
        Ok(resp)
    }
}
