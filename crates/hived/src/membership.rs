//! Membership client: the engine instance's view of the cluster
//! membership authority.
//!
//! Only the request/response contract matters to the instance. The TCP
//! client below sends one framed [`JoinReq`] per join and reads one framed
//! [`JoinResp`]; a timeout is reported like any other transport failure.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::net::TcpStream;
use tracing::debug;

use hive_core::net::{read_frame, write_frame};
use hive_proto::defaults::DEFAULT_JOIN_TIMEOUT;
use hive_proto::join::JoinResp;
use hive_proto::{CtlError, CtlResult, SystemJoinRequest, SystemJoinResponse};

/// Sends join requests to the membership authority.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    async fn join(&self, req: SystemJoinRequest) -> CtlResult<SystemJoinResponse>;
}

pub struct TcpMembershipClient {
    authority: SocketAddr,
    timeout: Duration,
}

impl TcpMembershipClient {
    pub fn new(authority: SocketAddr) -> Self {
        Self {
            authority,
            timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, req: &SystemJoinRequest) -> CtlResult<SystemJoinResponse> {
        let mut stream = TcpStream::connect(self.authority)
            .await
            .map_err(|e| CtlError::Network(format!("connect {}: {}", self.authority, e)))?;
        stream.set_nodelay(true).ok();

        write_frame(&mut stream, &req.to_wire().encode_to_vec()).await?;
        let data = read_frame(&mut stream)
            .await?
            .ok_or_else(|| CtlError::Network("authority closed connection".into()))?;
        let resp = JoinResp::decode(data.as_slice()).map_err(|e| CtlError::Decode {
            what: "join response",
            reason: e.to_string(),
        })?;
        SystemJoinResponse::try_from(resp)
    }
}

#[async_trait]
impl MembershipClient for TcpMembershipClient {
    async fn join(&self, req: SystemJoinRequest) -> CtlResult<SystemJoinResponse> {
        debug!(
            "join request to {}: uuid={} rank={} uri={} idx={} incarnation={}",
            self.authority, req.uuid, req.rank, req.uri, req.instance_idx, req.incarnation
        );
        tokio::time::timeout(self.timeout, self.exchange(&req))
            .await
            .map_err(|_| CtlError::Timeout(self.timeout))?
    }
}
