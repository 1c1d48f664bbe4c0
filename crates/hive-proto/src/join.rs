//! Cluster join request and response.
//!
//! [`SystemJoinRequest`] and [`SystemJoinResponse`] are the typed forms
//! used by the engine instance. [`JoinReq`] and [`JoinResp`] are their
//! protobuf wire forms exchanged with the membership authority.

use uuid::Uuid;

use crate::error::{CtlError, CtlResult};
use crate::fault_domain::FaultDomain;
use crate::member::MemberState;
use crate::rank::Rank;

/// Request to join (or re-join) the cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemJoinRequest {
    pub uuid: Uuid,
    /// Current rank, or [`Rank::NIL`] if none has been assigned.
    pub rank: Rank,
    pub uri: String,
    pub secondary_uris: Vec<String>,
    pub num_contexts: u32,
    pub num_secondary_contexts: Vec<u32>,
    pub fault_domain: Option<FaultDomain>,
    pub instance_idx: u32,
    /// Distinguishes successive process lifetimes of the same UUID.
    pub incarnation: u64,
    pub check_mode: bool,
}

impl SystemJoinRequest {
    pub fn to_wire(&self) -> JoinReq {
        JoinReq {
            uuid: self.uuid.to_string(),
            rank: self.rank.get(),
            uri: self.uri.clone(),
            nctxs: self.num_contexts,
            srv_fault_domain: self
                .fault_domain
                .as_ref()
                .map(|fd| fd.to_string())
                .unwrap_or_default(),
            idx: self.instance_idx,
            incarnation: self.incarnation,
            secondary_uris: self.secondary_uris.clone(),
            secondary_nctxs: self.num_secondary_contexts.clone(),
            check_mode: self.check_mode,
        }
    }

    pub fn from_wire(req: &JoinReq) -> CtlResult<Self> {
        let uuid = Uuid::parse_str(&req.uuid).map_err(|e| CtlError::Decode {
            what: "join request uuid",
            reason: e.to_string(),
        })?;
        let fault_domain = if req.srv_fault_domain.is_empty() {
            None
        } else {
            Some(req.srv_fault_domain.parse()?)
        };
        Ok(Self {
            uuid,
            rank: Rank::new(req.rank),
            uri: req.uri.clone(),
            secondary_uris: req.secondary_uris.clone(),
            num_contexts: req.nctxs,
            num_secondary_contexts: req.secondary_nctxs.clone(),
            fault_domain,
            instance_idx: req.idx,
            incarnation: req.incarnation,
            check_mode: req.check_mode,
        })
    }
}

/// Outcome of a join as decided by the membership authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemJoinResponse {
    pub rank: Rank,
    pub state: MemberState,
    pub map_version: u32,
    /// The join was applied in-process because this node also hosts the
    /// authority; no bring-up is needed.
    pub local_join: bool,
    pub pool_uuids: Vec<String>,
}

impl SystemJoinResponse {
    pub fn to_wire(&self) -> JoinResp {
        JoinResp {
            status: 0,
            rank: self.rank.get(),
            state: self.state.to_wire(),
            local_join: self.local_join,
            map_version: self.map_version,
            pool_uuids: self.pool_uuids.clone(),
        }
    }
}

impl TryFrom<JoinResp> for SystemJoinResponse {
    type Error = CtlError;

    fn try_from(resp: JoinResp) -> Result<Self, Self::Error> {
        if resp.status != 0 {
            return Err(CtlError::Status {
                op: "join",
                status: resp.status,
            });
        }
        Ok(Self {
            rank: Rank::new(resp.rank),
            state: MemberState::try_from(resp.state)?,
            map_version: resp.map_version,
            local_join: resp.local_join,
            pool_uuids: resp.pool_uuids,
        })
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinReq {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub rank: u32,
    #[prost(string, tag = "3")]
    pub uri: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub nctxs: u32,
    #[prost(string, tag = "5")]
    pub srv_fault_domain: ::prost::alloc::string::String,
    #[prost(uint32, tag = "6")]
    pub idx: u32,
    #[prost(uint64, tag = "7")]
    pub incarnation: u64,
    #[prost(string, repeated, tag = "8")]
    pub secondary_uris: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(uint32, repeated, tag = "9")]
    pub secondary_nctxs: ::prost::alloc::vec::Vec<u32>,
    #[prost(bool, tag = "10")]
    pub check_mode: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinResp {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(uint32, tag = "2")]
    pub rank: u32,
    #[prost(int32, tag = "3")]
    pub state: i32,
    #[prost(bool, tag = "4")]
    pub local_join: bool,
    #[prost(uint32, tag = "5")]
    pub map_version: u32,
    #[prost(string, repeated, tag = "6")]
    pub pool_uuids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
