//! dRPC: the local request/response protocol between the control plane and
//! its engine processes.
//!
//! Every exchange is a [`Call`] answered by a [`Response`]. The body of each
//! is itself a protobuf-encoded message selected by the (module, method)
//! pair. Field numbers below are part of the wire contract with the engine.

use std::fmt;

use crate::error::CtlError;

/// dRPC modules understood by this control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DrpcModule {
    /// Calls from the control plane into an engine.
    Mgmt = 2,
    /// Calls from an engine into the control plane.
    Srv = 3,
}

/// dRPC methods used by the engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrpcMethod {
    Ping,
    SetRank,
    SetUp,
    BioHealthQuery,
    NotifyReady,
    BioErr,
}

impl DrpcMethod {
    pub fn module(self) -> DrpcModule {
        match self {
            Self::Ping | Self::SetRank | Self::SetUp | Self::BioHealthQuery => DrpcModule::Mgmt,
            Self::NotifyReady | Self::BioErr => DrpcModule::Srv,
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Self::Ping => 202,
            Self::SetRank => 203,
            Self::BioHealthQuery => 218,
            Self::SetUp => 220,
            Self::NotifyReady => 301,
            Self::BioErr => 302,
        }
    }

    /// Resolve a method from the raw identifiers carried in a [`Call`].
    pub fn from_ids(module: i32, method: i32) -> Result<Self, CtlError> {
        let found = match (module, method) {
            (2, 202) => Self::Ping,
            (2, 203) => Self::SetRank,
            (2, 218) => Self::BioHealthQuery,
            (2, 220) => Self::SetUp,
            (3, 301) => Self::NotifyReady,
            (3, 302) => Self::BioErr,
            _ => return Err(CtlError::UnknownMethod { module, method }),
        };
        Ok(found)
    }
}

impl fmt::Display for DrpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transport-level outcome of a dRPC call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Submitted = 1,
    Failure = 2,
    UnknownModule = 3,
    UnknownMethod = 4,
    FailedUnmarshalCall = 5,
    FailedUnmarshalPayload = 6,
    FailedMarshal = 7,
}

// ─── Envelope ───────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Call {
    #[prost(int32, tag = "1")]
    pub module: i32,
    #[prost(int32, tag = "2")]
    pub method: i32,
    #[prost(int64, tag = "3")]
    pub sequence: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}

impl Call {
    pub fn new(method: DrpcMethod, sequence: i64, body: Vec<u8>) -> Self {
        Self {
            module: method.module() as i32,
            method: method.id(),
            sequence,
            body,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(int64, tag = "1")]
    pub sequence: i64,
    #[prost(enumeration = "Status", tag = "2")]
    pub status: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}

impl Response {
    pub fn success(sequence: i64, body: Vec<u8>) -> Self {
        Self {
            sequence,
            status: Status::Success as i32,
            body,
        }
    }

    pub fn failure(sequence: i64, status: Status) -> Self {
        Self {
            sequence,
            status: status as i32,
            body: Vec::new(),
        }
    }

    /// Fail unless the transport reported success.
    pub fn check(&self) -> Result<(), CtlError> {
        match Status::try_from(self.status) {
            Ok(Status::Success) => Ok(()),
            Ok(other) => Err(CtlError::DrpcFailure(format!("{:?}", other))),
            Err(_) => Err(CtlError::DrpcFailure(format!("status {}", self.status))),
        }
    }
}

// ─── Mgmt bodies ────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetRankReq {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(uint32, tag = "2")]
    pub map_version: u32,
    #[prost(string, repeated, tag = "3")]
    pub pool_uuids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Generic engine reply carrying an engine status code (0 = success).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DaosResp {
    #[prost(int32, tag = "1")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BioHealthReq {
    #[prost(string, tag = "1")]
    pub dev_uuid: ::prost::alloc::string::String,
}

/// Health snapshot of one NVMe device attached to an engine.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BioHealthResp {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub dev_uuid: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub error_count: u64,
    #[prost(uint32, tag = "4")]
    pub temperature: u32,
    #[prost(uint64, tag = "5")]
    pub media_errs: u64,
    #[prost(uint32, tag = "6")]
    pub bio_read_errs: u32,
    #[prost(uint32, tag = "7")]
    pub bio_write_errs: u32,
    #[prost(uint32, tag = "8")]
    pub bio_unmap_errs: u32,
    #[prost(uint32, tag = "9")]
    pub checksum_errs: u32,
    #[prost(bool, tag = "10")]
    pub temp_warn: bool,
    #[prost(bool, tag = "11")]
    pub avail_spare_warn: bool,
    #[prost(bool, tag = "12")]
    pub dev_reliability_warn: bool,
    #[prost(bool, tag = "13")]
    pub read_only_warn: bool,
    #[prost(uint64, tag = "14")]
    pub total_bytes: u64,
    #[prost(uint64, tag = "15")]
    pub avail_bytes: u64,
}

// ─── Srv bodies ─────────────────────────────────────────────────────────────

/// Sent by an engine once its network fabric is up.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotifyReadyReq {
    #[prost(string, tag = "1")]
    pub uri: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub nctxs: u32,
    #[prost(string, tag = "3")]
    pub drpc_listener_sock: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub instance_idx: u32,
    #[prost(uint32, tag = "5")]
    pub ntgts: u32,
    #[prost(uint64, tag = "6")]
    pub incarnation: u64,
    #[prost(string, repeated, tag = "7")]
    pub secondary_uris: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(uint32, repeated, tag = "8")]
    pub secondary_nctxs: ::prost::alloc::vec::Vec<u32>,
    #[prost(bool, tag = "9")]
    pub check_mode: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BioErrorReq {
    #[prost(bool, tag = "1")]
    pub unmap_err: bool,
    #[prost(bool, tag = "2")]
    pub read_err: bool,
    #[prost(bool, tag = "3")]
    pub write_err: bool,
    #[prost(int32, tag = "4")]
    pub tgt_id: i32,
    #[prost(uint32, tag = "5")]
    pub instance_idx: u32,
    #[prost(string, tag = "6")]
    pub drpc_listener_sock: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub uri: ::prost::alloc::string::String,
}
