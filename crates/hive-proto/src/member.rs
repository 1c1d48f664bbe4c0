//! Member states reported by the membership authority and derived locally
//! by engine instances.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CtlError;

/// State of a rank from the perspective of either the local control plane
/// or the cluster membership authority.
///
/// The discriminants are single bits so that callers can build state
/// masks; the wire representation is the raw `i32` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MemberState {
    Unknown = 0x0000,
    AwaitFormat = 0x0001,
    Starting = 0x0002,
    Ready = 0x0004,
    Joined = 0x0008,
    Stopping = 0x0010,
    Stopped = 0x0020,
    Excluded = 0x0040,
    Errored = 0x0080,
    Unresponsive = 0x0100,
    AdminExcluded = 0x0200,
    CheckerStarted = 0x0400,
}

impl MemberState {
    /// Raw wire value.
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    /// Whether the authority has removed this rank from the membership.
    pub fn is_excluded(self) -> bool {
        matches!(self, Self::Excluded | Self::AdminExcluded)
    }
}

impl TryFrom<i32> for MemberState {
    type Error = CtlError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::Unknown),
            0x0001 => Ok(Self::AwaitFormat),
            0x0002 => Ok(Self::Starting),
            0x0004 => Ok(Self::Ready),
            0x0008 => Ok(Self::Joined),
            0x0010 => Ok(Self::Stopping),
            0x0020 => Ok(Self::Stopped),
            0x0040 => Ok(Self::Excluded),
            0x0080 => Ok(Self::Errored),
            0x0100 => Ok(Self::Unresponsive),
            0x0200 => Ok(Self::AdminExcluded),
            0x0400 => Ok(Self::CheckerStarted),
            other => Err(CtlError::UnknownMemberState(other)),
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::AwaitFormat => "AwaitFormat",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Joined => "Joined",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Excluded => "Excluded",
            Self::Errored => "Errored",
            Self::Unresponsive => "Unresponsive",
            Self::AdminExcluded => "AdminExcluded",
            Self::CheckerStarted => "CheckerStarted",
        };
        f.write_str(name)
    }
}
