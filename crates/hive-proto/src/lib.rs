//! # hive-proto
//!
//! Protocol types, constants, and wire messages for the hive control
//! plane.
//!
//! This crate defines the rank and member-state vocabulary, fault-domain
//! paths, the dRPC envelope and message bodies exchanged with engine
//! processes, the cluster join request/response, and the unified error
//! type shared by all hive components.

pub mod defaults;
pub mod drpc;
pub mod error;
pub mod fault_domain;
pub mod join;
pub mod member;
pub mod rank;

// Re-export commonly used types at the crate root
pub use error::{CtlError, CtlResult, ResultExt};
pub use fault_domain::FaultDomain;
pub use join::{SystemJoinRequest, SystemJoinResponse};
pub use member::MemberState;
pub use rank::Rank;
