//! # hive-core
//!
//! Local transport for the hive control plane: the [`ControlChannel`]
//! abstraction over dRPC, its Unix-domain-socket client, the listener that
//! receives engine-originated calls, and length-prefixed framing helpers.

pub mod channel;
pub mod drpc_client;
pub mod drpc_server;
pub mod net;

pub use channel::ControlChannel;
pub use drpc_client::UnixDrpcClient;
pub use drpc_server::{DrpcHandler, DrpcServer};
