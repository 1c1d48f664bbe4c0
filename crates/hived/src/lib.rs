//! Hive control plane: engine supervision and cluster join.
//!
//! The `hived` binary wires these pieces to the command line; the library
//! exposes the instance and harness APIs to other control-plane services.

pub mod events;
pub mod harness;
pub mod instance;
pub mod membership;
pub mod runner;
pub mod storage;
pub mod superblock;

pub use events::{log_events, EventPublisher, InstanceEvent};
pub use harness::{EngineHarness, InstanceStatus};
pub use instance::{EngineInstance, InstanceExit};
