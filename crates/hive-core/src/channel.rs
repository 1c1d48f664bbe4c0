//! Control channel abstraction: decouples engine instances from the dRPC
//! transport.
//!
//! The engine instance only ever issues single request/response exchanges
//! through this trait, which keeps it testable with in-memory fakes.

use std::path::Path;

use async_trait::async_trait;
use hive_proto::drpc::{DrpcMethod, Response};
use hive_proto::CtlResult;

/// A request/response transport to a single engine process.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Local address of the engine's dRPC socket.
    fn socket_path(&self) -> &Path;

    /// Send one call and await its response.
    ///
    /// Transport failures and timeouts are returned as errors; a response
    /// with a non-success transport status is also an error. The body of a
    /// successful response is returned undecoded.
    async fn call(&self, method: DrpcMethod, body: Vec<u8>) -> CtlResult<Response>;
}
