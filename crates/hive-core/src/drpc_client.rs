//! Unix-domain-socket dRPC client, the default [`ControlChannel`].
//!
//! Each call opens a fresh connection to the engine socket, writes one
//! framed [`Call`], reads one framed [`Response`] and closes the stream.
//! Engines restart frequently, so no connection is kept between calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tracing::{debug, trace};

use hive_proto::defaults::DEFAULT_DRPC_TIMEOUT;
use hive_proto::drpc::{Call, DrpcMethod, Response};
use hive_proto::{CtlError, CtlResult};

use crate::channel::ControlChannel;
use crate::net::{connect_unix, read_frame, write_frame};

pub struct UnixDrpcClient {
    socket_path: PathBuf,
    timeout: Duration,
    sequence: AtomicI64,
}

impl UnixDrpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_DRPC_TIMEOUT,
            sequence: AtomicI64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, call: Call) -> CtlResult<Response> {
        let mut stream = connect_unix(&self.socket_path).await?;
        write_frame(&mut stream, &call.encode_to_vec()).await?;

        let data = read_frame(&mut stream)
            .await?
            .ok_or_else(|| CtlError::Network("connection closed before response".into()))?;
        let resp = Response::decode(data.as_slice()).map_err(|e| CtlError::Decode {
            what: "dRPC response",
            reason: e.to_string(),
        })?;

        if resp.sequence != call.sequence {
            return Err(CtlError::Network(format!(
                "response sequence {} does not match call {}",
                resp.sequence, call.sequence
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ControlChannel for UnixDrpcClient {
    fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn call(&self, method: DrpcMethod, body: Vec<u8>) -> CtlResult<Response> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let call = Call::new(method, seq, body);
        trace!("dRPC {} seq={} -> {}", method, seq, self.socket_path.display());

        let resp = tokio::time::timeout(self.timeout, self.exchange(call))
            .await
            .map_err(|_| CtlError::Timeout(self.timeout))??;
        resp.check()?;

        debug!("dRPC {} seq={} ok ({} bytes)", method, seq, resp.body.len());
        Ok(resp)
    }
}
