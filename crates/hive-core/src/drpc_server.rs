//! dRPC listener for engine-originated calls.
//!
//! Engines connect to the control plane's socket to report readiness
//! (`NotifyReady`) and device errors (`BioErr`). Each accepted connection
//! is served on its own task; calls on one connection are handled in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hive_proto::drpc::{Call, DrpcMethod, Response, Status};
use hive_proto::{CtlError, CtlResult};

use crate::net::{bind_unix, read_frame, remove_stale_socket, write_frame};

/// Handles one decoded call and produces the encoded response body.
#[async_trait]
pub trait DrpcHandler: Send + Sync + 'static {
    async fn handle(&self, method: DrpcMethod, body: &[u8]) -> CtlResult<Vec<u8>>;
}

pub struct DrpcServer {
    socket_path: PathBuf,
    handler: Arc<dyn DrpcHandler>,
}

impl DrpcServer {
    pub fn new(socket_path: impl Into<PathBuf>, handler: Arc<dyn DrpcHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `token` is cancelled, then remove the socket.
    pub async fn run(&self, token: CancellationToken) -> CtlResult<()> {
        let listener = bind_unix(&self.socket_path)?;
        info!("dRPC listener on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = self.handler.clone();
                            let conn_token = token.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = serve_conn(stream, handler, conn_token).await {
                                    warn!("dRPC connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("dRPC accept failed: {}", e);
                        }
                    }
                }
            }
        }

        debug!("dRPC listener on {} stopping", self.socket_path.display());
        remove_stale_socket(&self.socket_path)
    }
}

async fn serve_conn(
    mut stream: UnixStream,
    handler: Arc<dyn DrpcHandler>,
    token: CancellationToken,
) -> CtlResult<()> {
    loop {
        let data = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            data = read_frame(&mut stream) => data?,
        };
        let Some(data) = data else {
            return Ok(());
        };

        let resp = dispatch(&data, handler.as_ref()).await;
        write_frame(&mut stream, &resp.encode_to_vec()).await?;
    }
}

async fn dispatch(data: &[u8], handler: &dyn DrpcHandler) -> Response {
    let call = match Call::decode(data) {
        Ok(call) => call,
        Err(e) => {
            warn!("failed to decode dRPC call: {}", e);
            return Response::failure(0, Status::FailedUnmarshalCall);
        }
    };

    let method = match DrpcMethod::from_ids(call.module, call.method) {
        Ok(m) => m,
        Err(e) => {
            warn!("{}", e);
            return Response::failure(call.sequence, Status::UnknownMethod);
        }
    };

    match handler.handle(method, &call.body).await {
        Ok(body) => Response::success(call.sequence, body),
        Err(CtlError::Decode { what, reason }) => {
            warn!("dRPC {}: bad payload {}: {}", method, what, reason);
            Response::failure(call.sequence, Status::FailedUnmarshalPayload)
        }
        Err(e) => {
            error!("dRPC {} handler failed: {}", method, e);
            Response::failure(call.sequence, Status::Failure)
        }
    }
}
