//! Length-prefixed framing and Unix socket helpers.
//!
//! Wire format: `u32 length prefix (big-endian) + encoded message`.

use std::path::Path;

use hive_proto::defaults::MAX_MESSAGE_SIZE;
use hive_proto::{CtlError, CtlResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error};

/// Write one frame.
pub async fn write_frame<W>(w: &mut W, data: &[u8]) -> CtlResult<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(CtlError::MessageTooLarge(data.len()));
    }
    w.write_u32(data.len() as u32)
        .await
        .map_err(|e| CtlError::Network(e.to_string()))?;
    w.write_all(data)
        .await
        .map_err(|e| CtlError::Network(e.to_string()))?;
    w.flush().await.map_err(|e| CtlError::Network(e.to_string()))
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(r: &mut R) -> CtlResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match r.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CtlError::Network(e.to_string())),
    };

    // Protects against corrupt length prefixes
    if len > MAX_MESSAGE_SIZE {
        return Err(CtlError::MessageTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| CtlError::Network(e.to_string()))?;
    Ok(Some(buf))
}

/// Connect to a dRPC socket.
pub async fn connect_unix(path: &Path) -> CtlResult<UnixStream> {
    debug!("connecting to {}", path.display());
    UnixStream::connect(path)
        .await
        .map_err(|e| CtlError::Network(format!("connect {}: {}", path.display(), e)))
}

/// Bind a dRPC listener socket, removing any stale socket file first.
pub fn bind_unix(path: &Path) -> CtlResult<UnixListener> {
    remove_stale_socket(path)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    UnixListener::bind(path).map_err(|e| {
        error!("failed to bind {}: {}", path.display(), e);
        CtlError::Io(e)
    })
}

/// Remove a socket file if present. Missing files are not an error.
pub fn remove_stale_socket(path: &Path) -> CtlResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CtlError::Io(e)),
    }
}
