//! Engine superblock persistence.
//!
//! The superblock is the durable identity of one engine instance: its UUID
//! (assigned at format time), its rank once a join has succeeded, the last
//! URI the engine reported and the host fault domain. It is loaded when the
//! instance starts and rewritten whenever one of those fields changes, so a
//! restarting engine rejoins with the same identity.
//!
//! Writes go to a temporary file in the same directory which is synced and
//! then renamed over the previous copy, so a crash mid-write leaves the last
//! committed superblock intact.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use hive_proto::{CtlError, CtlResult, Rank};

/// Current on-disk format version.
pub const SUPERBLOCK_VERSION: u8 = 0;

/// Durable identity record of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u8,
    /// Cluster-unique identifier, immutable once set.
    pub uuid: Uuid,
    /// Name of the system this engine was formatted for.
    pub system: String,
    /// Absent until the first successful join.
    pub rank: Option<Rank>,
    /// Set once the membership authority has confirmed `rank`.
    pub valid_rank: bool,
    /// Last-known engine network address.
    pub uri: String,
    pub host_fault_domain: String,
}

impl Superblock {
    /// Create a fresh superblock with a new random UUID and no rank.
    pub fn new(system: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), system)
    }

    pub fn with_uuid(uuid: Uuid, system: impl Into<String>) -> Self {
        Self {
            version: SUPERBLOCK_VERSION,
            uuid,
            system: system.into(),
            rank: None,
            valid_rank: false,
            uri: String::new(),
            host_fault_domain: String::new(),
        }
    }
}

/// Load/save pair over a superblock location.
#[async_trait]
pub trait SuperblockStore: Send + Sync {
    /// Load the superblock, `Ok(None)` if none has been written yet.
    async fn load(&self, path: &Path) -> CtlResult<Option<Superblock>>;

    /// Persist the superblock. Must be atomic with respect to crashes.
    async fn save(&self, sb: &Superblock, path: &Path) -> CtlResult<()>;
}

/// Superblock store backed by a bincode file on the engine's SCM mount.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSuperblockStore;

#[async_trait]
impl SuperblockStore for FileSuperblockStore {
    async fn load(&self, path: &Path) -> CtlResult<Option<Superblock>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!("failed to read superblock from {}: {}", path.display(), e);
                return Err(CtlError::Io(e));
            }
        };
        let sb: Superblock = bincode::deserialize(&data).map_err(|e| {
            error!("corrupt superblock: {}", path.display());
            CtlError::Superblock(format!("decode {}: {}", path.display(), e))
        })?;
        debug!("loaded superblock {} from {}", sb.uuid, path.display());
        Ok(Some(sb))
    }

    async fn save(&self, sb: &Superblock, path: &Path) -> CtlResult<()> {
        let data = bincode::serialize(sb)
            .map_err(|e| CtlError::Superblock(format!("encode: {}", e)))?;
        atomic_write(path, &data).await?;
        debug!(
            "saved superblock {} (rank={:?}, uri={:?}) to {}",
            sb.uuid,
            sb.rank,
            sb.uri,
            path.display()
        );
        Ok(())
    }
}

/// Write data to a temporary file, sync it, then rename it into place.
///
/// The temp file lives in the same directory as `target` so the rename
/// never crosses filesystems.
async fn atomic_write(target: &Path, data: &[u8]) -> CtlResult<()> {
    let dir = target
        .parent()
        .ok_or_else(|| CtlError::Superblock(format!("no parent dir for {}", target.display())))?;
    fs::create_dir_all(dir).await?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{}.tmp_{}", name, std::process::id()));

    let written = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;
    if let Err(e) = written {
        warn!("failed to write tmp file {}: {}", tmp_path.display(), e);
        let _ = fs::remove_file(&tmp_path).await;
        return Err(CtlError::Io(e));
    }

    if let Err(e) = fs::rename(&tmp_path, target).await {
        warn!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path).await;
        return Err(CtlError::Io(e));
    }

    Ok(())
}
