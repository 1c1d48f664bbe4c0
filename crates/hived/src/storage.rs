//! Per-engine storage provider.
//!
//! Device scanning and formatting happen elsewhere; the control plane only
//! needs to know where an engine's SCM mount lives and how to read and
//! write the superblock kept on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hive_proto::defaults::SUPERBLOCK_NAME;
use hive_proto::CtlResult;

use crate::superblock::{FileSuperblockStore, Superblock, SuperblockStore};

#[derive(Clone)]
pub struct StorageProvider {
    scm_mount: PathBuf,
    store: Arc<dyn SuperblockStore>,
}

impl StorageProvider {
    /// Provider persisting the superblock as a file under `scm_mount`.
    pub fn new(scm_mount: impl Into<PathBuf>) -> Self {
        Self::with_store(scm_mount, Arc::new(FileSuperblockStore))
    }

    pub fn with_store(scm_mount: impl Into<PathBuf>, store: Arc<dyn SuperblockStore>) -> Self {
        Self {
            scm_mount: scm_mount.into(),
            store,
        }
    }

    pub fn scm_mount(&self) -> &Path {
        &self.scm_mount
    }

    pub fn superblock_path(&self) -> PathBuf {
        self.scm_mount.join(SUPERBLOCK_NAME)
    }

    pub async fn read_superblock(&self) -> CtlResult<Option<Superblock>> {
        self.store.load(&self.superblock_path()).await
    }

    pub async fn write_superblock(&self, sb: &Superblock) -> CtlResult<()> {
        self.store.save(sb, &self.superblock_path()).await
    }
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvider")
            .field("scm_mount", &self.scm_mount)
            .finish_non_exhaustive()
    }
}
