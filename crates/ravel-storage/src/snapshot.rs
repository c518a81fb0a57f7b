use std::path::{Path, PathBuf};

use ravel_types::RavelError;
use tokio::io::AsyncWriteExt;

use crate::traits::SnapshotStore;
use crate::types::{Snapshot, SnapshotMeta};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

fn io_err(e: std::io::Error) -> RavelError {
    RavelError::Storage(e.to_string())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), RavelError> {
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)
}

/// Make renames and removals inside `dir` durable.
async fn sync_dir(dir: &Path) -> Result<(), RavelError> {
    tokio::fs::File::open(dir).await.map_err(io_err)?.sync_all().await.map_err(io_err)
}

/// `SnapshotStore` keeping one directory per snapshot under `root`:
///
/// ```text
/// <root>/<last_log_index:020>-<term>-<snapshot_id>/meta.json
///                                                 /state.bin
/// ```
///
/// A snapshot is written and fsynced into a `.tmp` directory, renamed into
/// place, and the root directory is fsynced before `save` returns. A crash
/// mid-write never leaves a half-written snapshot visible, and a saved
/// snapshot survives power loss. Only the newest `retain` snapshots are kept.
pub struct FileSnapshotStore {
    root: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Open (or create) the store, discarding any interrupted writes.
    pub async fn open(root: impl AsRef<Path>, retain: usize) -> Result<Self, RavelError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(io_err)?;

        let mut dir = tokio::fs::read_dir(&root).await.map_err(io_err)?;
        while let Some(ent) = dir.next_entry().await.map_err(io_err)? {
            if ent.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                tracing::warn!(path = %ent.path().display(), "removing incomplete snapshot");
                tokio::fs::remove_dir_all(ent.path()).await.map_err(io_err)?;
            }
        }

        Ok(FileSnapshotStore { root, retain: retain.max(1) })
    }

    fn dir_name(meta: &SnapshotMeta) -> String {
        format!("{:020}-{}-{}", meta.last_log_index, meta.last_log_term, meta.snapshot_id)
    }

    /// Every complete snapshot directory with its metadata, newest first.
    async fn scan(&self) -> Result<Vec<(PathBuf, SnapshotMeta)>, RavelError> {
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        while let Some(ent) = dir.next_entry().await.map_err(io_err)? {
            let path = ent.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) || !ent.file_type().await.map_err(io_err)?.is_dir() {
                continue;
            }
            let raw = match tokio::fs::read(path.join(META_FILE)).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping snapshot without metadata");
                    continue;
                }
            };
            match serde_json::from_slice::<SnapshotMeta>(&raw) {
                Ok(meta) => found.push((path, meta)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping snapshot with bad metadata");
                }
            }
        }
        found.sort_by(|a, b| b.1.last_log_index.cmp(&a.1.last_log_index));
        Ok(found)
    }

    async fn reap(&self) -> Result<(), RavelError> {
        for (path, meta) in self.scan().await?.into_iter().skip(self.retain) {
            tracing::debug!(snapshot_id = %meta.snapshot_id, "reaping old snapshot");
            tokio::fs::remove_dir_all(&path).await.map_err(io_err)?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), RavelError> {
        let name = Self::dir_name(&snapshot.meta);
        let tmp = self.root.join(format!("{name}{TMP_SUFFIX}"));
        let dst = self.root.join(&name);

        tokio::fs::create_dir_all(&tmp).await.map_err(io_err)?;
        let meta = serde_json::to_vec_pretty(&snapshot.meta)
            .map_err(|e| RavelError::Storage(e.to_string()))?;
        write_synced(&tmp.join(STATE_FILE), &snapshot.data).await?;
        write_synced(&tmp.join(META_FILE), &meta).await?;
        sync_dir(&tmp).await?;
        tokio::fs::rename(&tmp, &dst).await.map_err(io_err)?;
        sync_dir(&self.root).await?;

        tracing::info!(
            snapshot_id = %snapshot.meta.snapshot_id,
            last_log_index = snapshot.meta.last_log_index,
            bytes = snapshot.data.len(),
            "snapshot saved"
        );
        self.reap().await
    }

    async fn latest(&self) -> Result<Option<Snapshot>, RavelError> {
        let Some((path, meta)) = self.scan().await?.into_iter().next() else {
            return Ok(None);
        };
        let data = tokio::fs::read(path.join(STATE_FILE)).await.map_err(io_err)?;
        Ok(Some(Snapshot { meta, data }))
    }

    async fn list(&self) -> Result<Vec<SnapshotMeta>, RavelError> {
        Ok(self.scan().await?.into_iter().map(|(_, meta)| meta).collect())
    }
}
