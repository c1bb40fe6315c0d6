//! Filesystem-backed artifact store.
//!
//! Holds the uploaded input and the two produced outputs per task under a
//! single data root, addressed by opaque [`ArtifactRef`]s. Append/delete
//! only: a stored blob is never rewritten in place.

use crate::error::StoreError;
use crate::task::{ArtifactKind, ArtifactRef, TaskId};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const UPLOADS_DIR: &str = "uploads";
const OUTPUTS_DIR: &str = "outputs";
const WORK_DIR: &str = "work";

/// Content storage rooted at a data directory with `uploads/`, `outputs/`
/// and `work/` (per-task scratch) subdirectories.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open a store at `root`, creating the subdirectories if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [UPLOADS_DIR, OUTPUTS_DIR, WORK_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    /// Write uploaded input bytes, returning a reference to them.
    ///
    /// `ext` is the original file extension including the leading dot.
    pub async fn put_input(
        &self,
        id: TaskId,
        bytes: &[u8],
        ext: &str,
    ) -> Result<ArtifactRef, StoreError> {
        let rel = format!("{UPLOADS_DIR}/{id}{ext}");
        tokio::fs::write(self.root.join(&rel), bytes).await?;
        debug!("stored input for task {} ({} bytes)", id, bytes.len());
        Ok(ArtifactRef(rel))
    }

    /// Move a file produced by an external tool into its final location
    /// inside the store.
    pub async fn adopt(
        &self,
        id: TaskId,
        kind: ArtifactKind,
        produced: &Path,
    ) -> Result<ArtifactRef, StoreError> {
        let rel = match kind {
            ArtifactKind::Drum => format!("{OUTPUTS_DIR}/{id}_drums.wav"),
            ArtifactKind::Midi => format!("{OUTPUTS_DIR}/{id}_drums.mid"),
            ArtifactKind::Input => {
                return Err(StoreError::InvalidRef(
                    "inputs are stored via put_input".to_string(),
                ));
            }
        };
        let dest = self.root.join(&rel);
        if tokio::fs::rename(produced, &dest).await.is_err() {
            // Rename fails across filesystems; fall back to copy + remove.
            tokio::fs::copy(produced, &dest).await?;
            tokio::fs::remove_file(produced).await?;
        }
        Ok(ArtifactRef(rel))
    }

    /// Read artifact bytes. Not-found covers both unknown and expired refs.
    pub async fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(artifact)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(artifact.as_str().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Absolute path of an artifact, for handing to external processes.
    pub fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        let rel = Path::new(artifact.as_str());
        let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidRef(artifact.as_str().to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Per-task scratch directory for intermediate files; created on demand.
    pub async fn scratch_dir(&self, id: TaskId) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(WORK_DIR).join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove the produced outputs and scratch directory of a task, keeping
    /// the uploaded input. Used when discarding partial results.
    pub async fn delete_outputs(&self, id: TaskId) {
        self.remove_prefixed(&self.root.join(OUTPUTS_DIR), id).await;
        let scratch = self.root.join(WORK_DIR).join(id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove scratch dir for {}: {}", id, e);
            }
        }
    }

    /// Remove every blob associated with a task. Idempotent.
    pub async fn delete_all(&self, id: TaskId) {
        self.remove_prefixed(&self.root.join(UPLOADS_DIR), id).await;
        self.delete_outputs(id).await;
    }

    /// Delete files in `uploads/` and `outputs/` older than `cutoff` that
    /// belong to none of the `live` tasks. Safety net for entries orphaned
    /// by a crash; driven by the sweep.
    pub async fn prune_orphans(&self, cutoff: std::time::SystemTime, live: &[TaskId]) {
        let live: Vec<String> = live.iter().map(TaskId::to_string).collect();
        for dir in [UPLOADS_DIR, OUTPUTS_DIR] {
            let dir = self.root.join(dir);
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                let old = meta
                    .modified()
                    .map(|m| m < cutoff)
                    .unwrap_or(false);
                let name = entry.file_name();
                let owned = {
                    let name = name.to_string_lossy();
                    live.iter().any(|id| name.starts_with(id.as_str()))
                };
                if meta.is_file() && old && !owned {
                    debug!("pruning orphaned file {:?}", entry.path());
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
    }

    async fn remove_prefixed(&self, dir: &Path, id: TaskId) {
        let prefix = id.to_string();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let matches = name.to_string_lossy().starts_with(&prefix);
            if matches {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("failed to remove {:?}: {}", entry.path(), e);
                }
            }
        }
    }
}
