use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::types::{BranchRecord, Model};
use crate::errors::ModelError;

/// Owner of the in-memory model and its snapshot file.
///
/// Every read-modify-write of a record happens inside a single `write` call,
/// so concurrent async tasks never interleave partial updates. Snapshots are
/// written to a temporary sibling file and renamed over the previous one.
pub struct ModelStore {
    model: RwLock<Model>,
    snapshot_path: Option<PathBuf>,
    save_lock: tokio::sync::Mutex<()>,
}

impl ModelStore {
    /// A store that never touches disk (tests, dry runs).
    pub fn in_memory(model: Model) -> Self {
        Self {
            model: RwLock::new(model),
            snapshot_path: None,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the snapshot at `path`, or start empty if it does not exist yet.
    ///
    /// Jobs never survive a restart, so any job id left in the snapshot is
    /// cleared before the store is handed out.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let mut model = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| {
                ModelError::SnapshotRead {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            serde_json::from_str::<Model>(&content).map_err(|source| {
                ModelError::SnapshotDecode {
                    path: path.to_path_buf(),
                    source,
                }
            })?
        } else {
            info!(path = %path.display(), "no snapshot found, starting with an empty model");
            Model::default()
        };

        let reset = model.reset_job_ids();
        if reset > 0 {
            warn!(reset, "cleared job ids left over from a previous run");
        }

        Ok(Self {
            model: RwLock::new(model),
            snapshot_path: Some(path.to_path_buf()),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Model) -> R) -> R {
        let guard = self.model.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Model) -> R) -> R {
        let mut guard = self.model.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Clone of one branch record.
    pub fn branch(&self, repo: &str, branch: &str) -> Result<BranchRecord, ModelError> {
        self.read(|model| lookup(model, repo, branch).cloned())
    }

    /// Mutate one branch record in a single critical section.
    pub fn update_branch<R>(
        &self,
        repo: &str,
        branch: &str,
        f: impl FnOnce(&mut BranchRecord) -> R,
    ) -> Result<R, ModelError> {
        self.write(|model| {
            if !model.repos.contains_key(repo) {
                return Err(ModelError::RepoNotFound {
                    repo: repo.to_string(),
                });
            }
            let record = model
                .branch_mut(repo, branch)
                .ok_or_else(|| ModelError::BranchNotFound {
                    repo: repo.to_string(),
                    branch: branch.to_string(),
                })?;
            Ok(f(record))
        })
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        self.read(|model| serde_json::to_string_pretty(model))
            .map_err(ModelError::SnapshotEncode)
    }

    /// Write the current model to the snapshot file. No-op for in-memory stores.
    pub async fn persist(&self) -> Result<(), ModelError> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };

        // Serialize under the save lock so a later snapshot can never be
        // overwritten by an earlier one.
        let _guard = self.save_lock.lock().await;
        let content = self.to_json()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ModelError::SnapshotWrite {
                    path: path.clone(),
                    source,
                })?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|source| ModelError::SnapshotWrite {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| ModelError::SnapshotWrite {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    /// `persist` for callers that cannot propagate the error.
    pub async fn persist_or_log(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to write model snapshot");
        }
    }
}

fn lookup<'a>(model: &'a Model, repo: &str, branch: &str) -> Result<&'a BranchRecord, ModelError> {
    let record = model.repos.get(repo).ok_or_else(|| ModelError::RepoNotFound {
        repo: repo.to_string(),
    })?;
    record
        .branches
        .get(branch)
        .ok_or_else(|| ModelError::BranchNotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
}
