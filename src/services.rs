//! Wiring of the core components to their default collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::assets::AssetCache;
use crate::config::{ServerConfig, StaleBackend};
use crate::jobs::JobManager;
use crate::model::{ModelStore, RemoteHeads, StalenessDetector, Synchronizer};
use crate::ops::{
    CommandRunner, EsbuildTransformer, FileCatalog, GitInspector, GithubHeads, LsRemoteHeads,
};

/// Every long-lived component a command needs.
pub struct Services {
    pub store: Arc<ModelStore>,
    pub jobs: Arc<JobManager>,
    pub assets: Arc<AssetCache>,
    pub synchronizer: Arc<Synchronizer>,
    pub detector: Arc<StalenessDetector>,
}

impl Services {
    /// Load the snapshot and build every component from `config`.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let snapshot = snapshot_file(config);
        let store = Arc::new(
            ModelStore::load(&snapshot)
                .with_context(|| format!("Failed to load snapshot {}", snapshot.display()))?,
        );
        let repos = store.read(|m| m.repos.len());
        info!(path = %snapshot.display(), repos, "model loaded");

        let root = config.root_dir.clone();
        let runner = Arc::new(CommandRunner::new(
            &root,
            &config.github_owner,
            config.build_command.clone(),
            config.install_command.clone(),
        ));
        let jobs = JobManager::new(Arc::clone(&store), runner, config.job_retention());

        let transformer = Arc::new(EsbuildTransformer::new(&config.esbuild_command));
        let assets = Arc::new(AssetCache::new(&root, transformer));

        let catalog = Arc::new(FileCatalog::new(
            &root,
            config.repo_lists.clone(),
            &config.runnables_list,
            &config.release_branches_file,
        ));
        let inspector = Arc::new(GitInspector::new(&root, &config.github_owner));
        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&store),
            catalog,
            inspector,
            config.sync_concurrency,
        ));

        let heads: Arc<dyn RemoteHeads> = match config.stale_backend {
            StaleBackend::LsRemote => Arc::new(LsRemoteHeads::new(&root, &config.github_owner)),
            StaleBackend::Github => {
                let token = config
                    .github_token
                    .clone()
                    .context("The github stale backend requires GITHUB_TOKEN")?;
                Arc::new(GithubHeads::new(
                    &config.github_owner,
                    token,
                    config.api_concurrency,
                ))
            }
        };
        let detector = Arc::new(StalenessDetector::new(heads));

        Ok(Self {
            store,
            jobs,
            assets,
            synchronizer,
            detector,
        })
    }
}

/// Snapshot location; relative paths are resolved against the root directory.
pub fn snapshot_file(config: &ServerConfig) -> PathBuf {
    config.root_dir.join(&config.snapshot_path)
}
