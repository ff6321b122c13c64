//! Reconciles the model store against the repos on disk and on the code host.
//!
//! A pass removes repos that dropped out of every active list, initializes
//! newly listed repos, refreshes repo flags and the git state of every
//! checked-out branch, and adds newly maintained release branches. Every
//! per-repo and per-branch probe runs under one bounded limiter; a probe that
//! fails is logged and leaves the record's previous values in place.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::store::ModelStore;
use super::types::{
    BranchProbe, BranchRecord, DEFAULT_BRANCH, PackageInfo, RepoMetadata, RepoRecord,
};

/// The union of the active repo lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRepos {
    pub repos: BTreeSet<String>,
    /// Subset of `repos` that can be launched in a browser
    pub runnables: BTreeSet<String>,
}

enum BranchRefresh {
    Updated,
    /// The record was removed while the probe ran
    Vanished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReleaseBranch {
    pub repo: String,
    pub branch: String,
}

/// Ground truth about which repos and release branches exist.
#[async_trait]
pub trait RepoCatalog: Send + Sync {
    async fn active_repos(&self) -> Result<ActiveRepos>;

    /// Release branches still maintained, whether or not checked out here.
    async fn release_branches(&self) -> Result<Vec<ReleaseBranch>>;
}

/// Per-repo and per-branch probes against checkouts and the remote.
#[async_trait]
pub trait RepoInspector: Send + Sync {
    /// Make a local checkout of the repo's main line exist.
    async fn initialize_repo(&self, repo: &str) -> Result<()>;

    async fn repo_metadata(&self, repo: &str) -> Result<RepoMetadata>;

    /// `package.json` from the local checkout of a branch.
    async fn package_info(&self, repo: &str, branch: &str) -> Result<PackageInfo>;

    /// `package.json` read from the remote branch without a checkout.
    async fn remote_package_info(&self, repo: &str, branch: &str) -> Result<PackageInfo>;

    async fn probe_branch(&self, repo: &str, branch: &str) -> Result<BranchProbe>;
}

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub refreshed_branches: usize,
    pub release_branches_added: Vec<ReleaseBranch>,
    pub failures: usize,
}

pub struct Synchronizer {
    store: Arc<ModelStore>,
    catalog: Arc<dyn RepoCatalog>,
    inspector: Arc<dyn RepoInspector>,
    limiter: Semaphore,
    /// Held for the duration of a pass so passes never overlap
    running: tokio::sync::Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<ModelStore>,
        catalog: Arc<dyn RepoCatalog>,
        inspector: Arc<dyn RepoInspector>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            catalog,
            inspector,
            limiter: Semaphore::new(concurrency.max(1)),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Run a full pass against the catalog's current repo set.
    ///
    /// Returns `Ok(None)` when another pass is already running. Failing to
    /// read the repo lists aborts the pass: without them every repo would
    /// look vanished.
    pub async fn sync(&self) -> Result<Option<SyncReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("synchronization already in progress, skipping");
            return Ok(None);
        };
        let active = self.catalog.active_repos().await?;
        Ok(Some(self.sync_repos(active).await))
    }

    /// Run a pass against an explicit active set.
    pub async fn sync_with(&self, active: ActiveRepos) -> SyncReport {
        let _guard = self.running.lock().await;
        self.sync_repos(active).await
    }

    async fn sync_repos(&self, active: ActiveRepos) -> SyncReport {
        let mut report = SyncReport::default();

        let existing: BTreeSet<String> = self.store.read(|m| m.repos.keys().cloned().collect());
        report.removed = existing.difference(&active.repos).cloned().collect();
        let added: Vec<String> = active.repos.difference(&existing).cloned().collect();
        let kept: Vec<String> = existing.intersection(&active.repos).cloned().collect();

        if !report.removed.is_empty() {
            self.store.write(|model| {
                for repo in &report.removed {
                    model.repos.remove(repo);
                }
            });
            info!(repos = ?report.removed, "removed repos no longer listed");
        }

        let initialized = join_all(
            added
                .iter()
                .map(|repo| self.initialize(repo, active.runnables.contains(repo))),
        )
        .await;
        for (repo, result) in added.iter().zip(initialized) {
            match result {
                Ok(record) => {
                    self.store.write(|model| {
                        model.repos.insert(repo.clone(), record);
                    });
                    report.added.push(repo.clone());
                }
                Err(e) => {
                    warn!(%repo, error = %format!("{:#}", e), "failed to initialize repo");
                    report.failures += 1;
                }
            }
        }

        let refreshed = join_all(
            kept.iter()
                .map(|repo| self.refresh_repo(repo, active.runnables.contains(repo))),
        )
        .await;
        report.failures += refreshed.into_iter().filter(|ok| !ok).count();

        let checked_out: Vec<(String, String)> = self.store.read(|model| {
            model
                .repos
                .iter()
                .flat_map(|(repo, record)| {
                    record
                        .branches
                        .values()
                        .filter(|b| b.is_checked_out)
                        .map(move |b| (repo.clone(), b.branch.clone()))
                })
                .collect()
        });
        let probed = join_all(
            checked_out
                .iter()
                .map(|(repo, branch)| self.refresh_branch(repo, branch)),
        )
        .await;
        for outcome in probed {
            match outcome {
                BranchRefresh::Updated => report.refreshed_branches += 1,
                BranchRefresh::Vanished => {}
                BranchRefresh::Failed => report.failures += 1,
            }
        }

        match self.discover_release_branches().await {
            Ok((added, failures)) => {
                report.release_branches_added = added;
                report.failures += failures;
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "failed to list release branches");
                report.failures += 1;
            }
        }

        self.store.persist_or_log().await;
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            refreshed = report.refreshed_branches,
            release_branches = report.release_branches_added.len(),
            failures = report.failures,
            "synchronization pass complete"
        );
        report
    }

    async fn initialize(&self, repo: &str, is_runnable: bool) -> Result<RepoRecord> {
        let _permit = self.limiter.acquire().await?;
        self.inspector.initialize_repo(repo).await?;
        let metadata = self.inspector.repo_metadata(repo).await?;

        let mut record = RepoRecord::default();
        record.apply_metadata(metadata, is_runnable);

        let mut main = BranchRecord::new(repo, DEFAULT_BRANCH);
        main.is_checked_out = true;
        main.apply_package(self.inspector.package_info(repo, DEFAULT_BRANCH).await?);
        match self.inspector.probe_branch(repo, DEFAULT_BRANCH).await {
            Ok(probe) => main.apply_probe(probe),
            Err(e) => warn!(%repo, error = %format!("{:#}", e), "failed to probe new repo"),
        }
        record.branches.insert(DEFAULT_BRANCH.to_string(), main);

        info!(%repo, "initialized repo");
        Ok(record)
    }

    async fn refresh_repo(&self, repo: &str, is_runnable: bool) -> bool {
        let metadata = match self.limiter.acquire().await {
            Ok(_permit) => self.inspector.repo_metadata(repo).await,
            Err(e) => Err(e.into()),
        };
        match metadata {
            Ok(metadata) => {
                self.store.write(|model| {
                    if let Some(record) = model.repos.get_mut(repo) {
                        record.apply_metadata(metadata, is_runnable);
                    }
                });
                true
            }
            Err(e) => {
                warn!(%repo, error = %format!("{:#}", e), "failed to refresh repo metadata");
                false
            }
        }
    }

    async fn refresh_branch(&self, repo: &str, branch: &str) -> BranchRefresh {
        let probed = match self.limiter.acquire().await {
            Ok(_permit) => {
                let probe = self.inspector.probe_branch(repo, branch).await;
                let package = self.inspector.package_info(repo, branch).await;
                probe.and_then(|probe| Ok((probe, package?)))
            }
            Err(e) => Err(e.into()),
        };
        match probed {
            Ok((probe, package)) => {
                let updated = self.store.update_branch(repo, branch, |record| {
                    record.apply_probe(probe);
                    record.apply_package(package);
                });
                match updated {
                    Ok(()) => BranchRefresh::Updated,
                    Err(e) => {
                        debug!(%repo, %branch, error = %e, "branch removed while it was probed");
                        BranchRefresh::Vanished
                    }
                }
            }
            Err(e) => {
                warn!(%repo, %branch, error = %format!("{:#}", e), "failed to refresh branch");
                BranchRefresh::Failed
            }
        }
    }

    /// Add maintained release branches not yet in the model. Returns the
    /// branches added and the number that failed.
    async fn discover_release_branches(&self) -> Result<(Vec<ReleaseBranch>, usize)> {
        let listed = self.catalog.release_branches().await?;
        let missing: Vec<ReleaseBranch> = self.store.read(|model| {
            listed
                .into_iter()
                .filter(|rb| {
                    model
                        .repos
                        .get(&rb.repo)
                        .is_some_and(|repo| !repo.branches.contains_key(&rb.branch))
                })
                .collect()
        });

        let fetched = join_all(missing.iter().map(|rb| async move {
            let _permit = self.limiter.acquire().await?;
            self.inspector.remote_package_info(&rb.repo, &rb.branch).await
        }))
        .await;

        let mut added = Vec::new();
        let mut failures = 0;
        for (rb, result) in missing.into_iter().zip(fetched) {
            match result {
                Ok(package) => {
                    let mut record = BranchRecord::new(&rb.repo, &rb.branch);
                    record.is_release = true;
                    record.apply_package(package);
                    self.store.write(|model| {
                        if let Some(repo) = model.repos.get_mut(&rb.repo) {
                            repo.branches.entry(rb.branch.clone()).or_insert(record);
                        }
                    });
                    debug!(repo = %rb.repo, branch = %rb.branch, "discovered release branch");
                    added.push(rb);
                }
                Err(e) => {
                    warn!(
                        repo = %rb.repo,
                        branch = %rb.branch,
                        error = %format!("{:#}", e),
                        "failed to read release branch metadata"
                    );
                    failures += 1;
                }
            }
        }
        Ok((added, failures))
    }
}
