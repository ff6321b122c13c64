//! Fakes and fixtures shared by the unit tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::assets::{AssetCache, Transformer};
use crate::jobs::{JobEvent, JobKind, JobManager, JobRunner, OutputSink};
use crate::model::{
    ActiveRepos, BranchProbe, BranchRecord, Model, ModelStore, PackageInfo, ReleaseBranch,
    RemoteHeads, RepoCatalog, RepoInspector, RepoMetadata, RepoRecord, StalenessDetector,
    Synchronizer,
};
use crate::server::{AppState, SharedState};
use crate::services::Services;

/// joist/main, gravity/main and release branch gravity/1.3 (depends on joist).
pub fn sample_store() -> Arc<ModelStore> {
    let mut model = Model::default();

    let mut joist = RepoRecord {
        name: "Joist".to_string(),
        owner: "phetsims".to_string(),
        ..RepoRecord::default()
    };
    let mut main = BranchRecord::new("joist", "main");
    main.is_checked_out = true;
    main.sha = Some("1111111".to_string());
    main.timestamp = Some(1_700_000_000_000);
    joist.branches.insert("main".to_string(), main);
    model.repos.insert("joist".to_string(), joist);

    let mut gravity = RepoRecord {
        name: "Gravity".to_string(),
        owner: "phetsims".to_string(),
        is_simulation: true,
        is_runnable: true,
        ..RepoRecord::default()
    };
    let mut main = BranchRecord::new("gravity", "main");
    main.is_checked_out = true;
    main.sha = Some("3333333".to_string());
    main.dependency_repos = vec!["joist".to_string()];
    gravity.branches.insert("main".to_string(), main);
    let mut release = BranchRecord::new("gravity", "1.3");
    release.version = Some("1.3.0".to_string());
    release.dependency_repos = vec!["joist".to_string()];
    gravity.branches.insert("1.3".to_string(), release);
    model.repos.insert("gravity".to_string(), gravity);

    Arc::new(ModelStore::in_memory(model))
}

/// Attach to a job and collect every event until the stream ends.
pub async fn collect_events(manager: &JobManager, id: u64, kind: JobKind) -> Vec<JobEvent> {
    let subscription = manager.attach(id, kind).unwrap();
    tokio::time::timeout(Duration::from_secs(5), subscription.collect::<Vec<_>>())
        .await
        .expect("job did not complete in time")
}

pub fn active(repos: &[&str], runnables: &[&str]) -> ActiveRepos {
    let runnables: BTreeSet<String> = runnables.iter().map(|r| r.to_string()).collect();
    let mut repos: BTreeSet<String> = repos.iter().map(|r| r.to_string()).collect();
    repos.extend(runnables.iter().cloned());
    ActiveRepos { repos, runnables }
}

/// A full application state over fakes, with the asset root in a temp dir.
pub fn test_state() -> (TempDir, SharedState) {
    test_state_with(FakeRunner::immediate(), Duration::from_secs(15))
}

pub fn test_state_with(runner: Arc<FakeRunner>, heartbeat: Duration) -> (TempDir, SharedState) {
    let dir = TempDir::new().unwrap();
    let store = sample_store();
    let jobs = JobManager::new(Arc::clone(&store), runner, Duration::from_secs(60));
    let assets = Arc::new(AssetCache::new(dir.path(), CountingTransformer::new()));
    let synchronizer = Arc::new(Synchronizer::new(
        Arc::clone(&store),
        Arc::new(FakeCatalog::new(&["joist", "gravity"], &["gravity"])),
        FakeInspector::new(),
        4,
    ));
    let detector = Arc::new(StalenessDetector::new(FakeHeads::new(&[(
        "joist", "main", "2222222",
    )])));
    let services = Services {
        store,
        jobs,
        assets,
        synchronizer,
        detector,
    };
    (dir, AppState::new(services, heartbeat))
}

// ── Job runner ────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    Fail,
    Panic,
}

pub struct FakeRunner {
    outcome: Outcome,
    gate: Option<Semaphore>,
    builds: AtomicUsize,
    updates: AtomicUsize,
}

impl FakeRunner {
    fn with(outcome: Outcome, gated: bool) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            gate: gated.then(|| Semaphore::new(0)),
            builds: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        })
    }

    /// Operations block until `release` is called once per operation.
    pub fn gated() -> Arc<Self> {
        Self::with(Outcome::Succeed, true)
    }

    pub fn immediate() -> Arc<Self> {
        Self::with(Outcome::Succeed, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::with(Outcome::Fail, false)
    }

    pub fn panicking() -> Arc<Self> {
        Self::with(Outcome::Panic, false)
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn build_calls(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    async fn wait_and_finish(&self) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail => bail!("build exploded"),
            Outcome::Panic => panic!("runner panicked"),
        }
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn build(&self, repo: &str, branch: &str, output: OutputSink) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        output.line(&format!("building {}@{}", repo, branch));
        self.wait_and_finish().await?;
        output.line("finished");
        Ok(())
    }

    async fn update_checkout(&self, _repo: &str, _branch: &str) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.wait_and_finish().await
    }
}

// ── Synchronizer collaborators ────────────────────────────────────────

pub struct FakeCatalog {
    active: Option<ActiveRepos>,
    release_branches: Vec<ReleaseBranch>,
}

impl FakeCatalog {
    pub fn new(repos: &[&str], runnables: &[&str]) -> Self {
        Self {
            active: Some(active(repos, runnables)),
            release_branches: Vec::new(),
        }
    }

    pub fn failing() -> Self {
        Self {
            active: None,
            release_branches: Vec::new(),
        }
    }

    pub fn with_release_branches(mut self, branches: &[(&str, &str)]) -> Self {
        self.release_branches = branches
            .iter()
            .map(|(repo, branch)| ReleaseBranch {
                repo: repo.to_string(),
                branch: branch.to_string(),
            })
            .collect();
        self
    }
}

#[async_trait]
impl RepoCatalog for FakeCatalog {
    async fn active_repos(&self) -> Result<ActiveRepos> {
        self.active
            .clone()
            .ok_or_else(|| anyhow!("repo list unavailable"))
    }

    async fn release_branches(&self) -> Result<Vec<ReleaseBranch>> {
        Ok(self.release_branches.clone())
    }
}

/// Answers every probe with values derived from the repo and branch names.
pub struct FakeInspector {
    initialized: Mutex<Vec<String>>,
    failing_probes: Mutex<HashSet<(String, String)>>,
    unit_tests: AtomicBool,
}

impl FakeInspector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            initialized: Mutex::new(Vec::new()),
            failing_probes: Mutex::new(HashSet::new()),
            unit_tests: AtomicBool::new(false),
        })
    }

    pub fn initialized(&self) -> Vec<String> {
        let mut repos = self.initialized.lock().unwrap().clone();
        repos.sort();
        repos
    }

    pub fn fail_probe(&self, repo: &str, branch: &str) {
        self.failing_probes
            .lock()
            .unwrap()
            .insert((repo.to_string(), branch.to_string()));
    }

    pub fn set_unit_tests(&self, enabled: bool) {
        self.unit_tests.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl RepoInspector for FakeInspector {
    async fn initialize_repo(&self, repo: &str) -> Result<()> {
        self.initialized.lock().unwrap().push(repo.to_string());
        Ok(())
    }

    async fn repo_metadata(&self, repo: &str) -> Result<RepoMetadata> {
        Ok(RepoMetadata {
            name: repo.to_string(),
            owner: "phetsims".to_string(),
            has_unit_tests: self.unit_tests.load(Ordering::SeqCst),
            ..RepoMetadata::default()
        })
    }

    async fn package_info(&self, _repo: &str, _branch: &str) -> Result<PackageInfo> {
        Ok(PackageInfo::from_package_json(json!({ "version": "1.0.0" })))
    }

    async fn remote_package_info(&self, _repo: &str, branch: &str) -> Result<PackageInfo> {
        Ok(PackageInfo::from_package_json(
            json!({ "version": format!("{}.0", branch) }),
        ))
    }

    async fn probe_branch(&self, repo: &str, branch: &str) -> Result<BranchProbe> {
        let key = (repo.to_string(), branch.to_string());
        if self.failing_probes.lock().unwrap().contains(&key) {
            bail!("probe failed for {}@{}", repo, branch);
        }
        Ok(BranchProbe {
            current_branch: Some(branch.to_string()),
            sha: Some(format!("sha-{}-{}", repo, branch)),
            timestamp: Some(1_700_000_000_000),
            is_clean: true,
            ..BranchProbe::default()
        })
    }
}

// ── Remote heads ──────────────────────────────────────────────────────

pub struct FakeHeads {
    heads: HashMap<(String, String), String>,
    failing: Mutex<HashSet<String>>,
}

impl FakeHeads {
    pub fn new(heads: &[(&str, &str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            heads: heads
                .iter()
                .map(|(repo, branch, sha)| {
                    ((repo.to_string(), branch.to_string()), sha.to_string())
                })
                .collect(),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_repo(&self, repo: &str) {
        self.failing.lock().unwrap().insert(repo.to_string());
    }
}

#[async_trait]
impl RemoteHeads for FakeHeads {
    async fn remote_heads(
        &self,
        repo: &str,
        branches: &[String],
    ) -> Result<HashMap<String, String>> {
        if self.failing.lock().unwrap().contains(repo) {
            bail!("remote unavailable for {}", repo);
        }
        Ok(branches
            .iter()
            .filter_map(|branch| {
                let sha = self.heads.get(&(repo.to_string(), branch.clone()))?;
                Some((branch.clone(), sha.clone()))
            })
            .collect())
    }
}

// ── Transformer ───────────────────────────────────────────────────────

/// Prefixes sources with `transformed:` and fails on sources containing `FAIL`.
pub struct CountingTransformer {
    transforms: AtomicUsize,
    bundles: AtomicUsize,
}

impl CountingTransformer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transforms: AtomicUsize::new(0),
            bundles: AtomicUsize::new(0),
        })
    }

    pub fn transform_calls(&self) -> usize {
        self.transforms.load(Ordering::SeqCst)
    }

    pub fn bundle_calls(&self) -> usize {
        self.bundles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transformer for CountingTransformer {
    async fn transform(&self, _path: &Path, source: &str) -> Result<String> {
        self.transforms.fetch_add(1, Ordering::SeqCst);
        if source.contains("FAIL") {
            bail!("syntax error");
        }
        Ok(format!("transformed:{}", source))
    }

    async fn bundle(&self, entry: &Path) -> Result<String> {
        self.bundles.fetch_add(1, Ordering::SeqCst);
        let source = tokio::fs::read_to_string(entry).await?;
        Ok(format!("bundle:{}", source))
    }
}
