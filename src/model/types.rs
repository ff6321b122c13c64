use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Branch names treated as a repo's main line.
pub const MAIN_BRANCHES: &[&str] = &["main", "master"];

/// Default branch seeded for a newly observed repo.
pub const DEFAULT_BRANCH: &str = "main";

pub fn is_main_branch(branch: &str) -> bool {
    MAIN_BRANCHES.contains(&branch)
}

/// Build-pathway quirks detected from a checkout's files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildFlags {
    /// `tsconfig.json` present, sources need transpiling
    pub has_tsconfig: bool,
    /// `package-lock.json` present, installs are reproducible
    pub has_lockfile: bool,
    /// `package.json` declares a `build` script
    pub has_build_script: bool,
    /// A Gruntfile drives the build instead of npm scripts
    pub uses_grunt: bool,
}

/// Fields read from a branch's `package.json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageInfo {
    pub version: Option<String>,
    pub brands: BTreeSet<String>,
    pub dependencies: Vec<String>,
    pub raw: serde_json::Value,
}

impl PackageInfo {
    /// Extract the fields buildyard cares about. Fleet-specific settings live
    /// under a top-level `buildyard` object:
    ///
    /// ```json
    /// { "version": "1.2.0",
    ///   "buildyard": { "supportedBrands": ["adapted"], "dependencies": ["joist"] } }
    /// ```
    pub fn from_package_json(raw: serde_json::Value) -> Self {
        let version = raw
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let section = raw.get("buildyard");
        let strings = |key: &str| -> Vec<String> {
            section
                .and_then(|s| s.get(key))
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let brands = strings("supportedBrands").into_iter().collect();
        let dependencies = strings("dependencies");
        Self {
            version,
            brands,
            dependencies,
            raw,
        }
    }
}

/// Git state of a checked-out branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchProbe {
    pub current_branch: Option<String>,
    pub sha: Option<String>,
    /// Commit time in milliseconds since the epoch
    pub timestamp: Option<i64>,
    pub is_clean: bool,
    pub flags: BuildFlags,
    pub npm_installed: bool,
}

/// Checkout, build and update state of one (repo, branch).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchRecord {
    pub repo: String,
    pub branch: String,
    pub version: Option<String>,
    pub package_json: serde_json::Value,
    pub brands: BTreeSet<String>,
    pub is_release: bool,
    pub dependency_repos: Vec<String>,
    pub is_checked_out: bool,
    pub current_branch: Option<String>,
    pub sha: Option<String>,
    pub timestamp: Option<i64>,
    pub is_clean: bool,
    #[serde(flatten)]
    pub flags: BuildFlags,
    /// Set while a build job owns this record
    #[serde(rename = "buildJobID")]
    pub build_job_id: Option<u64>,
    pub last_build_time: Option<DateTime<Utc>>,
    /// Dependency repo -> commit captured when the last successful build was submitted
    pub last_build_shas: BTreeMap<String, String>,
    /// Set while an update-checkout job owns this record
    #[serde(rename = "updateCheckoutJobID")]
    pub update_job_id: Option<u64>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub npm_installed: bool,
}

impl BranchRecord {
    pub fn new(repo: &str, branch: &str) -> Self {
        Self {
            repo: repo.to_string(),
            branch: branch.to_string(),
            is_release: !is_main_branch(branch),
            ..Self::default()
        }
    }

    pub fn apply_package(&mut self, package: PackageInfo) {
        self.version = package.version;
        self.brands = package.brands;
        self.dependency_repos = package.dependencies;
        self.package_json = package.raw;
    }

    pub fn apply_probe(&mut self, probe: BranchProbe) {
        self.current_branch = probe.current_branch;
        self.sha = probe.sha;
        self.timestamp = probe.timestamp;
        self.is_clean = probe.is_clean;
        self.flags = probe.flags;
        self.npm_installed = probe.npm_installed;
    }
}

/// Repo-level flags refreshed on every synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoMetadata {
    pub name: String,
    pub owner: String,
    pub is_simulation: bool,
    pub supports_localization: bool,
    pub supports_docs: bool,
    pub has_unit_tests: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepoRecord {
    pub name: String,
    pub owner: String,
    pub is_simulation: bool,
    pub is_runnable: bool,
    pub supports_localization: bool,
    pub supports_docs: bool,
    pub has_unit_tests: bool,
    pub branches: BTreeMap<String, BranchRecord>,
}

impl RepoRecord {
    /// Overwrite repo-level fields, leaving branch records untouched.
    pub fn apply_metadata(&mut self, metadata: RepoMetadata, is_runnable: bool) {
        self.name = metadata.name;
        self.owner = metadata.owner;
        self.is_simulation = metadata.is_simulation;
        self.is_runnable = is_runnable;
        self.supports_localization = metadata.supports_localization;
        self.supports_docs = metadata.supports_docs;
        self.has_unit_tests = metadata.has_unit_tests;
    }
}

/// The whole tracked fleet, keyed by repo id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    pub repos: BTreeMap<String, RepoRecord>,
}

impl Model {
    pub fn branch(&self, repo: &str, branch: &str) -> Option<&BranchRecord> {
        self.repos.get(repo)?.branches.get(branch)
    }

    pub fn branch_mut(&mut self, repo: &str, branch: &str) -> Option<&mut BranchRecord> {
        self.repos.get_mut(repo)?.branches.get_mut(branch)
    }

    /// Null out every job id. Returns how many fields were reset.
    pub fn reset_job_ids(&mut self) -> usize {
        let mut reset = 0;
        for record in self.repos.values_mut().flat_map(|r| r.branches.values_mut()) {
            if record.build_job_id.take().is_some() {
                reset += 1;
            }
            if record.update_job_id.take().is_some() {
                reset += 1;
            }
        }
        reset
    }

    /// Commit of each dependency's main line, for dependencies that have one.
    pub fn dependency_shas(&self, record: &BranchRecord) -> BTreeMap<String, String> {
        record
            .dependency_repos
            .iter()
            .filter_map(|dep| {
                let main = self.main_branch(dep)?;
                Some((dep.clone(), main.sha.clone()?))
            })
            .collect()
    }

    pub fn dependency_timestamps(&self, record: &BranchRecord) -> BTreeMap<String, i64> {
        record
            .dependency_repos
            .iter()
            .filter_map(|dep| {
                let main = self.main_branch(dep)?;
                Some((dep.clone(), main.timestamp?))
            })
            .collect()
    }

    fn main_branch(&self, repo: &str) -> Option<&BranchRecord> {
        let record = self.repos.get(repo)?;
        MAIN_BRANCHES
            .iter()
            .find_map(|name| record.branches.get(*name))
    }
}
