//! File-backed repo lists and git CLI probes.
//!
//! Layout under the root directory:
//!
//! ```text
//! root/
//!   active-repos, active-runnables, ...   one repo per line, `#` comments
//!   release-branches                      `repo branch` per line
//!   joist/                                main-line checkout
//!   release-branches/gravity-1.3/gravity/ release-branch checkout
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::model::types::{BuildFlags, is_main_branch};
use crate::model::{
    ActiveRepos, BranchProbe, PackageInfo, ReleaseBranch, RepoCatalog, RepoInspector, RepoMetadata,
};

/// Directory holding the checkout of `branch` of `repo`.
pub fn checkout_dir(root: &Path, repo: &str, branch: &str) -> PathBuf {
    if is_main_branch(branch) {
        root.join(repo)
    } else {
        root.join("release-branches")
            .join(format!("{}-{}", repo, branch))
            .join(repo)
    }
}

/// Clone URL for a repo on the code host.
pub fn remote_url(owner: &str, repo: &str) -> String {
    format!("https://github.com/{}/{}.git", owner, repo)
}

/// Run git in `dir` and return trimmed stdout, failing on a non-zero exit.
pub async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed in {}: {}",
            args.join(" "),
            dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Repo lists and release branches read from plain files under the root.
pub struct FileCatalog {
    root: PathBuf,
    lists: Vec<String>,
    runnables_list: String,
    release_branches_file: String,
}

impl FileCatalog {
    pub fn new(
        root: impl Into<PathBuf>,
        lists: Vec<String>,
        runnables_list: impl Into<String>,
        release_branches_file: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            lists,
            runnables_list: runnables_list.into(),
            release_branches_file: release_branches_file.into(),
        }
    }

    /// Non-comment lines of a list file. A missing file is an empty list.
    async fn read_lines(&self, name: &str) -> Result<Vec<String>> {
        let path = self.root.join(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "list file missing, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl RepoCatalog for FileCatalog {
    async fn active_repos(&self) -> Result<ActiveRepos> {
        let mut repos = BTreeSet::new();
        for list in &self.lists {
            repos.extend(self.read_lines(list).await?);
        }
        let runnables: BTreeSet<String> = self
            .read_lines(&self.runnables_list)
            .await?
            .into_iter()
            .collect();
        repos.extend(runnables.iter().cloned());
        Ok(ActiveRepos { repos, runnables })
    }

    async fn release_branches(&self) -> Result<Vec<ReleaseBranch>> {
        let lines = self.read_lines(&self.release_branches_file).await?;
        lines
            .iter()
            .map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(repo), Some(branch), None) => Ok(ReleaseBranch {
                        repo: repo.to_string(),
                        branch: branch.to_string(),
                    }),
                    _ => bail!("Malformed release branch line '{}'", line),
                }
            })
            .collect()
    }
}

/// Probes checkouts with the git CLI and plain file reads.
pub struct GitInspector {
    root: PathBuf,
    owner: String,
}

impl GitInspector {
    pub fn new(root: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            owner: owner.into(),
        }
    }

    async fn read_package(dir: &Path) -> Result<PackageInfo> {
        let path = dir.join("package.json");
        if !path.exists() {
            return Ok(PackageInfo::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(PackageInfo::from_package_json(raw))
    }
}

#[async_trait]
impl RepoInspector for GitInspector {
    async fn initialize_repo(&self, repo: &str) -> Result<()> {
        let dir = self.root.join(repo);
        if dir.join(".git").exists() {
            return Ok(());
        }
        info!(%repo, "cloning repo");
        let target = dir.to_string_lossy().to_string();
        git(&self.root, &["clone", &remote_url(&self.owner, repo), &target]).await?;
        Ok(())
    }

    async fn repo_metadata(&self, repo: &str) -> Result<RepoMetadata> {
        let dir = self.root.join(repo);
        let package = Self::read_package(&dir).await?;
        let section = package.raw.get("buildyard");
        let flag = |key: &str| {
            section
                .and_then(|s| s.get(key))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        };
        let name = section
            .and_then(|s| s.get("title"))
            .and_then(|v| v.as_str())
            .unwrap_or(repo)
            .to_string();
        let has_unit_tests = ["ts", "js"]
            .iter()
            .any(|ext| dir.join("js").join(format!("{}-tests.{}", repo, ext)).exists());

        Ok(RepoMetadata {
            name,
            owner: self.owner.clone(),
            is_simulation: flag("simulation"),
            supports_localization: dir.join(format!("{}-strings_en.json", repo)).exists(),
            supports_docs: dir.join("doc").is_dir(),
            has_unit_tests,
        })
    }

    async fn package_info(&self, repo: &str, branch: &str) -> Result<PackageInfo> {
        Self::read_package(&checkout_dir(&self.root, repo, branch)).await
    }

    async fn remote_package_info(&self, repo: &str, branch: &str) -> Result<PackageInfo> {
        let object = format!("origin/{}:package.json", branch);
        let content = git(&self.root.join(repo), &["show", &object]).await?;
        let raw = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse package.json of {}@{}", repo, branch))?;
        Ok(PackageInfo::from_package_json(raw))
    }

    async fn probe_branch(&self, repo: &str, branch: &str) -> Result<BranchProbe> {
        let dir = checkout_dir(&self.root, repo, branch);
        if !dir.is_dir() {
            bail!("No checkout of {}@{} at {}", repo, branch, dir.display());
        }
        let current_branch = git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let sha = git(&dir, &["rev-parse", "HEAD"]).await?;
        let seconds: i64 = git(&dir, &["log", "-1", "--format=%ct"])
            .await?
            .parse()
            .context("Unexpected commit timestamp")?;
        let status = git(&dir, &["status", "--porcelain"]).await?;

        let package = Self::read_package(&dir).await?;
        let flags = BuildFlags {
            has_tsconfig: dir.join("tsconfig.json").exists(),
            has_lockfile: dir.join("package-lock.json").exists(),
            has_build_script: package
                .raw
                .pointer("/scripts/build")
                .is_some_and(|v| v.is_string()),
            uses_grunt: ["Gruntfile.js", "Gruntfile.cjs"]
                .iter()
                .any(|name| dir.join(name).exists()),
        };

        Ok(BranchProbe {
            current_branch: Some(current_branch),
            sha: Some(sha),
            timestamp: Some(seconds * 1000),
            is_clean: status.is_empty(),
            flags,
            npm_installed: dir.join("node_modules").is_dir(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checkout_dirs_follow_layout() {
        let root = Path::new("/repos");
        assert_eq!(checkout_dir(root, "joist", "main"), PathBuf::from("/repos/joist"));
        assert_eq!(
            checkout_dir(root, "gravity", "1.3"),
            PathBuf::from("/repos/release-branches/gravity-1.3/gravity")
        );
    }

    #[tokio::test]
    async fn catalog_unions_lists_and_skips_comments() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("active-repos"), "joist\n# retired\n\nscenery\n").unwrap();
        std::fs::write(dir.path().join("active-runnables"), "gravity\n").unwrap();
        let catalog = FileCatalog::new(
            dir.path(),
            vec!["active-repos".to_string(), "active-framework-repos".to_string()],
            "active-runnables",
            "release-branches",
        );

        let active = catalog.active_repos().await.unwrap();
        assert_eq!(
            active.repos.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["gravity", "joist", "scenery"]
        );
        assert!(active.runnables.contains("gravity"));
        assert!(catalog.release_branches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_branch_lines_are_parsed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("release-branches"), "gravity 1.3\nfriction 2.0\n").unwrap();
        let catalog =
            FileCatalog::new(dir.path(), Vec::new(), "active-runnables", "release-branches");

        let branches = catalog.release_branches().await.unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[1].repo, "friction");
        assert_eq!(branches[1].branch, "2.0");

        std::fs::write(dir.path().join("release-branches"), "gravity\n").unwrap();
        assert!(catalog.release_branches().await.is_err());
    }

    #[tokio::test]
    async fn metadata_reads_package_section_and_files() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("gravity");
        std::fs::create_dir_all(repo.join("js")).unwrap();
        std::fs::create_dir_all(repo.join("doc")).unwrap();
        std::fs::write(
            repo.join("package.json"),
            r#"{"version":"1.0.0","buildyard":{"title":"Gravity","simulation":true}}"#,
        )
        .unwrap();
        std::fs::write(repo.join("js/gravity-tests.ts"), "").unwrap();

        let inspector = GitInspector::new(dir.path(), "phetsims");
        let metadata = inspector.repo_metadata("gravity").await.unwrap();
        assert_eq!(metadata.name, "Gravity");
        assert_eq!(metadata.owner, "phetsims");
        assert!(metadata.is_simulation);
        assert!(metadata.supports_docs);
        assert!(metadata.has_unit_tests);
        assert!(!metadata.supports_localization);

        let package = inspector.package_info("gravity", "main").await.unwrap();
        assert_eq!(package.version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn probing_a_missing_checkout_fails() {
        let dir = TempDir::new().unwrap();
        let inspector = GitInspector::new(dir.path(), "phetsims");
        assert!(inspector.probe_branch("gravity", "1.3").await.is_err());
    }
}
