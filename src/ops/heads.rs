//! Remote branch head backends for the staleness detector.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::git::{git, remote_url};
use crate::model::RemoteHeads;

const GITHUB_API_URL: &str = "https://api.github.com";

/// One `git ls-remote --heads` per repo.
pub struct LsRemoteHeads {
    root: PathBuf,
    owner: String,
}

impl LsRemoteHeads {
    pub fn new(root: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            owner: owner.into(),
        }
    }
}

/// Parse `<sha>\trefs/heads/<name>` lines.
fn parse_ls_remote(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (sha, reference) = line.split_once('\t')?;
            let branch = reference.trim().strip_prefix("refs/heads/")?;
            Some((branch.to_string(), sha.trim().to_string()))
        })
        .collect()
}

#[async_trait]
impl RemoteHeads for LsRemoteHeads {
    async fn remote_heads(
        &self,
        repo: &str,
        branches: &[String],
    ) -> Result<HashMap<String, String>> {
        let url = remote_url(&self.owner, repo);
        let output = git(&self.root, &["ls-remote", "--heads", &url]).await?;
        let mut heads = parse_ls_remote(&output);
        heads.retain(|branch, _| branches.contains(branch));
        Ok(heads)
    }
}

#[derive(Deserialize)]
struct GitHubBranch {
    commit: GitHubCommit,
}

#[derive(Deserialize)]
struct GitHubCommit {
    sha: String,
}

/// One code-host API call per branch, at most `concurrency` in flight.
pub struct GithubHeads {
    client: reqwest::Client,
    owner: String,
    token: String,
    limiter: Semaphore,
}

impl GithubHeads {
    pub fn new(owner: impl Into<String>, token: impl Into<String>, concurrency: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            owner: owner.into(),
            token: token.into(),
            limiter: Semaphore::new(concurrency.max(1)),
        }
    }

    async fn branch_head(&self, repo: &str, branch: &str) -> Result<Option<String>> {
        let _permit = self.limiter.acquire().await?;
        let url = format!(
            "{}/repos/{}/{}/branches/{}",
            GITHUB_API_URL, self.owner, repo, branch
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "buildyard")
            .send()
            .await
            .with_context(|| format!("Failed to query GitHub for {}@{}", repo, branch))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(%repo, %branch, "branch not found on GitHub");
            return Ok(None);
        }
        let branch_info = resp
            .error_for_status()
            .context("GitHub branches endpoint returned error status")?
            .json::<GitHubBranch>()
            .await
            .context("Failed to parse GitHub branch response")?;
        Ok(Some(branch_info.commit.sha))
    }
}

#[async_trait]
impl RemoteHeads for GithubHeads {
    async fn remote_heads(
        &self,
        repo: &str,
        branches: &[String],
    ) -> Result<HashMap<String, String>> {
        let lookups = branches
            .iter()
            .map(|branch| async move { (branch, self.branch_head(repo, branch).await) });

        let mut heads = HashMap::new();
        for (branch, result) in join_all(lookups).await {
            match result {
                Ok(Some(sha)) => {
                    heads.insert(branch.clone(), sha);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%repo, %branch, error = %format!("{:#}", e), "failed to read remote head")
                }
            }
        }
        Ok(heads)
    }
}
