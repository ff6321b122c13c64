//! Advisory detection of checked-out branches that lag their remote.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use super::store::ModelStore;

/// Source of remote branch head commits.
#[async_trait]
pub trait RemoteHeads: Send + Sync {
    /// Remote head commit for each of `branches` in `repo`. Branches the
    /// remote does not know are left out of the map.
    async fn remote_heads(
        &self,
        repo: &str,
        branches: &[String],
    ) -> Result<HashMap<String, String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleBranch {
    pub repo: String,
    pub branch: String,
    pub local_sha: String,
    pub remote_sha: String,
}

pub struct StalenessDetector {
    heads: Arc<dyn RemoteHeads>,
}

impl StalenessDetector {
    pub fn new(heads: Arc<dyn RemoteHeads>) -> Self {
        Self { heads }
    }

    /// Every checked-out branch whose recorded commit differs from the
    /// remote head. A branch with either commit unknown is never stale, and
    /// a repo whose remote lookup fails is skipped.
    pub async fn find_stale(&self, store: &ModelStore) -> Vec<StaleBranch> {
        let local: BTreeMap<String, BTreeMap<String, String>> = store.read(|model| {
            model
                .repos
                .iter()
                .map(|(repo, record)| {
                    let branches = record
                        .branches
                        .values()
                        .filter(|b| b.is_checked_out)
                        .filter_map(|b| Some((b.branch.clone(), b.sha.clone()?)))
                        .collect::<BTreeMap<_, _>>();
                    (repo.clone(), branches)
                })
                .filter(|(_, branches)| !branches.is_empty())
                .collect()
        });

        let lookups = local.iter().map(|(repo, branches)| async move {
            let names: Vec<String> = branches.keys().cloned().collect();
            (repo, branches, self.heads.remote_heads(repo, &names).await)
        });

        let mut stale = Vec::new();
        for (repo, branches, result) in join_all(lookups).await {
            let remote = match result {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(%repo, error = %format!("{:#}", e), "failed to read remote heads");
                    continue;
                }
            };
            for (branch, local_sha) in branches {
                match remote.get(branch) {
                    Some(remote_sha) if remote_sha != local_sha => stale.push(StaleBranch {
                        repo: repo.clone(),
                        branch: branch.clone(),
                        local_sha: local_sha.clone(),
                        remote_sha: remote_sha.clone(),
                    }),
                    Some(_) => {}
                    None => debug!(%repo, %branch, "no remote head for branch"),
                }
            }
        }
        stale.sort();
        stale
    }
}
