//! One-shot fleet commands: `buildyard sync` and `buildyard stale`.

use anyhow::Result;

use buildyard::config::ServerConfig;
use buildyard::services::Services;

pub async fn cmd_sync(config: &ServerConfig) -> Result<()> {
    let services = Services::from_config(config)?;
    let Some(report) = services.synchronizer.sync().await? else {
        println!("A synchronization pass is already running.");
        return Ok(());
    };

    println!(
        "Synchronized: {} added, {} removed, {} branches refreshed, {} release branches added, {} failures",
        report.added.len(),
        report.removed.len(),
        report.refreshed_branches,
        report.release_branches_added.len(),
        report.failures
    );
    for repo in &report.added {
        println!("  + {}", repo);
    }
    for repo in &report.removed {
        println!("  - {}", repo);
    }
    Ok(())
}

pub async fn cmd_stale(config: &ServerConfig) -> Result<()> {
    let services = Services::from_config(config)?;
    let stale = services.detector.find_stale(&services.store).await;

    if stale.is_empty() {
        println!("No stale branches.");
        return Ok(());
    }
    println!("{} stale branches:", stale.len());
    for branch in &stale {
        println!(
            "  {}@{}  local {}  remote {}",
            branch.repo, branch.branch, branch.local_sha, branch.remote_sha
        );
    }
    Ok(())
}
