//! Build and update-checkout operations backed by child processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::git::{checkout_dir, git, remote_url};
use crate::jobs::{JobRunner, OutputSink};

pub struct CommandRunner {
    root: PathBuf,
    owner: String,
    build_command: Vec<String>,
    install_command: Vec<String>,
    /// Package installs share one slot process-wide
    install_limiter: Arc<Semaphore>,
}

impl CommandRunner {
    pub fn new(
        root: impl Into<PathBuf>,
        owner: impl Into<String>,
        build_command: Vec<String>,
        install_command: Vec<String>,
    ) -> Self {
        Self {
            root: root.into(),
            owner: owner.into(),
            build_command,
            install_command,
            install_limiter: Arc::new(Semaphore::new(1)),
        }
    }

    async fn install(&self, dir: &Path, output: Option<&OutputSink>) -> Result<()> {
        if self.install_command.is_empty() || !dir.join("package.json").exists() {
            return Ok(());
        }
        let _permit = self.install_limiter.acquire().await?;
        debug!(dir = %dir.display(), "installing packages");
        if let Some(output) = output {
            output.line(&format!("> {}", self.install_command.join(" ")));
        }
        run_streaming(dir, &self.install_command, output).await
    }
}

/// Run `command` in `dir`, forwarding each stdout and stderr line to
/// `output` as it is produced.
async fn run_streaming(dir: &Path, command: &[String], output: Option<&OutputSink>) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("Empty command");
    };
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", command.join(" ")))?;

    let stdout = child
        .stdout
        .take()
        .context("Failed to capture stdout from child process")?;
    let stderr = child
        .stderr
        .take()
        .context("Failed to capture stderr from child process")?;

    tokio::try_join!(forward_lines(stdout, output), forward_lines(stderr, output))?;

    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for {}", command.join(" ")))?;
    if !status.success() {
        bail!("{} exited with {}", command.join(" "), status);
    }
    Ok(())
}

async fn forward_lines(stream: impl AsyncRead + Unpin, output: Option<&OutputSink>) -> Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read child output line")?
    {
        if let Some(output) = output {
            output.line(&line);
        }
    }
    Ok(())
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn build(&self, repo: &str, branch: &str, output: OutputSink) -> Result<()> {
        let dir = checkout_dir(&self.root, repo, branch);
        if !dir.is_dir() {
            bail!("{}@{} is not checked out", repo, branch);
        }
        info!(%repo, %branch, "building");
        self.install(&dir, Some(&output)).await?;
        output.line(&format!("> {}", self.build_command.join(" ")));
        run_streaming(&dir, &self.build_command, Some(&output)).await
    }

    async fn update_checkout(&self, repo: &str, branch: &str) -> Result<()> {
        let dir = checkout_dir(&self.root, repo, branch);
        if dir.join(".git").exists() {
            git(&dir, &["fetch", "origin"]).await?;
            git(&dir, &["checkout", branch]).await?;
            git(&dir, &["pull", "--ff-only"]).await?;
        } else {
            let parent = dir.parent().unwrap_or(&self.root).to_path_buf();
            tokio::fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
            let target = dir.to_string_lossy().to_string();
            git(
                &parent,
                &["clone", "--branch", branch, &remote_url(&self.owner, repo), &target],
            )
            .await?;
        }
        info!(%repo, %branch, "checkout updated");
        self.install(&dir, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobChannel;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn child_output_lines_are_streamed() {
        let dir = TempDir::new().unwrap();
        let channel = JobChannel::buffered();
        let sink = OutputSink::new(channel.clone());

        run_streaming(dir.path(), &sh("echo one; echo two"), Some(&sink))
            .await
            .unwrap();
        assert_eq!(channel.output().as_deref(), Some("one\ntwo\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = TempDir::new().unwrap();
        let channel = JobChannel::buffered();
        let sink = OutputSink::new(channel.clone());

        let err = run_streaming(dir.path(), &sh("echo oops >&2; exit 3"), Some(&sink))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
        assert_eq!(channel.output().as_deref(), Some("oops\n"));
    }

    #[tokio::test]
    async fn building_a_missing_checkout_fails() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(dir.path(), "phetsims", sh("true"), Vec::new());
        let sink = OutputSink::new(JobChannel::buffered());
        assert!(runner.build("joist", "main", sink).await.is_err());
    }

    #[tokio::test]
    async fn build_runs_the_configured_command_in_the_checkout() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("joist")).unwrap();
        let runner = CommandRunner::new(dir.path(), "phetsims", sh("echo built; pwd"), Vec::new());
        let channel = JobChannel::buffered();

        runner
            .build("joist", "main", OutputSink::new(channel.clone()))
            .await
            .unwrap();
        let output = channel.output().unwrap();
        assert!(output.contains("built\n"));
        assert!(output.contains("joist"));
    }
}
