//! Build and update-checkout job orchestration.
//!
//! ```text
//!  POST /api/build/..  ──> JobManager::submit ──> tokio task ──> JobRunner::build
//!                              │ (coalesce per key)                 │ OutputSink::write
//!                              v                                    v
//!                         ModelStore job-id field              JobChannel ──> SSE subscribers
//! ```

pub mod channel;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use channel::{JobChannel, JobEvent, JobState, Subscription};
pub use manager::{JobKey, JobManager, Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Build,
    UpdateCheckout,
}

impl JobKind {
    /// Whether jobs of this kind keep an output log for replay.
    pub fn retains_output(self) -> bool {
        matches!(self, JobKind::Build)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Build => write!(f, "build"),
            JobKind::UpdateCheckout => write!(f, "update-checkout"),
        }
    }
}

/// Where a running job writes its output.
#[derive(Clone)]
pub struct OutputSink {
    channel: Arc<JobChannel>,
}

impl OutputSink {
    pub fn new(channel: Arc<JobChannel>) -> Self {
        Self { channel }
    }

    pub fn write(&self, text: impl Into<String>) {
        self.channel.publish(text);
    }

    pub fn line(&self, line: &str) {
        self.channel.publish(format!("{}\n", line));
    }
}

/// The external operations jobs execute. Either succeeds or fails; the
/// manager turns both outcomes into a completion event.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn build(&self, repo: &str, branch: &str, output: OutputSink) -> anyhow::Result<()>;

    async fn update_checkout(&self, repo: &str, branch: &str) -> anyhow::Result<()>;
}
