use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::channel::{JobChannel, JobState, Subscription};
use super::{JobKind, JobRunner, OutputSink};
use crate::errors::{JobError, ModelError};
use crate::model::{BranchRecord, Model, ModelStore};

/// Identity of a job slot: at most one job runs per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobKey {
    pub repo: String,
    pub branch: String,
    pub kind: JobKind,
}

/// Result of [`JobManager::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub id: u64,
    /// The request joined a job that was already running for the key
    pub coalesced: bool,
}

struct Job {
    id: u64,
    key: JobKey,
    channel: Arc<JobChannel>,
    /// Dependency commits at submission time, recorded on a successful build
    dependency_shas: BTreeMap<String, String>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_id: HashMap<u64, Arc<Job>>,
    by_key: HashMap<JobKey, u64>,
}

/// Runs build and update-checkout jobs, one per (repo, branch, kind).
///
/// Jobs are keyed twice: by id for observers, and by key to coalesce duplicate
/// triggers. A finished job leaves the key map immediately, so a new job may
/// be submitted, but stays attachable by id for the retention period.
pub struct JobManager {
    registry: Mutex<Registry>,
    store: Arc<ModelStore>,
    runner: Arc<dyn JobRunner>,
    retention: Duration,
}

impl JobManager {
    pub fn new(
        store: Arc<ModelStore>,
        runner: Arc<dyn JobRunner>,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            store,
            runner,
            retention,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a job for the key, or return the one already running.
    ///
    /// Never waits for the job: the operation runs on its own task.
    pub fn submit(
        self: &Arc<Self>,
        repo: &str,
        branch: &str,
        kind: JobKind,
    ) -> Result<Submission, JobError> {
        let key = JobKey {
            repo: repo.to_string(),
            branch: branch.to_string(),
            kind,
        };

        let job = {
            let mut registry = self.lock();
            if let Some(&id) = registry.by_key.get(&key) {
                debug!(job_id = id, repo, branch, %kind, "coalesced duplicate job request");
                return Ok(Submission {
                    id,
                    coalesced: true,
                });
            }

            let id = registry.next_id + 1;
            let dependency_shas = self.store.write(|model| mark_started(model, &key, id))?;
            registry.next_id = id;

            let channel = if kind.retains_output() {
                JobChannel::buffered()
            } else {
                JobChannel::unbuffered()
            };
            let job = Arc::new(Job {
                id,
                key: key.clone(),
                channel,
                dependency_shas,
            });
            registry.by_id.insert(id, Arc::clone(&job));
            registry.by_key.insert(key, id);
            job
        };

        info!(job_id = job.id, repo, branch, %kind, "job submitted");
        let id = job.id;
        tokio::spawn(Arc::clone(self).run(job));
        Ok(Submission {
            id,
            coalesced: false,
        })
    }

    /// Subscribe to a job's events. A job that already finished replays its
    /// output and result immediately.
    pub fn attach(&self, id: u64, kind: JobKind) -> Result<Subscription, JobError> {
        let job = self.job(id, kind)?;
        Ok(job.channel.subscribe())
    }

    pub fn state(&self, id: u64) -> Option<JobState> {
        self.lock().by_id.get(&id).map(|job| job.channel.state())
    }

    /// Buffered output of a build job.
    pub fn output(&self, id: u64) -> Option<String> {
        self.lock().by_id.get(&id).and_then(|job| job.channel.output())
    }

    /// Jobs still running, ordered by id.
    pub fn running(&self) -> Vec<(u64, JobKey)> {
        let registry = self.lock();
        let mut running: Vec<(u64, JobKey)> = registry
            .by_key
            .iter()
            .map(|(key, id)| (*id, key.clone()))
            .collect();
        running.sort_by_key(|(id, _)| *id);
        running
    }

    fn job(&self, id: u64, kind: JobKind) -> Result<Arc<Job>, JobError> {
        self.lock()
            .by_id
            .get(&id)
            .filter(|job| job.key.kind == kind)
            .cloned()
            .ok_or(JobError::JobNotFound { id })
    }

    async fn run(self: Arc<Self>, job: Arc<Job>) {
        self.store.persist_or_log().await;

        let JobKey { repo, branch, kind } = &job.key;
        let operation = async {
            match kind {
                JobKind::Build => {
                    let sink = OutputSink::new(Arc::clone(&job.channel));
                    self.runner.build(repo, branch, sink).await
                }
                JobKind::UpdateCheckout => self.runner.update_checkout(repo, branch).await,
            }
        };

        let result = match AssertUnwindSafe(operation).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("job panicked: {}", panic_message(&*panic))),
        };

        self.finish(&job, result).await;
    }

    async fn finish(self: &Arc<Self>, job: &Job, result: anyhow::Result<()>) {
        let JobKey { repo, branch, kind } = &job.key;
        let success = result.is_ok();
        match &result {
            Ok(()) => info!(job_id = job.id, %repo, %branch, %kind, "job succeeded"),
            Err(e) => {
                warn!(
                    job_id = job.id,
                    %repo,
                    %branch,
                    %kind,
                    error = %format!("{:#}", e),
                    "job failed"
                );
                if kind.retains_output() {
                    job.channel.publish(format!("Error: {:#}\n", e));
                }
            }
        }

        // The key and the record are released in one registry critical
        // section, so no new submission can claim the record in between. Both
        // happen before observers hear about completion, so anyone reacting to
        // the event sees a null job id.
        {
            let mut registry = self.lock();
            if registry.by_key.get(&job.key) == Some(&job.id) {
                registry.by_key.remove(&job.key);
            }
            let now = Utc::now();
            if let Err(e) = self
                .store
                .update_branch(repo, branch, |record| record_outcome(record, job, success, now))
            {
                warn!(job_id = job.id, error = %e, "record disappeared while job was running");
            }
        }

        job.channel.close(success);
        self.store.persist_or_log().await;
        self.schedule_eviction(job.id);
    }

    fn schedule_eviction(self: &Arc<Self>, id: u64) {
        let manager = Arc::downgrade(self);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(manager) = manager.upgrade() {
                manager.lock().by_id.remove(&id);
                debug!(job_id = id, "evicted finished job");
            }
        });
    }
}

/// Claim the record's job-id field. Returns the dependency commits to record
/// if the job succeeds.
fn mark_started(
    model: &mut Model,
    key: &JobKey,
    id: u64,
) -> Result<BTreeMap<String, String>, ModelError> {
    let not_found = |model: &Model| {
        if model.repos.contains_key(&key.repo) {
            ModelError::BranchNotFound {
                repo: key.repo.clone(),
                branch: key.branch.clone(),
            }
        } else {
            ModelError::RepoNotFound {
                repo: key.repo.clone(),
            }
        }
    };

    let shas = match model.branch(&key.repo, &key.branch) {
        Some(record) => model.dependency_shas(record),
        None => return Err(not_found(model)),
    };
    if let Some(record) = model.branch_mut(&key.repo, &key.branch) {
        match key.kind {
            JobKind::Build => record.build_job_id = Some(id),
            JobKind::UpdateCheckout => record.update_job_id = Some(id),
        }
    }
    Ok(shas)
}

fn record_outcome(record: &mut BranchRecord, job: &Job, success: bool, now: DateTime<Utc>) {
    match job.key.kind {
        JobKind::Build => {
            if record.build_job_id != Some(job.id) {
                return;
            }
            record.build_job_id = None;
            if success {
                record.last_build_time = Some(now);
                record.last_build_shas = job.dependency_shas.clone();
            }
        }
        JobKind::UpdateCheckout => {
            if record.update_job_id != Some(job.id) {
                return;
            }
            record.update_job_id = None;
            if success {
                record.last_update_time = Some(now);
                record.is_checked_out = true;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobEvent;
    use crate::testing::{FakeRunner, collect_events, sample_store};

    const RETAIN: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn duplicate_submissions_coalesce_into_one_job() {
        let store = sample_store();
        let runner = FakeRunner::gated();
        let manager = JobManager::new(Arc::clone(&store), runner.clone(), RETAIN);

        let first = manager.submit("joist", "main", JobKind::Build).unwrap();
        let second = manager.submit("joist", "main", JobKind::Build).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!first.coalesced);
        assert!(second.coalesced);
        assert_eq!(
            store.branch("joist", "main").unwrap().build_job_id,
            Some(first.id)
        );

        runner.release();
        let events = collect_events(&manager, first.id, JobKind::Build).await;
        assert_eq!(events.last(), Some(&JobEvent::Completed { success: true }));
        assert_eq!(runner.build_calls(), 1);
    }

    #[tokio::test]
    async fn completion_resets_job_id_and_allows_a_new_job() {
        let store = sample_store();
        let runner = FakeRunner::immediate();
        let manager = JobManager::new(Arc::clone(&store), runner.clone(), RETAIN);

        let first = manager.submit("joist", "main", JobKind::Build).unwrap();
        collect_events(&manager, first.id, JobKind::Build).await;

        let record = store.branch("joist", "main").unwrap();
        assert!(record.build_job_id.is_none());
        assert!(record.last_build_time.is_some());
        assert!(manager.running().is_empty());

        let second = manager.submit("joist", "main", JobKind::Build).unwrap();
        assert!(second.id > first.id);
        assert!(!second.coalesced);
        collect_events(&manager, second.id, JobKind::Build).await;
        assert_eq!(runner.build_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resubmission_never_sees_an_unrecorded_success() {
        for _ in 0..50 {
            let store = sample_store();
            let runner = FakeRunner::gated();
            let manager = JobManager::new(Arc::clone(&store), runner.clone(), RETAIN);

            let first = manager.submit("joist", "main", JobKind::Build).unwrap();
            runner.release();
            let second = loop {
                let next = manager.submit("joist", "main", JobKind::Build).unwrap();
                if !next.coalesced {
                    break next;
                }
                tokio::task::yield_now().await;
            };

            assert!(second.id > first.id);
            let record = store.branch("joist", "main").unwrap();
            assert!(record.last_build_time.is_some());
            assert_eq!(record.build_job_id, Some(second.id));
        }
    }

    #[tokio::test]
    async fn failed_build_reports_error_line_and_clears_job_id() {
        let store = sample_store();
        let runner = FakeRunner::failing();
        let manager = JobManager::new(Arc::clone(&store), runner, RETAIN);

        let job = manager.submit("joist", "main", JobKind::Build).unwrap();
        let events = collect_events(&manager, job.id, JobKind::Build).await;

        assert_eq!(events.last(), Some(&JobEvent::Completed { success: false }));
        let output: String = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Output { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(output.contains("building joist@main"));
        assert!(output.contains("Error: build exploded"));

        let record = store.branch("joist", "main").unwrap();
        assert!(record.build_job_id.is_none());
        assert!(record.last_build_time.is_none());
        assert_eq!(manager.state(job.id), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn late_attach_replays_output_then_completion() {
        let store = sample_store();
        let manager = JobManager::new(store, FakeRunner::immediate(), RETAIN);

        let job = manager.submit("joist", "main", JobKind::Build).unwrap();
        collect_events(&manager, job.id, JobKind::Build).await;

        let mut late = manager.attach(job.id, JobKind::Build).unwrap();
        assert_eq!(
            late.try_recv(),
            Some(JobEvent::Output {
                text: "building joist@main\nfinished\n".to_string()
            })
        );
        assert_eq!(late.try_recv(), Some(JobEvent::Completed { success: true }));
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn successful_build_records_dependency_shas() {
        let store = sample_store();
        let manager = JobManager::new(Arc::clone(&store), FakeRunner::immediate(), RETAIN);

        let job = manager.submit("gravity", "1.3", JobKind::Build).unwrap();
        collect_events(&manager, job.id, JobKind::Build).await;

        let record = store.branch("gravity", "1.3").unwrap();
        assert_eq!(
            record.last_build_shas.get("joist").map(String::as_str),
            Some("1111111")
        );
    }

    #[tokio::test]
    async fn update_job_only_delivers_completion() {
        let store = sample_store();
        let runner = FakeRunner::immediate();
        let manager = JobManager::new(Arc::clone(&store), runner.clone(), RETAIN);

        let job = manager
            .submit("gravity", "1.3", JobKind::UpdateCheckout)
            .unwrap();
        let events = collect_events(&manager, job.id, JobKind::UpdateCheckout).await;
        assert_eq!(events, vec![JobEvent::Completed { success: true }]);

        let record = store.branch("gravity", "1.3").unwrap();
        assert!(record.update_job_id.is_none());
        assert!(record.last_update_time.is_some());
        assert!(record.is_checked_out);
        assert_eq!(runner.update_calls(), 1);
    }

    #[tokio::test]
    async fn build_and_update_for_one_branch_are_separate_keys() {
        let store = sample_store();
        let runner = FakeRunner::gated();
        let manager = JobManager::new(Arc::clone(&store), runner.clone(), RETAIN);

        let build = manager.submit("gravity", "1.3", JobKind::Build).unwrap();
        let update = manager
            .submit("gravity", "1.3", JobKind::UpdateCheckout)
            .unwrap();
        assert_ne!(build.id, update.id);
        assert_eq!(manager.running().len(), 2);

        // Attaching with the wrong kind is treated as an unknown job.
        assert!(matches!(
            manager.attach(update.id, JobKind::Build),
            Err(JobError::JobNotFound { .. })
        ));

        runner.release();
        runner.release();
        collect_events(&manager, build.id, JobKind::Build).await;
        collect_events(&manager, update.id, JobKind::UpdateCheckout).await;
    }

    #[tokio::test]
    async fn unknown_keys_and_ids_are_not_found() {
        let manager = JobManager::new(sample_store(), FakeRunner::immediate(), RETAIN);

        assert!(matches!(
            manager.submit("nope", "main", JobKind::Build),
            Err(JobError::Model(ModelError::RepoNotFound { .. }))
        ));
        assert!(matches!(
            manager.submit("joist", "9.9", JobKind::Build),
            Err(JobError::Model(ModelError::BranchNotFound { .. }))
        ));
        assert!(matches!(
            manager.attach(42, JobKind::Build),
            Err(JobError::JobNotFound { id: 42 })
        ));

        // A rejected submission does not consume an id.
        let job = manager.submit("joist", "main", JobKind::Build).unwrap();
        assert_eq!(job.id, 1);
    }

    #[tokio::test]
    async fn panicking_runner_becomes_a_failed_job() {
        let store = sample_store();
        let manager = JobManager::new(Arc::clone(&store), FakeRunner::panicking(), RETAIN);

        let job = manager.submit("joist", "main", JobKind::Build).unwrap();
        let events = collect_events(&manager, job.id, JobKind::Build).await;
        assert_eq!(events.last(), Some(&JobEvent::Completed { success: false }));
        assert!(store.branch("joist", "main").unwrap().build_job_id.is_none());
    }

    #[tokio::test]
    async fn finished_jobs_are_evicted_after_retention() {
        let manager = JobManager::new(
            sample_store(),
            FakeRunner::immediate(),
            Duration::from_millis(10),
        );
        let job = manager.submit("joist", "main", JobKind::Build).unwrap();
        collect_events(&manager, job.id, JobKind::Build).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.state(job.id).is_none());
        assert!(matches!(
            manager.attach(job.id, JobKind::Build),
            Err(JobError::JobNotFound { .. })
        ));
    }
}
