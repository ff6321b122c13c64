use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::{error, info, warn};

use super::sse;
use crate::assets::AssetCache;
use crate::errors::{AssetError, JobError, ModelError};
use crate::jobs::{JobKind, JobManager};
use crate::model::{BranchRecord, ModelStore, StaleBranch, StalenessDetector, Synchronizer};
use crate::services::Services;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<ModelStore>,
    pub jobs: Arc<JobManager>,
    pub assets: Arc<AssetCache>,
    pub synchronizer: Arc<Synchronizer>,
    pub detector: Arc<StalenessDetector>,
    /// Result of the most recent staleness poll
    pub stale: RwLock<Vec<StaleBranch>>,
    pub heartbeat: Duration,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(services: Services, heartbeat: Duration) -> SharedState {
        Arc::new(Self {
            store: services.store,
            jobs: services.jobs,
            assets: services.assets,
            synchronizer: services.synchronizer,
            detector: services.detector,
            stale: RwLock::new(Vec::new()),
            heartbeat,
        })
    }

    /// Run the staleness detector and publish its result.
    pub async fn refresh_stale(&self) -> usize {
        let stale = self.detector.find_stale(&self.store).await;
        let count = stale.len();
        *self.stale.write().unwrap_or_else(PoisonError::into_inner) = stale;
        count
    }

    pub fn stale_branches(&self) -> Vec<StaleBranch> {
        self.stale
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub is_simulation: bool,
    pub is_runnable: bool,
    pub supports_localization: bool,
    pub supports_docs: bool,
    pub has_unit_tests: bool,
    pub branches: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    #[serde(flatten)]
    pub record: BranchRecord,
    pub dependency_shas: BTreeMap<String, String>,
    pub dependency_timestamps: BTreeMap<String, i64>,
}

#[derive(Serialize)]
pub struct BuildStarted {
    #[serde(rename = "buildJobID")]
    pub build_job_id: u64,
}

#[derive(Serialize)]
pub struct UpdateStarted {
    #[serde(rename = "updateCheckoutJobID")]
    pub update_job_id: u64,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, message).into_response()
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::RepoNotFound { .. } | ModelError::BranchNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::JobNotFound { .. } => ApiError::NotFound(e.to_string()),
            JobError::Model(model) => model.into(),
        }
    }
}

impl From<AssetError> for ApiError {
    fn from(e: AssetError) -> Self {
        match e {
            AssetError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            AssetError::InvalidPath { .. } => ApiError::BadRequest(e.to_string()),
            AssetError::Io { .. } | AssetError::TransformFailed { .. } => {
                error!(error = %e, "asset resolution failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/repo-list", get(repo_list))
        .route("/api/branch-info/{repo}/{branch}", get(branch_info))
        .route("/api/build/{repo}/{branch}", post(start_build))
        .route("/api/build-events/{id}", get(sse::build_events))
        .route("/api/update/{repo}/{branch}", post(start_update))
        .route("/api/update-events/{id}", get(sse::update_events))
        .route("/api/stale-branches", get(stale_branches))
        .route("/api/sync", post(trigger_sync))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn repo_list(State(state): State<SharedState>) -> Json<Vec<RepoSummary>> {
    let repos = state.store.read(|model| {
        model
            .repos
            .iter()
            .map(|(id, repo)| RepoSummary {
                id: id.clone(),
                name: repo.name.clone(),
                owner: repo.owner.clone(),
                is_simulation: repo.is_simulation,
                is_runnable: repo.is_runnable,
                supports_localization: repo.supports_localization,
                supports_docs: repo.supports_docs,
                has_unit_tests: repo.has_unit_tests,
                branches: repo.branches.keys().cloned().collect(),
            })
            .collect()
    });
    Json(repos)
}

async fn branch_info(
    State(state): State<SharedState>,
    Path((repo, branch)): Path<(String, String)>,
) -> Result<Json<BranchInfo>, ApiError> {
    let info = state.store.read(|model| {
        let record = model
            .branch(&repo, &branch)
            .ok_or_else(|| ApiError::NotFound(format!("Unknown branch {}@{}", repo, branch)))?;
        Ok::<_, ApiError>(BranchInfo {
            dependency_shas: model.dependency_shas(record),
            dependency_timestamps: model.dependency_timestamps(record),
            record: record.clone(),
        })
    })?;
    Ok(Json(info))
}

async fn start_build(
    State(state): State<SharedState>,
    Path((repo, branch)): Path<(String, String)>,
) -> Result<Json<BuildStarted>, ApiError> {
    let submission = state.jobs.submit(&repo, &branch, JobKind::Build)?;
    Ok(Json(BuildStarted {
        build_job_id: submission.id,
    }))
}

async fn start_update(
    State(state): State<SharedState>,
    Path((repo, branch)): Path<(String, String)>,
) -> Result<Json<UpdateStarted>, ApiError> {
    let submission = state.jobs.submit(&repo, &branch, JobKind::UpdateCheckout)?;
    Ok(Json(UpdateStarted {
        update_job_id: submission.id,
    }))
}

async fn stale_branches(State(state): State<SharedState>) -> Json<Vec<StaleBranch>> {
    Json(state.stale_branches())
}

async fn trigger_sync(State(state): State<SharedState>) -> impl IntoResponse {
    tokio::spawn(async move {
        match state.synchronizer.sync().await {
            Ok(Some(report)) => {
                info!(added = report.added.len(), "requested synchronization finished")
            }
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{:#}", e), "requested synchronization failed"),
        }
    });
    (StatusCode::ACCEPTED, "synchronization started")
}
