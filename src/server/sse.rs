//! Server-Sent Events for job progress.
//!
//! Each connection subscribes to one job. The stream carries the replayed
//! prefix, then live `output` events, then a single `completed` event, and
//! ends. A heartbeat comment keeps idle connections open; a client hanging
//! up drops its subscription without touching the job.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use crate::jobs::{JobEvent, JobKind};

pub async fn build_events(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    job_events(state, id, JobKind::Build)
}

pub async fn update_events(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    job_events(state, id, JobKind::UpdateCheckout)
}

fn job_events(
    state: SharedState,
    id: u64,
    kind: JobKind,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.jobs.attach(id, kind)?;
    debug!(job_id = id, %kind, "event stream attached");

    let events = subscription.filter_map(|event| async move { to_sse(&event).map(Ok) });
    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.heartbeat)
            .text("heartbeat"),
    ))
}

fn to_sse(event: &JobEvent) -> Option<Event> {
    match Event::default().json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(error = %e, "failed to encode job event");
            None
        }
    }
}
