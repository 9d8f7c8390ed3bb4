use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tracing::warn;

use cinch_core::model::{Job, JobStatus, TrustLevel};

use crate::log_mux::LogEvent;

use super::AppState;

#[derive(Serialize)]
struct JobView {
    id: Uuid,
    status: JobStatus,
    commit_sha: String,
    exit_code: Option<i32>,
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    repo_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Lists queued/running jobs, optionally scoped to one repo. Terminal jobs
/// are reachable individually via `get_job` but aren't listed here; this
/// mirrors the dispatcher's own view of outstanding work.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> impl IntoResponse {
    match state.storage.list_pending_jobs(query.repo_id, query.limit).await {
        Ok(jobs) => Json(
            jobs.into_iter()
                .map(|job| JobView {
                    id: job.id,
                    status: job.status,
                    commit_sha: job.commit_sha,
                    exit_code: job.exit_code,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.storage.get_job(id).await {
        Ok(Some(job)) => Json(JobView {
            id: job.id,
            status: job.status,
            commit_sha: job.commit_sha,
            exit_code: job.exit_code,
        })
        .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Returns the full, persisted log for a job (decompressed if finalized).
pub async fn get_logs(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.log_mux.store().open(id).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Live-tails a running job's log as server-sent events. Subscribes to the
/// in-memory fan-out; a job that already finished has nothing to tail and
/// the stream ends immediately after a `done` event.
pub async fn tail_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.log_mux.subscribe(id);
    let stream = match rx {
        Some(rx) => {
            let broadcast_stream = stream::unfold(rx, |mut rx| async move {
                match rx.recv().await {
                    Ok(event) => Some((event, rx)),
                    Err(_) => None,
                }
            });
            broadcast_stream
                .map(|event| {
                    Ok(match event {
                        LogEvent::Chunk { stream, data } => Event::default()
                            .event(stream.as_str())
                            .data(String::from_utf8_lossy(&data).to_string()),
                        LogEvent::Terminal => Event::default().event("done").data(""),
                    })
                })
                .left_stream()
        }
        None => stream::once(async { Ok(Event::default().event("done").data("")) }).right_stream(),
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(serde::Deserialize)]
pub struct ApproveRequest {
    pub approved_by: String,
}

/// Approves a job held at `pending_contributor`, moving it to `pending` so
/// the dispatcher will pick it up, and records the approval so future jobs
/// from the same author on this repo skip the approval gate.
pub async fn approve_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveRequest>,
) -> impl IntoResponse {
    let job = match state.storage.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
    };
    if job.status != JobStatus::PendingContributor {
        return StatusCode::CONFLICT;
    }
    if state.storage.record_job_approval(id, &body.approved_by).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.dispatcher.notify();
    StatusCode::OK
}

/// Cancels a job that hasn't reached a terminal state. A job already
/// assigned to a worker is marked cancelled here; the worker learns its
/// job was cancelled the next time it reports status and finds nothing
/// to update.
pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let job = match state.storage.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
    };
    if job.status.is_terminal() {
        return StatusCode::CONFLICT;
    }
    if state
        .storage
        .update_job_status(id, JobStatus::Cancelled, None)
        .await
        .is_err()
    {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

/// Retries a terminal job by creating a new `Job` row sharing
/// `(repo_id, commit_sha, ref)` with the original, rather than mutating it
/// in place — the original keeps its own final status for history.
pub async fn run_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let job = match state.storage.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
    };
    if !job.status.is_terminal() {
        return StatusCode::CONFLICT;
    }

    let status = if job.trust_level == TrustLevel::External {
        JobStatus::PendingContributor
    } else {
        JobStatus::Pending
    };

    let retry = Job {
        id: Uuid::new_v4(),
        repo_id: job.repo_id,
        commit_sha: job.commit_sha.clone(),
        branch: job.branch.clone(),
        tag: job.tag.clone(),
        pr_number: job.pr_number,
        base_branch: job.base_branch.clone(),
        required_labels: job.required_labels.clone(),
        status,
        exit_code: None,
        assigned_worker_id: None,
        forge_installation_id: None,
        forge_check_run_id: None,
        created_at: chrono::Utc::now(),
        started_at: None,
        finished_at: None,
        author_identity: job.author_identity.clone(),
        trust_level: job.trust_level,
        is_fork: job.is_fork,
        approved_by: None,
        approved_at: None,
        log_size_bytes: 0,
    };
    if let Err(e) = retry.check_invariants() {
        warn!(error = %e, "retry job would violate invariants");
        return StatusCode::CONFLICT;
    }

    if state.storage.create_job(retry).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if status == JobStatus::Pending {
        state.dispatcher.notify();
    }
    StatusCode::ACCEPTED
}
