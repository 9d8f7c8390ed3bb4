use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use cinch_core::error::CinchError;
use cinch_core::model::{Job, JobStatus, Repo, TrustLevel};

use crate::forge::{ParseOutcome, PullRequestEvent, PushEvent, WebhookRequest};

use super::AppState;

/// Single inbound endpoint for all forges: `ForgeRegistry::identify` picks
/// the adapter from request headers, then the repo is looked up from the
/// (untrusted) payload body before its secret is used to verify the
/// signature the adapter already requires internally.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let req = WebhookRequest {
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
        body: body.clone(),
    };

    let Some(adapter) = state.forges.identify(&req) else {
        return (StatusCode::BAD_REQUEST, "unrecognized forge").into_response();
    };

    let Some((owner, name)) = extract_owner_repo(&body) else {
        return (StatusCode::BAD_REQUEST, "malformed payload").into_response();
    };

    let repo = match state
        .storage
        .get_repo_by_identity(adapter.forge_type(), &owner, &name)
        .await
    {
        Ok(Some(repo)) => repo,
        Ok(None) => return (StatusCode::NOT_FOUND, "unknown repo").into_response(),
        Err(e) => return internal_error(e),
    };

    let secret = match state.cipher.decrypt(&repo.webhook_secret) {
        Ok(s) => s,
        Err(e) => return internal_error(e),
    };

    match adapter.parse_push(&req, &secret) {
        Ok(ParseOutcome::Event(event)) => {
            return match fan_out_push(&state, &repo, event).await {
                Ok(true) => (StatusCode::OK, "push accepted").into_response(),
                Ok(false) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => internal_error(e),
            };
        }
        Ok(ParseOutcome::Ignored) => {}
        Err(CinchError::BadSignature) => return (StatusCode::UNAUTHORIZED, "bad signature").into_response(),
        Err(e) => return internal_error(e),
    }

    match adapter.parse_pull_request(&req, &secret) {
        Ok(ParseOutcome::Event(event)) => match fan_out_pull_request(&state, &repo, event).await {
            Ok(true) => (StatusCode::OK, "pull request accepted").into_response(),
            Ok(false) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => internal_error(e),
        },
        Ok(ParseOutcome::Ignored) => (StatusCode::OK, "ignored").into_response(),
        Err(CinchError::BadSignature) => (StatusCode::UNAUTHORIZED, "bad signature").into_response(),
        Err(e) => internal_error(e),
    }
}

/// Best-effort owner/repo extraction from common forge payload shapes,
/// done before we know which repo's secret to verify the signature with.
/// Trusted only for routing; every field that drives a job decision comes
/// from the adapter's verified parse afterward.
fn extract_owner_repo(body: &[u8]) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    if let Some(full_name) = value
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|v| v.as_str())
    {
        return split_full_name(full_name);
    }
    if let Some(path) = value
        .get("project")
        .and_then(|p| p.get("path_with_namespace"))
        .and_then(|v| v.as_str())
    {
        return split_full_name(path);
    }
    None
}

fn split_full_name(full_name: &str) -> Option<(String, String)> {
    full_name
        .rsplit_once('/')
        .map(|(owner, name)| (owner.to_string(), name.to_string()))
}

async fn fan_out_push(
    state: &AppState,
    repo: &Repo,
    event: PushEvent,
) -> cinch_core::error::Result<bool> {
    info!(repo = %repo.name, commit = %event.commit_sha, "push event");
    create_jobs_for_repo(
        state,
        repo,
        event.commit_sha,
        event.branch,
        event.tag,
        None,
        None,
        event.sender,
        TrustLevel::Collaborator,
        false,
    )
    .await
}

async fn fan_out_pull_request(
    state: &AppState,
    repo: &Repo,
    event: PullRequestEvent,
) -> cinch_core::error::Result<bool> {
    // A non-fork PR can only be opened by someone with push access to the
    // base repo; a fork PR is external unless that author already has a
    // prior approved job on this repo.
    let trust_level = if !event.is_fork {
        TrustLevel::Collaborator
    } else if state.storage.has_prior_approval(repo.id, &event.sender).await? {
        TrustLevel::Collaborator
    } else {
        TrustLevel::External
    };

    info!(
        repo = %repo.name,
        pr = event.pr_number,
        trust = ?trust_level,
        "pull request event"
    );

    create_jobs_for_repo(
        state,
        repo,
        event.head_sha,
        Some(event.head_ref),
        None,
        Some(event.pr_number),
        Some(event.base_ref),
        event.sender,
        trust_level,
        event.is_fork,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn create_jobs_for_repo(
    state: &AppState,
    repo: &Repo,
    commit_sha: String,
    branch: Option<String>,
    tag: Option<String>,
    pr_number: Option<i64>,
    base_branch: Option<String>,
    author_identity: String,
    trust_level: TrustLevel,
    is_fork: bool,
) -> cinch_core::error::Result<bool> {
    let command = if tag.is_some() {
        repo.release_command.clone()
    } else {
        repo.build_command.clone()
    };
    if command.trim().is_empty() {
        info!(repo = %repo.name, "no command configured for this event, skipping job creation");
        return Ok(false);
    }

    let label_groups: Vec<Vec<String>> = if repo.worker_labels.is_empty() {
        vec![Vec::new()]
    } else {
        repo.worker_labels.clone()
    };

    let status = if trust_level == TrustLevel::External {
        JobStatus::PendingContributor
    } else {
        JobStatus::Pending
    };

    let mut any_dispatchable = false;
    for labels in label_groups {
        let job = Job {
            id: Uuid::new_v4(),
            repo_id: repo.id,
            commit_sha: commit_sha.clone(),
            branch: branch.clone(),
            tag: tag.clone(),
            pr_number,
            base_branch: base_branch.clone(),
            required_labels: labels,
            status,
            exit_code: None,
            assigned_worker_id: None,
            forge_installation_id: None,
            forge_check_run_id: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            author_identity: author_identity.clone(),
            trust_level,
            is_fork,
            approved_by: None,
            approved_at: None,
            log_size_bytes: 0,
        };
        if let Err(e) = job.check_invariants() {
            warn!(error = %e, "skipping job that would violate invariants");
            continue;
        }
        state.storage.create_job(job).await?;
        any_dispatchable |= status == JobStatus::Pending;
    }

    if any_dispatchable {
        state.dispatcher.notify();
    }
    Ok(true)
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    warn!(error = %e, "webhook handling failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}
