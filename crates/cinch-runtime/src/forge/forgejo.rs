use async_trait::async_trait;
use cinch_core::error::{CinchError, Result};
use cinch_core::model::ForgeType;
use serde::Deserialize;

use super::{
    bad_signature, verify_hmac_sha256_hex, ForgeAdapter, ParseOutcome, PullRequestEvent,
    PushEvent, StatusUpdate, WebhookRequest,
};

pub struct ForgejoAdapter {
    http: reqwest::Client,
}

impl ForgejoAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: RepoPayload,
    pusher: UserPayload,
}

#[derive(Deserialize)]
struct RepoPayload {
    name: String,
    owner: UserPayload,
}

#[derive(Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    number: i64,
    pull_request: PrPayload,
}

#[derive(Deserialize)]
struct PrPayload {
    head: PrSide,
    base: PrSide,
}

#[derive(Deserialize)]
struct PrSide {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
    repo: RepoPayload,
}

#[async_trait]
impl ForgeAdapter for ForgejoAdapter {
    fn forge_type(&self) -> ForgeType {
        ForgeType::Forgejo
    }

    fn identify(&self, req: &WebhookRequest) -> bool {
        req.header("X-Gitea-Event").is_some()
    }

    fn parse_push(&self, req: &WebhookRequest, secret: &str) -> Result<ParseOutcome<PushEvent>> {
        let signature = req.header("X-Gitea-Signature").ok_or_else(bad_signature)?;
        if !verify_hmac_sha256_hex(secret, &req.body, signature) {
            return Err(bad_signature());
        }
        if req.header("X-Gitea-Event") != Some("push") {
            return Ok(ParseOutcome::Ignored);
        }

        let payload: PushPayload = serde_json::from_slice(&req.body)
            .map_err(|e| CinchError::MalformedPayload(e.to_string()))?;
        let (branch, tag) = split_git_ref(&payload.git_ref);
        if branch.is_none() && tag.is_none() {
            return Ok(ParseOutcome::Ignored);
        }

        Ok(ParseOutcome::Event(PushEvent {
            owner: payload.repository.owner.login,
            repo: payload.repository.name,
            commit_sha: payload.after,
            branch,
            tag,
            sender: payload.pusher.login,
        }))
    }

    fn parse_pull_request(
        &self,
        req: &WebhookRequest,
        secret: &str,
    ) -> Result<ParseOutcome<PullRequestEvent>> {
        let signature = req.header("X-Gitea-Signature").ok_or_else(bad_signature)?;
        if !verify_hmac_sha256_hex(secret, &req.body, signature) {
            return Err(bad_signature());
        }
        if req.header("X-Gitea-Event") != Some("pull_request") {
            return Ok(ParseOutcome::Ignored);
        }

        let payload: PullRequestPayload = serde_json::from_slice(&req.body)
            .map_err(|e| CinchError::MalformedPayload(e.to_string()))?;
        if !matches!(payload.action.as_str(), "opened" | "synchronized" | "reopened") {
            return Ok(ParseOutcome::Ignored);
        }

        let is_fork = payload.pull_request.head.repo.owner.login
            != payload.pull_request.base.repo.owner.login
            || payload.pull_request.head.repo.name != payload.pull_request.base.repo.name;

        Ok(ParseOutcome::Event(PullRequestEvent {
            owner: payload.pull_request.base.repo.owner.login,
            repo: payload.pull_request.base.repo.name,
            pr_number: payload.number,
            head_sha: payload.pull_request.head.sha,
            head_ref: payload.pull_request.head.git_ref,
            base_ref: payload.pull_request.base.git_ref,
            is_fork,
            sender: String::new(),
        }))
    }

    async fn post_status(
        &self,
        forge_token: &str,
        clone_url: &str,
        commit_sha: &str,
        update: StatusUpdate<'_>,
    ) -> Result<()> {
        let (owner, repo) = owner_repo_from_clone_url(clone_url)?;
        let base = clone_url
            .split_once("://")
            .map(|(_, rest)| rest.split('/').next().unwrap_or("").to_string())
            .unwrap_or_default();
        let url = format!("https://{base}/api/v1/repos/{owner}/{repo}/statuses/{commit_sha}");
        let body = serde_json::json!({
            "state": forgejo_state(update.state),
            "context": update.context,
            "description": update.description,
            "target_url": update.target_url,
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(forge_token)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CinchError::ForgeStatusTransient(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else if resp.status().as_u16() == 429 || resp.status().is_server_error() {
            Err(CinchError::ForgeStatusTransient(format!("http {}", resp.status())))
        } else {
            Err(CinchError::ForgeStatusPermanent(format!("http {}", resp.status())))
        }
    }

    async fn create_webhook(
        &self,
        _forge_token: &str,
        _clone_url: &str,
        _delivery_url: &str,
        _secret: &str,
    ) -> Result<String> {
        Err(CinchError::StorageTransient(
            "forgejo webhook creation requires an instance base URL, not only a clone URL".into(),
        ))
    }

    async fn clone_token(
        &self,
        forge_token: &str,
        private: bool,
    ) -> Result<Option<(String, chrono::DateTime<chrono::Utc>)>> {
        if !private {
            return Ok(None);
        }
        Ok(Some((
            forge_token.to_string(),
            chrono::Utc::now() + chrono::Duration::minutes(10),
        )))
    }
}

fn forgejo_state(state: super::StatusState) -> &'static str {
    use super::StatusState::*;
    match state {
        Pending | Running => "pending",
        Success => "success",
        Failure => "failure",
        Error => "error",
    }
}

fn owner_repo_from_clone_url(clone_url: &str) -> Result<(String, String)> {
    let trimmed = clone_url.trim_end_matches(".git");
    let parts: Vec<&str> = trimmed.rsplitn(3, '/').collect();
    if parts.len() < 2 {
        return Err(CinchError::MalformedPayload("unparseable clone url".into()));
    }
    Ok((parts[1].to_string(), parts[0].to_string()))
}

fn split_git_ref(git_ref: &str) -> (Option<String>, Option<String>) {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (Some(branch.to_string()), None)
    } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (None, Some(tag.to_string()))
    } else {
        (None, None)
    }
}
