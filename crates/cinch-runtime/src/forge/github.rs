use async_trait::async_trait;
use cinch_core::error::{CinchError, Result};
use cinch_core::model::ForgeType;
use serde::Deserialize;

use super::{
    bad_signature, verify_hmac_sha256_hex, ForgeAdapter, ParseOutcome, PullRequestEvent,
    PushEvent, StatusUpdate, WebhookRequest,
};

pub struct GitHubAdapter {
    http: reqwest::Client,
}

impl GitHubAdapter {
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
    sender: SenderPayload,
    deleted: Option<bool>,
}

#[derive(Deserialize)]
struct RepoPayload {
    name: String,
    owner: OwnerPayload,
}

#[derive(Deserialize)]
struct OwnerPayload {
    login: String,
}

#[derive(Deserialize)]
struct SenderPayload {
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
    user: SenderPayload,
}

#[derive(Deserialize)]
struct PrSide {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
    repo: RepoPayload,
}

#[async_trait]
impl ForgeAdapter for GitHubAdapter {
    fn forge_type(&self) -> ForgeType {
        ForgeType::GitHub
    }

    fn identify(&self, req: &WebhookRequest) -> bool {
        req.header("X-GitHub-Event").is_some()
    }

    fn parse_push(&self, req: &WebhookRequest, secret: &str) -> Result<ParseOutcome<PushEvent>> {
        let signature = req
            .header("X-Hub-Signature-256")
            .ok_or_else(bad_signature)?;
        if !verify_hmac_sha256_hex(secret, &req.body, signature) {
            return Err(bad_signature());
        }
        if req.header("X-GitHub-Event") != Some("push") {
            return Ok(ParseOutcome::Ignored);
        }

        let payload: PushPayload = serde_json::from_slice(&req.body)
            .map_err(|e| CinchError::MalformedPayload(e.to_string()))?;
        if payload.deleted.unwrap_or(false) {
            return Ok(ParseOutcome::Ignored);
        }

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
            sender: payload.sender.login,
        }))
    }

    fn parse_pull_request(
        &self,
        req: &WebhookRequest,
        secret: &str,
    ) -> Result<ParseOutcome<PullRequestEvent>> {
        let signature = req
            .header("X-Hub-Signature-256")
            .ok_or_else(bad_signature)?;
        if !verify_hmac_sha256_hex(secret, &req.body, signature) {
            return Err(bad_signature());
        }
        if req.header("X-GitHub-Event") != Some("pull_request") {
            return Ok(ParseOutcome::Ignored);
        }

        let payload: PullRequestPayload = serde_json::from_slice(&req.body)
            .map_err(|e| CinchError::MalformedPayload(e.to_string()))?;
        if !matches!(payload.action.as_str(), "opened" | "synchronize" | "reopened") {
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
            sender: payload.pull_request.user.login,
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
        let url = format!("https://api.github.com/repos/{owner}/{repo}/statuses/{commit_sha}");
        let body = serde_json::json!({
            "state": github_state(update.state),
            "context": update.context,
            "description": update.description,
            "target_url": update.target_url,
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(forge_token)
            .header("User-Agent", "cinch")
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CinchError::ForgeStatusTransient(e.to_string()))?;
        classify_status_response(resp.status())
    }

    async fn create_webhook(
        &self,
        forge_token: &str,
        clone_url: &str,
        delivery_url: &str,
        secret: &str,
    ) -> Result<String> {
        let (owner, repo) = owner_repo_from_clone_url(clone_url)?;
        let url = format!("https://api.github.com/repos/{owner}/{repo}/hooks");
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push", "pull_request"],
            "config": {
                "url": delivery_url,
                "content_type": "json",
                "secret": secret,
            }
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(forge_token)
            .header("User-Agent", "cinch")
            .json(&body)
            .send()
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(value["id"].to_string())
    }

    async fn clone_token(
        &self,
        _forge_token: &str,
        private: bool,
    ) -> Result<Option<(String, chrono::DateTime<chrono::Utc>)>> {
        if !private {
            return Ok(None);
        }
        // A real deployment mints a short-lived GitHub App installation
        // token here; this core treats it as an external collaborator call.
        Ok(Some((
            _forge_token.to_string(),
            chrono::Utc::now() + chrono::Duration::minutes(10),
        )))
    }
}

fn github_state(state: super::StatusState) -> &'static str {
    use super::StatusState::*;
    match state {
        Pending | Running => "pending",
        Success => "success",
        Failure => "failure",
        Error => "error",
    }
}

fn classify_status_response(status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status.as_u16() == 429 || status.is_server_error() {
        Err(CinchError::ForgeStatusTransient(format!("http {status}")))
    } else {
        Err(CinchError::ForgeStatusPermanent(format!("http {status}")))
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

/// Splits a git ref into `(branch, tag)`; exactly one is `Some` for a push
/// to a branch or a tag; both `None` for anything else (deletes, etc).
fn split_git_ref(git_ref: &str) -> (Option<String>, Option<String>) {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (Some(branch.to_string()), None)
    } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (None, Some(tag.to_string()))
    } else {
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_branch_ref() {
        assert_eq!(
            split_git_ref("refs/heads/main"),
            (Some("main".to_string()), None)
        );
    }

    #[test]
    fn splits_tag_ref() {
        assert_eq!(
            split_git_ref("refs/tags/v1.0.0"),
            (None, Some("v1.0.0".to_string()))
        );
    }

    #[test]
    fn owner_repo_parses_https_clone_url() {
        let (owner, repo) = owner_repo_from_clone_url("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
    }
}
