use async_trait::async_trait;
use cinch_core::error::{CinchError, Result};
use cinch_core::model::ForgeType;
use serde::Deserialize;

use super::{
    bad_signature, verify_plain_secret, ForgeAdapter, ParseOutcome, PullRequestEvent, PushEvent,
    StatusUpdate, WebhookRequest,
};

pub struct GitLabAdapter {
    http: reqwest::Client,
}

impl GitLabAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    project: ProjectPayload,
    user_username: String,
}

#[derive(Deserialize)]
struct ProjectPayload {
    path_with_namespace: String,
}

#[derive(Deserialize)]
struct MergeRequestPayload {
    object_attributes: MrAttributes,
}

#[derive(Deserialize)]
struct MrAttributes {
    iid: i64,
    action: String,
    source_branch: String,
    target_branch: String,
    last_commit: MrCommit,
    source_project_id: i64,
    target_project_id: i64,
}

#[derive(Deserialize)]
struct MrCommit {
    id: String,
}

fn split_project(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

#[async_trait]
impl ForgeAdapter for GitLabAdapter {
    fn forge_type(&self) -> ForgeType {
        ForgeType::GitLab
    }

    fn identify(&self, req: &WebhookRequest) -> bool {
        req.header("X-Gitlab-Event").is_some()
    }

    fn parse_push(&self, req: &WebhookRequest, secret: &str) -> Result<ParseOutcome<PushEvent>> {
        let token = req.header("X-Gitlab-Token").ok_or_else(bad_signature)?;
        if !verify_plain_secret(secret, token) {
            return Err(bad_signature());
        }
        if req.header("X-Gitlab-Event") != Some("Push Hook") {
            return Ok(ParseOutcome::Ignored);
        }

        let payload: PushPayload = serde_json::from_slice(&req.body)
            .map_err(|e| CinchError::MalformedPayload(e.to_string()))?;
        let (branch, tag) = super_split_git_ref(&payload.git_ref);
        if branch.is_none() && tag.is_none() {
            return Ok(ParseOutcome::Ignored);
        }
        let (owner, repo) = split_project(&payload.project.path_with_namespace);

        Ok(ParseOutcome::Event(PushEvent {
            owner,
            repo,
            commit_sha: payload.after,
            branch,
            tag,
            sender: payload.user_username,
        }))
    }

    fn parse_pull_request(
        &self,
        req: &WebhookRequest,
        secret: &str,
    ) -> Result<ParseOutcome<PullRequestEvent>> {
        let token = req.header("X-Gitlab-Token").ok_or_else(bad_signature)?;
        if !verify_plain_secret(secret, token) {
            return Err(bad_signature());
        }
        if req.header("X-Gitlab-Event") != Some("Merge Request Hook") {
            return Ok(ParseOutcome::Ignored);
        }

        let payload: MergeRequestPayload = serde_json::from_slice(&req.body)
            .map_err(|e| CinchError::MalformedPayload(e.to_string()))?;
        let action = payload.object_attributes.action.as_str();
        if !matches!(action, "open" | "update" | "reopen") {
            return Ok(ParseOutcome::Ignored);
        }

        Ok(ParseOutcome::Event(PullRequestEvent {
            owner: String::new(),
            repo: String::new(),
            pr_number: payload.object_attributes.iid,
            head_sha: payload.object_attributes.last_commit.id,
            head_ref: payload.object_attributes.source_branch,
            base_ref: payload.object_attributes.target_branch,
            is_fork: payload.object_attributes.source_project_id
                != payload.object_attributes.target_project_id,
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
        let project = urlencoding_path(clone_url);
        let url = format!(
            "https://gitlab.com/api/v4/projects/{project}/statuses/{commit_sha}"
        );
        let body = serde_json::json!({
            "state": gitlab_state(update.state),
            "name": update.context,
            "description": update.description,
            "target_url": update.target_url,
        });
        let resp = self
            .http
            .post(url)
            .header("PRIVATE-TOKEN", forge_token)
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
        forge_token: &str,
        clone_url: &str,
        delivery_url: &str,
        secret: &str,
    ) -> Result<String> {
        let project = urlencoding_path(clone_url);
        let url = format!("https://gitlab.com/api/v4/projects/{project}/hooks");
        let body = serde_json::json!({
            "url": delivery_url,
            "token": secret,
            "push_events": true,
            "merge_requests_events": true,
        });
        let resp = self
            .http
            .post(url)
            .header("PRIVATE-TOKEN", forge_token)
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

fn gitlab_state(state: super::StatusState) -> &'static str {
    use super::StatusState::*;
    match state {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Failure => "failed",
        Error => "failed",
    }
}

fn urlencoding_path(clone_url: &str) -> String {
    let trimmed = clone_url
        .trim_start_matches("https://gitlab.com/")
        .trim_end_matches(".git");
    trimmed.replace('/', "%2F")
}

fn super_split_git_ref(git_ref: &str) -> (Option<String>, Option<String>) {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (Some(branch.to_string()), None)
    } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (None, Some(tag.to_string()))
    } else {
        (None, None)
    }
}
