//! Domain types shared between the Storage trait, the wire protocol, and the
//! HTTP API. These are plain data; behavior lives in `cinch-runtime`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A git forge implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeType {
    GitHub,
    GitLab,
    Forgejo,
}

impl ForgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForgeType::GitHub => "github",
            ForgeType::GitLab => "gitlab",
            ForgeType::Forgejo => "forgejo",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "github" => Some(ForgeType::GitHub),
            "gitlab" => Some(ForgeType::GitLab),
            "forgejo" => Some(ForgeType::Forgejo),
            _ => None,
        }
    }
}

/// A repository onboarded to Cinch.
///
/// Immutable once created except for its secret/worker/private fields, per
/// the ownership rules in the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: Uuid,
    pub forge_type: ForgeType,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    /// `enc:`-prefixed authenticated ciphertext; never serialized to API
    /// responses (see `RepoSummary`).
    pub webhook_secret: String,
    pub forge_token: String,
    pub build_command: String,
    pub release_command: String,
    /// Worker-label groups for fan-out. An empty list means a single
    /// default, labelless job per push.
    pub worker_labels: Vec<Vec<String>>,
    /// Environment secret names mapped to `enc:`-prefixed ciphertext values.
    pub env_secrets: std::collections::HashMap<String, String>,
    pub private: bool,
    pub created_at: DateTime<Utc>,
}

/// Trust level of a job's author relative to the repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Owner,
    Collaborator,
    External,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Owner => "owner",
            TrustLevel::Collaborator => "collaborator",
            TrustLevel::External => "external",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(TrustLevel::Owner),
            "collaborator" => Some(TrustLevel::Collaborator),
            "external" => Some(TrustLevel::External),
            _ => None,
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    PendingContributor,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::PendingContributor => "pending_contributor",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "pending_contributor" => JobStatus::PendingContributor,
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "success" => JobStatus::Success,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            "error" => JobStatus::Error,
            _ => return None,
        })
    }
}

/// A single record of a build/release execution for one commit on one set
/// of required worker labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub commit_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub pr_number: Option<i64>,
    pub base_branch: Option<String>,
    pub required_labels: Vec<String>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub assigned_worker_id: Option<Uuid>,
    pub forge_installation_id: Option<String>,
    pub forge_check_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub author_identity: String,
    pub trust_level: TrustLevel,
    pub is_fork: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub log_size_bytes: i64,
}

impl Job {
    /// Validate the invariants from the data model section. Used by tests
    /// and by Storage implementations before persisting a transition.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.status.is_terminal() != self.finished_at.is_some() {
            return Err("finished_at must be set iff status is terminal".into());
        }
        let exit_code_expected = matches!(self.status, JobStatus::Success | JobStatus::Failed);
        if exit_code_expected != self.exit_code.is_some() {
            return Err("exit_code must be set iff status in {success, failed}".into());
        }
        if self.is_fork && self.trust_level != TrustLevel::External {
            return Err("is_fork implies trust_level = external".into());
        }
        Ok(())
    }
}

/// A worker's acceptance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Personal,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

/// A registered worker, identified by the token it authenticates with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub display_name: String,
    pub labels: Vec<String>,
    pub status: WorkerStatus,
    pub last_seen_at: DateTime<Utc>,
    pub owner_identity: String,
    pub mode: WorkerMode,
    pub concurrency: i32,
}

/// A Cinch user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub primary_email: String,
    pub known_emails: Vec<String>,
    pub tier: String,
    pub storage_used_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// A bearer token. Stored by hash only; `token_hash` never round-trips the
/// raw secret value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub token_hash: String,
    pub display_name: String,
    pub worker_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_valid(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_job() -> Job {
        Job {
            id: Uuid::nil(),
            repo_id: Uuid::nil(),
            commit_sha: "abc123".into(),
            branch: Some("main".into()),
            tag: None,
            pr_number: None,
            base_branch: None,
            required_labels: vec![],
            status: JobStatus::Pending,
            exit_code: None,
            assigned_worker_id: None,
            forge_installation_id: None,
            forge_check_run_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            author_identity: "alice".into(),
            trust_level: TrustLevel::Owner,
            is_fork: false,
            approved_by: None,
            approved_at: None,
            log_size_bytes: 0,
        }
    }

    #[test]
    fn pending_job_satisfies_invariants() {
        assert!(base_job().check_invariants().is_ok());
    }

    #[test]
    fn terminal_without_finished_at_is_invalid() {
        let mut job = base_job();
        job.status = JobStatus::Success;
        job.exit_code = Some(0);
        assert!(job.check_invariants().is_err());
    }

    #[test]
    fn fork_requires_external_trust() {
        let mut job = base_job();
        job.is_fork = true;
        job.trust_level = TrustLevel::Owner;
        assert!(job.check_invariants().is_err());
    }

    #[test]
    fn success_requires_exit_code() {
        let mut job = base_job();
        job.status = JobStatus::Success;
        job.finished_at = Some(Utc::now());
        assert!(job.check_invariants().is_err());
    }
}
