mod postgres;

pub use postgres::PgStorage;

use async_trait::async_trait;
use cinch_core::error::Result;
use cinch_core::model::{ForgeType, Job, JobStatus, Repo, Token, User, Worker};
use uuid::Uuid;

/// A set-of-rows interface over the durable record of repos, jobs, workers,
/// tokens, users. Every method either succeeds or returns a `CinchError`
/// whose kind is `not-found` or `storage-transient` per the error table.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_repo(&self, repo: Repo) -> Result<Repo>;
    async fn get_repo(&self, id: Uuid) -> Result<Option<Repo>>;
    async fn get_repo_by_identity(
        &self,
        forge_type: ForgeType,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repo>>;
    async fn get_repo_by_clone_url(&self, clone_url: &str) -> Result<Option<Repo>>;
    async fn list_repos(&self, limit: i64) -> Result<Vec<Repo>>;
    async fn update_repo_secrets(&self, repo: &Repo) -> Result<()>;
    async fn delete_repo(&self, id: Uuid) -> Result<()>;

    async fn create_job(&self, job: Job) -> Result<Job>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    /// Transitions a job's status, stamping `started_at`/`finished_at`
    /// atomically when moving into `running` or a terminal state.
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<()>;
    async fn update_job_worker(&self, id: Uuid, worker_id: Option<Uuid>) -> Result<()>;
    async fn record_job_approval(&self, id: Uuid, approved_by: &str) -> Result<()>;
    async fn add_job_log_bytes(&self, id: Uuid, bytes: i64) -> Result<()>;
    async fn list_pending_jobs(&self, repo_id: Option<Uuid>, limit: i64) -> Result<Vec<Job>>;
    async fn has_prior_approval(&self, repo_id: Uuid, author: &str) -> Result<bool>;

    async fn upsert_worker(&self, worker: Worker) -> Result<Worker>;
    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>>;
    async fn set_worker_status(
        &self,
        id: Uuid,
        status: cinch_core::model::WorkerStatus,
    ) -> Result<()>;
    async fn count_workers_by_owner(&self, owner_identity: &str) -> Result<i64>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn get_token_by_hash(&self, token_hash: &str) -> Result<Option<Token>>;
    async fn create_token(&self, token: Token) -> Result<Token>;
    async fn revoke_token(&self, id: Uuid) -> Result<()>;

    /// Reads the encrypted canary value, if present.
    async fn get_canary(&self) -> Result<Option<String>>;
    /// Writes the canary value at first startup.
    async fn set_canary(&self, value: &str) -> Result<()>;
}
