use async_trait::async_trait;
use cinch_core::error::{CinchError, Result};
use cinch_core::model::{
    ForgeType, Job, JobStatus, Repo, Token, TrustLevel, User, Worker, WorkerMode, WorkerStatus,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Storage;

/// The reference `Storage` backend: Postgres accessed through `sqlx`.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_repo(row: &sqlx::postgres::PgRow) -> Repo {
    let labels_json: serde_json::Value = row.get("worker_labels");
    let worker_labels: Vec<Vec<String>> = serde_json::from_value(labels_json).unwrap_or_default();
    let secrets_json: serde_json::Value = row.get("env_secrets");
    let env_secrets = serde_json::from_value(secrets_json).unwrap_or_default();

    Repo {
        id: row.get("id"),
        forge_type: ForgeType::from_str(row.get("forge_type")).unwrap_or(ForgeType::GitHub),
        owner: row.get("owner"),
        name: row.get("name"),
        clone_url: row.get("clone_url"),
        webhook_secret: row.get("webhook_secret"),
        forge_token: row.get("forge_token"),
        build_command: row.get("build_command"),
        release_command: row.get("release_command"),
        worker_labels,
        env_secrets,
        private: row.get("private"),
        created_at: row.get("created_at"),
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
    Job {
        id: row.get("id"),
        repo_id: row.get("repo_id"),
        commit_sha: row.get("commit_sha"),
        branch: row.get("branch"),
        tag: row.get("tag"),
        pr_number: row.get("pr_number"),
        base_branch: row.get("base_branch"),
        required_labels: serde_json::from_value(row.get("required_labels")).unwrap_or_default(),
        status: JobStatus::from_str(row.get("status")).unwrap_or(JobStatus::Pending),
        exit_code: row.get("exit_code"),
        assigned_worker_id: row.get("assigned_worker_id"),
        forge_installation_id: row.get("forge_installation_id"),
        forge_check_run_id: row.get("forge_check_run_id"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        author_identity: row.get("author_identity"),
        trust_level: TrustLevel::from_str(row.get("trust_level")).unwrap_or(TrustLevel::External),
        is_fork: row.get("is_fork"),
        approved_by: row.get("approved_by"),
        approved_at: row.get("approved_at"),
        log_size_bytes: row.get("log_size_bytes"),
    }
}

fn row_to_worker(row: &sqlx::postgres::PgRow) -> Worker {
    let mode_str: String = row.get("mode");
    let status_str: String = row.get("status");
    Worker {
        id: row.get("id"),
        display_name: row.get("display_name"),
        labels: serde_json::from_value(row.get("labels")).unwrap_or_default(),
        status: if status_str == "online" {
            WorkerStatus::Online
        } else {
            WorkerStatus::Offline
        },
        last_seen_at: row.get("last_seen_at"),
        owner_identity: row.get("owner_identity"),
        mode: if mode_str == "personal" {
            WorkerMode::Personal
        } else {
            WorkerMode::Shared
        },
        concurrency: row.get("concurrency"),
    }
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> User {
    User {
        id: row.get("id"),
        primary_email: row.get("primary_email"),
        known_emails: serde_json::from_value(row.get("known_emails")).unwrap_or_default(),
        tier: row.get("tier"),
        storage_used_bytes: row.get("storage_used_bytes"),
        created_at: row.get("created_at"),
    }
}

fn row_to_token(row: &sqlx::postgres::PgRow) -> Token {
    Token {
        id: row.get("id"),
        token_hash: row.get("token_hash"),
        display_name: row.get("display_name"),
        worker_id: row.get("worker_id"),
        created_at: row.get("created_at"),
        revoked_at: row.get("revoked_at"),
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_repo(&self, repo: Repo) -> Result<Repo> {
        sqlx::query(
            r#"
            INSERT INTO repos (
                id, forge_type, owner, name, clone_url, webhook_secret, forge_token,
                build_command, release_command, worker_labels, env_secrets, private, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            "#,
        )
        .bind(repo.id)
        .bind(repo.forge_type.as_str())
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(&repo.clone_url)
        .bind(&repo.webhook_secret)
        .bind(&repo.forge_token)
        .bind(&repo.build_command)
        .bind(&repo.release_command)
        .bind(serde_json::to_value(&repo.worker_labels)?)
        .bind(serde_json::to_value(&repo.env_secrets)?)
        .bind(repo.private)
        .bind(repo.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(repo)
    }

    async fn get_repo(&self, id: Uuid) -> Result<Option<Repo>> {
        let row = sqlx::query("SELECT * FROM repos WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_repo))
    }

    async fn get_repo_by_identity(
        &self,
        forge_type: ForgeType,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repo>> {
        let row = sqlx::query(
            "SELECT * FROM repos WHERE forge_type = $1 AND owner = $2 AND name = $3",
        )
        .bind(forge_type.as_str())
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_repo))
    }

    async fn get_repo_by_clone_url(&self, clone_url: &str) -> Result<Option<Repo>> {
        let row = sqlx::query("SELECT * FROM repos WHERE clone_url = $1")
            .bind(clone_url)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_repo))
    }

    async fn list_repos(&self, limit: i64) -> Result<Vec<Repo>> {
        let rows = sqlx::query("SELECT * FROM repos ORDER BY id DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(rows.iter().map(row_to_repo).collect())
    }

    async fn update_repo_secrets(&self, repo: &Repo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repos SET
                webhook_secret = $2, forge_token = $3, env_secrets = $4,
                worker_labels = $5, private = $6
            WHERE id = $1
            "#,
        )
        .bind(repo.id)
        .bind(&repo.webhook_secret)
        .bind(&repo.forge_token)
        .bind(serde_json::to_value(&repo.env_secrets)?)
        .bind(serde_json::to_value(&repo.worker_labels)?)
        .bind(repo.private)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn delete_repo(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM repos WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn create_job(&self, job: Job) -> Result<Job> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, repo_id, commit_sha, branch, tag, pr_number, base_branch,
                required_labels, status, author_identity, trust_level, is_fork,
                created_at, log_size_bytes
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            "#,
        )
        .bind(job.id)
        .bind(job.repo_id)
        .bind(&job.commit_sha)
        .bind(&job.branch)
        .bind(&job.tag)
        .bind(job.pr_number)
        .bind(&job.base_branch)
        .bind(serde_json::to_value(&job.required_labels)?)
        .bind(job.status.as_str())
        .bind(&job.author_identity)
        .bind(job.trust_level.as_str())
        .bind(job.is_fork)
        .bind(job.created_at)
        .bind(job.log_size_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_job))
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<()> {
        // started_at is stamped the first time the job enters `running`;
        // finished_at is stamped the moment it reaches a terminal status.
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                exit_code = $3,
                started_at = CASE WHEN $2 = 'running' AND started_at IS NULL
                                   THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $4 THEN NOW() ELSE finished_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(exit_code)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn update_job_worker(&self, id: Uuid, worker_id: Option<Uuid>) -> Result<()> {
        sqlx::query("UPDATE jobs SET assigned_worker_id = $2 WHERE id = $1")
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn record_job_approval(&self, id: Uuid, approved_by: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', approved_by = $2, approved_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(approved_by)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn add_job_log_bytes(&self, id: Uuid, bytes: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET log_size_bytes = log_size_bytes + $2 WHERE id = $1")
            .bind(id)
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn list_pending_jobs(&self, repo_id: Option<Uuid>, limit: i64) -> Result<Vec<Job>> {
        let rows = match repo_id {
            Some(repo_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE status IN ('pending', 'queued') AND repo_id = $1
                    ORDER BY created_at ASC
                    LIMIT $2
                    "#,
                )
                .bind(repo_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE status IN ('pending', 'queued')
                    ORDER BY created_at ASC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn has_prior_approval(&self, repo_id: Uuid, author: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM jobs
            WHERE repo_id = $1 AND author_identity = $2 AND approved_by IS NOT NULL
            LIMIT 1
            "#,
        )
        .bind(repo_id)
        .bind(author)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn upsert_worker(&self, worker: Worker) -> Result<Worker> {
        sqlx::query(
            r#"
            INSERT INTO workers (
                id, display_name, labels, status, last_seen_at, owner_identity, mode, concurrency
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                labels = EXCLUDED.labels,
                status = EXCLUDED.status,
                last_seen_at = EXCLUDED.last_seen_at,
                owner_identity = EXCLUDED.owner_identity,
                mode = EXCLUDED.mode,
                concurrency = EXCLUDED.concurrency
            "#,
        )
        .bind(worker.id)
        .bind(&worker.display_name)
        .bind(serde_json::to_value(&worker.labels)?)
        .bind(if worker.status == WorkerStatus::Online { "online" } else { "offline" })
        .bind(worker.last_seen_at)
        .bind(&worker.owner_identity)
        .bind(if worker.mode == WorkerMode::Personal { "personal" } else { "shared" })
        .bind(worker.concurrency)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(worker)
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_worker))
    }

    async fn set_worker_status(&self, id: Uuid, status: WorkerStatus) -> Result<()> {
        sqlx::query("UPDATE workers SET status = $2, last_seen_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(if status == WorkerStatus::Online { "online" } else { "offline" })
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn count_workers_by_owner(&self, owner_identity: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM workers WHERE owner_identity = $1")
            .bind(owner_identity)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.get("n"))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE primary_email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn get_token_by_hash(&self, token_hash: &str) -> Result<Option<Token>> {
        let row = sqlx::query("SELECT * FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.as_ref().map(row_to_token))
    }

    async fn create_token(&self, token: Token) -> Result<Token> {
        sqlx::query(
            r#"
            INSERT INTO tokens (id, token_hash, display_name, worker_id, created_at)
            VALUES ($1,$2,$3,$4,$5)
            "#,
        )
        .bind(token.id)
        .bind(&token.token_hash)
        .bind(&token.display_name)
        .bind(token.worker_id)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(token)
    }

    async fn revoke_token(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE tokens SET revoked_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn get_canary(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM secrets_canary WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn set_canary(&self, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets_canary (id, value) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        Ok(())
    }
}
