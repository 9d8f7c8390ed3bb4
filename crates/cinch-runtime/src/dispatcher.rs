//! Assigns pending jobs to matching worker sessions.
//!
//! A single `Dispatcher` instance runs as a background task for the whole
//! process; there is no per-repo or per-shard dispatcher, so job claims
//! never race across dispatchers and `list_pending_jobs` can use a plain
//! `ORDER BY created_at` instead of `SELECT ... FOR UPDATE SKIP LOCKED`.
//! WebhookIngest and job-completion handlers call `notify()` to wake the
//! loop immediately instead of waiting for the next poll tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cinch_core::crypto::Cipher;
use cinch_core::error::Result;
use cinch_core::model::{Job, JobStatus, Repo, WorkerMode};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::forge::ForgeRegistry;
use crate::hub::Hub;
use crate::session::{JobAssignConfig, JobAssignRepo, ServerMessage};
use crate::storage::Storage;

/// Returned when a session's outbound queue is full or already closed; the
/// job stays queued and will be retried on the next poll.
#[derive(Debug)]
pub struct SendFailed;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const BATCH_SIZE: i64 = 50;

pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    hub: Arc<Hub>,
    forges: Arc<ForgeRegistry>,
    cipher: Arc<Cipher>,
    notify: Notify,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        hub: Arc<Hub>,
        forges: Arc<ForgeRegistry>,
        cipher: Arc<Cipher>,
    ) -> Self {
        Self {
            storage,
            hub,
            forges,
            cipher,
            notify: Notify::new(),
        }
    }

    /// Wakes the dispatch loop without waiting for the next poll tick.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Runs until the process shuts down. Intended to be spawned once as
    /// its own task.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            match self.dispatch_once().await {
                Ok(0) => {}
                Ok(n) => info!(dispatched = n, "assigned jobs to workers"),
                Err(e) => warn!(error = %e, "dispatch pass failed"),
            }
        }
    }

    /// One dispatch pass: pulls a batch of pending/queued jobs and tries to
    /// match each against an available session. Returns the number
    /// successfully assigned.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let jobs = self.storage.list_pending_jobs(None, BATCH_SIZE).await?;
        let mut repo_cache: HashMap<Uuid, Repo> = HashMap::new();
        let mut dispatched = 0;

        for job in jobs {
            let repo = match repo_cache.get(&job.repo_id) {
                Some(r) => r.clone(),
                None => match self.storage.get_repo(job.repo_id).await? {
                    Some(r) => {
                        repo_cache.insert(job.repo_id, r.clone());
                        r
                    }
                    None => continue,
                },
            };

            if self.try_assign(&job, &repo).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    async fn try_assign(&self, job: &Job, repo: &Repo) -> Result<bool> {
        let author = job.author_identity.clone();
        let Some(session) = self.hub.match_session(&job.required_labels, |s| {
            s.mode == WorkerMode::Shared || s.owner_identity == author
        }) else {
            return Ok(false);
        };

        let forge_token = self.cipher.decrypt(&repo.forge_token).unwrap_or_default();
        let clone_token = match self.forges.get(repo.forge_type) {
            Some(adapter) => adapter
                .clone_token(&forge_token, repo.private)
                .await
                .ok()
                .flatten()
                .map(|(token, _expires)| token),
            None => None,
        };

        let command = if job.tag.is_some() {
            repo.release_command.clone()
        } else {
            repo.build_command.clone()
        };

        let mut env = HashMap::with_capacity(repo.env_secrets.len());
        for (key, encrypted) in &repo.env_secrets {
            match self.cipher.decrypt(encrypted) {
                Ok(value) => {
                    env.insert(key.clone(), value);
                }
                Err(e) => warn!(error = %e, %key, "failed to decrypt env secret, omitting from job"),
            }
        }

        let msg = ServerMessage::JobAssign {
            job_id: job.id,
            repo: JobAssignRepo {
                clone_url: repo.clone_url.clone(),
                clone_token,
                commit: job.commit_sha.clone(),
                git_ref: job
                    .branch
                    .as_ref()
                    .map(|b| format!("refs/heads/{b}"))
                    .or_else(|| job.tag.as_ref().map(|t| format!("refs/tags/{t}")))
                    .unwrap_or_default(),
                branch: job.branch.clone(),
                tag: job.tag.clone(),
                forge_type: repo.forge_type.as_str().to_string(),
                is_pr: job.pr_number.is_some(),
                pr_number: job.pr_number,
            },
            config: JobAssignConfig {
                command,
                timeout_secs: 3600,
                env,
            },
        };

        if session.assign_job(job.id, msg).is_err() {
            return Ok(false);
        }

        self.storage
            .update_job_status(job.id, JobStatus::Running, None)
            .await?;
        self.storage
            .update_job_worker(job.id, Some(session.worker_id))
            .await?;
        Ok(true)
    }
}
