//! Fans a job's log chunks out to live subscribers (the HTTP log-tail
//! endpoint) while also persisting them through a `LogStore`. A subscriber
//! that falls behind the bounded channel is dropped rather than allowed to
//! slow down ingestion; it can always replay from the store afterward.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::logstore::{LogStore, LogStream};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;
/// How long a subscribe attempt waits for the first chunk before giving up,
/// so a caller subscribing to a job that finished moments ago doesn't hang.
pub const SUBSCRIBE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum LogEvent {
    Chunk { stream: LogStream, data: bytes::Bytes },
    Terminal,
}

struct JobChannel {
    tx: broadcast::Sender<LogEvent>,
}

/// Ingress (append + fan-out) and subscription management for one process's
/// worth of in-flight jobs. Entries are removed once a job reaches a
/// terminal state and its last subscriber has drained or dropped.
pub struct LogMultiplexer<L: LogStore> {
    store: L,
    channels: Mutex<HashMap<Uuid, JobChannel>>,
}

impl<L: LogStore> LogMultiplexer<L> {
    pub fn new(store: L) -> Self {
        Self {
            store,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel_for(&self, job_id: Uuid) -> broadcast::Sender<LogEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(job_id)
            .or_insert_with(|| JobChannel {
                tx: broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0,
            })
            .tx
            .clone()
    }

    /// Persists a chunk and publishes it to any live subscribers. Publish
    /// failures (no subscribers) are not errors.
    pub async fn ingest(
        &self,
        job_id: Uuid,
        stream: LogStream,
        data: bytes::Bytes,
    ) -> cinch_core::error::Result<()> {
        self.store.append(job_id, stream, &data).await?;
        let tx = self.channel_for(job_id);
        let _ = tx.send(LogEvent::Chunk { stream, data });
        Ok(())
    }

    /// Marks a job as finished: notifies subscribers to close and drops the
    /// in-memory channel so the job stops holding a broadcast slot. Returns
    /// the number of raw bytes sealed, for `Storage::add_job_log_bytes`.
    pub async fn finalize(&self, job_id: Uuid) -> cinch_core::error::Result<u64> {
        let size = self.store.finalize(job_id).await?;
        let tx = {
            let mut channels = self.channels.lock().unwrap();
            channels.remove(&job_id).map(|c| c.tx)
        };
        if let Some(tx) = tx {
            let _ = tx.send(LogEvent::Terminal);
        }
        Ok(size)
    }

    /// Subscribes to live chunks for a job. Returns `None` if the job has
    /// already finalized and there is nothing live to subscribe to (the
    /// caller should fall back to `LogStore::open` for historical replay).
    pub fn subscribe(&self, job_id: Uuid) -> Option<broadcast::Receiver<LogEvent>> {
        let channels = self.channels.lock().unwrap();
        channels.get(&job_id).map(|c| c.tx.subscribe())
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    /// Finalizes every still-open job channel. Called during graceful
    /// shutdown so in-flight log files get sealed and any live subscriber
    /// gets a terminal event instead of being cut off silently.
    pub async fn shutdown(&self) {
        let job_ids: Vec<Uuid> = {
            let channels = self.channels.lock().unwrap();
            channels.keys().copied().collect()
        };
        for job_id in job_ids {
            let _ = self.finalize(job_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstore::fs::FsLogStore;

    #[tokio::test]
    async fn subscriber_receives_ingested_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMultiplexer::new(FsLogStore::new(dir.path().to_path_buf()));
        let job_id = Uuid::new_v4();
        let mut rx = mux.channel_for(job_id).subscribe();

        mux.ingest(job_id, LogStream::Stdout, bytes::Bytes::from_static(b"hello\n"))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            LogEvent::Chunk { data, .. } => assert_eq!(&data[..], b"hello\n"),
            LogEvent::Terminal => panic!("expected a chunk"),
        }
    }

    #[tokio::test]
    async fn finalize_emits_terminal_and_drops_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMultiplexer::new(FsLogStore::new(dir.path().to_path_buf()));
        let job_id = Uuid::new_v4();
        let mut rx = mux.channel_for(job_id).subscribe();

        mux.finalize(job_id).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), LogEvent::Terminal));
        assert!(mux.subscribe(job_id).is_none());
    }
}
