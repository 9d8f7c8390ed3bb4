mod fs;

pub use fs::FsLogStore;

use async_trait::async_trait;
use cinch_core::error::Result;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Append-only per-job log byte stream. `finalize` must be idempotent-ish:
/// a job that is never finalized must still be fully readable via `open`.
/// After `finalize`, callers must not call `append` again.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, job: Uuid, stream: LogStream, bytes: &[u8]) -> Result<()>;
    async fn finalize(&self, job: Uuid) -> Result<u64>;
    async fn open(&self, job: Uuid) -> Result<Vec<u8>>;
    async fn delete(&self, job: Uuid) -> Result<()>;
}
