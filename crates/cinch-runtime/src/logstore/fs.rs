use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use cinch_core::error::{CinchError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{LogStore, LogStream};

/// Filesystem-backed `LogStore`: one append-only file per job under
/// `<root>/<job_id>.log`, finalized by gzip-compressing into
/// `<job_id>.log.gz` and removing the raw file.
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn raw_path(&self, job: Uuid) -> PathBuf {
        self.root.join(format!("{job}.log"))
    }

    fn finalized_path(&self, job: Uuid) -> PathBuf {
        self.root.join(format!("{job}.log.gz"))
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn append(&self, job: Uuid, stream: LogStream, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.raw_path(job);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // Each entry is framed as "<stream>\t<len>\n<bytes>" so a finalized
        // read can reconstruct which stream each chunk came from.
        let header = format!("{}\t{}\n", stream.as_str(), bytes.len());
        file.write_all(header.as_bytes()).await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn finalize(&self, job: Uuid) -> Result<u64> {
        let raw = self.raw_path(job);
        if !raw.exists() {
            // Tolerated: a job that never produced a chunk can still be
            // finalized to an empty, sealed stream.
            tokio::fs::create_dir_all(&self.root).await?;
        }
        let final_path = self.finalized_path(job);
        let raw_clone = raw.clone();
        let size = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut input = Vec::new();
            if raw_clone.exists() {
                std::fs::File::open(&raw_clone)?.read_to_end(&mut input)?;
            }
            let out = std::fs::File::create(&final_path)?;
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder.write_all(&input)?;
            encoder.finish()?;
            if raw_clone.exists() {
                std::fs::remove_file(&raw_clone)?;
            }
            Ok(input.len() as u64)
        })
        .await
        .map_err(|e| CinchError::StorageTransient(e.to_string()))??;
        Ok(size)
    }

    async fn open(&self, job: Uuid) -> Result<Vec<u8>> {
        let raw = self.raw_path(job);
        if raw.exists() {
            return Ok(tokio::fs::read(&raw).await?);
        }
        let finalized = self.finalized_path(job);
        if finalized.exists() {
            let finalized_clone = finalized.clone();
            return tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                let mut decoder = GzDecoder::new(std::fs::File::open(&finalized_clone)?);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            })
            .await
            .map_err(|e| CinchError::StorageTransient(e.to_string()))?;
        }
        Ok(Vec::new())
    }

    async fn delete(&self, job: Uuid) -> Result<()> {
        for path in [self.raw_path(job), self.finalized_path(job)] {
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
