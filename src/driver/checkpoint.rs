//! Persisted batch progress, one record per job type.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::state::Totals;

pub const CHECKPOINT_VERSION: u32 = 1;
/// Checkpoints older than this are ignored and removed.
pub const CHECKPOINT_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCheckpoint {
    pub version: u32,
    pub job: String,
    /// Next batch to run.
    pub batch: u32,
    /// Items of `batch` already handled when a time-boxed call stopped early.
    #[serde(default)]
    pub item_offset: u32,
    pub total_batches: Option<u32>,
    pub total_saved: u64,
    pub total_updated: u64,
    pub done: bool,
    pub saved_at: DateTime<Utc>,
}

impl BatchCheckpoint {
    pub fn new(
        job: &str,
        batch: u32,
        total_batches: Option<u32>,
        totals: Totals,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            job: job.to_string(),
            batch,
            item_offset: 0,
            total_batches,
            total_saved: totals.saved,
            total_updated: totals.updated,
            done: false,
            saved_at,
        }
    }

    pub fn with_item_offset(mut self, item_offset: u32) -> Self {
        self.item_offset = item_offset;
        self
    }

    pub fn totals(&self) -> Totals {
        Totals {
            saved: self.total_saved,
            updated: self.total_updated,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.saved_at >= Duration::hours(CHECKPOINT_TTL_HOURS)
    }

    /// Resumable: not done, not stale, and written by a schema we understand.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.done && self.version <= CHECKPOINT_VERSION && !self.is_stale(now)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &BatchCheckpoint) -> Result<(), CheckpointError>;

    /// Whatever is stored, without validity checks. Unreadable data is `None`.
    async fn load_raw(&self, job: &str) -> Option<BatchCheckpoint>;

    async fn clear(&self, job: &str) -> Result<(), CheckpointError>;

    /// Resumable checkpoint as of `now`. Done, stale or foreign-version
    /// records are removed and reported as absent.
    async fn load_at(&self, job: &str, now: DateTime<Utc>) -> Option<BatchCheckpoint> {
        let checkpoint = self.load_raw(job).await?;
        if checkpoint.is_usable(now) {
            return Some(checkpoint);
        }
        debug!(
            job,
            done = checkpoint.done,
            saved_at = %checkpoint.saved_at,
            "discarding unusable checkpoint"
        );
        if let Err(e) = self.clear(job).await {
            warn!(job, error = %e, "failed to remove unusable checkpoint");
        }
        None
    }

    async fn load(&self, job: &str) -> Option<BatchCheckpoint> {
        self.load_at(job, Utc::now()).await
    }
}

/// `{dir}/{job}.checkpoint.json`, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job: &str) -> PathBuf {
        let safe: String = job
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &BatchCheckpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.job);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_raw(&self, job: &str) -> Option<BatchCheckpoint> {
        let path = self.path_for(job);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint unreadable; ignoring");
                return None;
            }
        };
        match serde_json::from_slice::<BatchCheckpoint>(&bytes) {
            Ok(cp) if cp.job == job => Some(cp),
            Ok(cp) => {
                warn!(expected = job, found = %cp.job, "checkpoint belongs to another job; ignoring");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint malformed; ignoring");
                None
            }
        }
    }

    async fn clear(&self, job: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path_for(job)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<HashMap<String, BatchCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record without validity checks or side effects.
    pub fn peek(&self, job: &str) -> Option<BatchCheckpoint> {
        self.lock().get(job).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BatchCheckpoint>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &BatchCheckpoint) -> Result<(), CheckpointError> {
        self.lock()
            .insert(checkpoint.job.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_raw(&self, job: &str) -> Option<BatchCheckpoint> {
        self.peek(job)
    }

    async fn clear(&self, job: &str) -> Result<(), CheckpointError> {
        self.lock().remove(job);
        Ok(())
    }
}
