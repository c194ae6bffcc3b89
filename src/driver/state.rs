//! Explicit job state for the driver loop.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::checkpoint::BatchCheckpoint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub saved: u64,
    pub updated: u64,
}

impl Totals {
    pub fn add(&mut self, saved: u64, updated: u64) {
        self.saved += saved;
        self.updated += updated;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The operator asked the loop to stop.
    Requested,
    /// The endpoint failed; the checkpoint points at the failed batch.
    Error(String),
    /// Found on startup from an earlier run.
    Recovered,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stopped by request"),
            StopReason::Error(msg) => write!(f, "failed: {msg}"),
            StopReason::Recovered => f.write_str("interrupted run found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Running {
        batch_index: u32,
        total_batches: Option<u32>,
        totals: Totals,
    },
    Stopped {
        checkpoint: BatchCheckpoint,
        reason: StopReason,
    },
    Completed {
        totals: Totals,
    },
}

impl JobState {
    pub fn is_resumable(&self) -> bool {
        matches!(self, JobState::Stopped { .. })
    }

    pub fn label(&self) -> String {
        match self {
            JobState::Idle => "idle".into(),
            JobState::Running {
                batch_index,
                total_batches,
                ..
            } => format!("running {}", progress_label(*batch_index, *total_batches)),
            JobState::Stopped { checkpoint, reason } => format!(
                "{reason} at {}",
                progress_label(checkpoint.batch, checkpoint.total_batches)
            ),
            JobState::Completed { totals } => format!(
                "completed ({} saved, {} updated)",
                totals.saved, totals.updated
            ),
        }
    }
}

/// 1-based human progress text.
pub fn progress_label(batch_index: u32, total_batches: Option<u32>) -> String {
    match total_batches {
        Some(total) => format!("batch {}/{}", batch_index + 1, total),
        None => format!("batch {}", batch_index + 1),
    }
}
