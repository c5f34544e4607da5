//! Per-trial checkpoint bookkeeping and retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::trial::ObjectiveDirection;

/// `<trial_dir>/checkpoint_<iter:06>`
pub fn checkpoint_dir(trial_dir: &Path, iteration: u64) -> PathBuf {
    trial_dir.join(format!("checkpoint_{:06}", iteration))
}

/// A saved model state tied to a trial round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub iteration: u64,
    /// Path returned by the trainable's save (the weights file).
    pub path: PathBuf,
    /// Value of the score attribute at this round, if reported.
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(iteration: u64, path: PathBuf, score: Option<f64>) -> Self {
        Self {
            iteration,
            path,
            score,
            created_at: Utc::now(),
        }
    }
}

/// Checkpoints of one trial, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHistory {
    records: Vec<CheckpointRecord>,
}

impl CheckpointHistory {
    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&CheckpointRecord> {
        self.records.last()
    }

    /// Highest-scoring checkpoint; unscored ones rank last, ties keep the older.
    pub fn best(&self, direction: ObjectiveDirection) -> Option<&CheckpointRecord> {
        let mut best: Option<&CheckpointRecord> = None;
        for record in &self.records {
            best = match (best, record.score) {
                (None, _) => Some(record),
                (Some(current), Some(score)) => match current.score {
                    Some(current_score) if !direction.is_better(score, current_score) => Some(current),
                    _ => Some(record),
                },
                (Some(current), None) => Some(current),
            };
        }
        best
    }

    /// Add `record`, then drop the worst checkpoints beyond `keep`. The
    /// newest checkpoint is always retained so the trial can be restored.
    /// Returns the dropped records; their files are deleted.
    pub fn add(
        &mut self,
        record: CheckpointRecord,
        keep: Option<usize>,
        direction: ObjectiveDirection,
    ) -> Vec<CheckpointRecord> {
        self.records.retain(|r| r.iteration != record.iteration);
        self.records.push(record);

        let Some(keep) = keep else {
            return Vec::new();
        };
        let keep = keep.max(1);

        let mut dropped = Vec::new();
        while self.records.len() > keep {
            let newest = self.records.len() - 1;
            let worst = self.records[..newest]
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| rank(a, b, direction))
                .map(|(idx, _)| idx);
            match worst {
                Some(idx) => dropped.push(self.records.remove(idx)),
                None => break,
            }
        }

        for record in &dropped {
            remove_checkpoint(record);
        }
        dropped
    }
}

/// Ordering where the lesser checkpoint is the one to drop first.
fn rank(a: &CheckpointRecord, b: &CheckpointRecord, direction: ObjectiveDirection) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.score, b.score) {
        (None, None) => a.iteration.cmp(&b.iteration),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => direction
            .orient(x)
            .partial_cmp(&direction.orient(y))
            .unwrap_or(Ordering::Equal)
            .then(a.iteration.cmp(&b.iteration)),
    }
}

fn remove_checkpoint(record: &CheckpointRecord) {
    let target = record.path.parent().unwrap_or(&record.path);
    if let Err(e) = fs::remove_dir_all(target) {
        tracing::warn!("Failed to delete checkpoint {}: {}", target.display(), e);
    } else {
        tracing::debug!("Deleted checkpoint {}", target.display());
    }
}
