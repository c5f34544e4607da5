//! Experiment-level checkpoint used to resume an interrupted run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use ct_types::{TuneError, TuneResult};

use crate::trial::{Trial, TuneConfig};

pub const STATE_FILE: &str = "experiment_state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub config: TuneConfig,
    pub trials: Vec<Trial>,
    pub next_trial_number: usize,
    pub checkpointed_at: DateTime<Utc>,
}

impl ExperimentState {
    pub fn new(config: TuneConfig, trials: Vec<Trial>, next_trial_number: usize) -> Self {
        Self {
            config,
            trials,
            next_trial_number,
            checkpointed_at: Utc::now(),
        }
    }

    pub fn path(experiment_dir: &Path) -> PathBuf {
        experiment_dir.join(STATE_FILE)
    }

    /// Write through a temporary file so a crash never leaves a torn state.
    pub fn save(&self, experiment_dir: &Path) -> TuneResult<()> {
        fs::create_dir_all(experiment_dir)?;
        let path = Self::path(experiment_dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(
            "Saved experiment state ({} trials) to {}",
            self.trials.len(),
            path.display()
        );
        Ok(())
    }

    /// `Ok(None)` when no state has been saved yet.
    pub fn load(experiment_dir: &Path) -> TuneResult<Option<Self>> {
        let path = Self::path(experiment_dir);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            TuneError::Checkpoint(format!("corrupt experiment state {}: {}", path.display(), e))
        })?;
        Ok(Some(state))
    }
}
