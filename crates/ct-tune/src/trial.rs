//! Trial tracking and tuning run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use ct_types::{validation_error, MetricReport, ParamMap, TrialConfig, TuneResult};

use crate::checkpoint::CheckpointHistory;
use crate::resources::TrialResources;
use crate::scheduler::SchedulerConfig;

/// Unique tuning run identifier.
pub type RunId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Flip `value` so that higher is always better.
    pub fn orient(self, value: f64) -> f64 {
        match self {
            Self::Maximize => value,
            Self::Minimize => -value,
        }
    }

    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        self.orient(candidate) > self.orient(current)
    }
}

/// Top-level configuration for a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    pub id: RunId,
    /// Experiment name; also the run directory name under `local_dir`.
    pub name: String,
    pub local_dir: PathBuf,

    /// Maximum number of trials to start.
    pub num_samples: usize,

    /// Upper bound on trials running at once.
    pub max_concurrent: usize,

    /// Metric name to optimize.
    pub metric: String,

    /// Direction of optimization.
    pub direction: ObjectiveDirection,

    pub resources_per_trial: TrialResources,

    /// GPUs available to the run; `None` detects them from the environment.
    pub total_gpus: Option<f64>,

    pub scheduler: SchedulerConfig,

    pub reuse_actors: bool,
    pub resume: bool,
    pub checkpoint_at_end: bool,
    /// Checkpoint every N rounds (0 disables periodic checkpoints).
    pub checkpoint_freq: u64,
    pub global_checkpoint_period_s: u64,
    pub keep_checkpoints_num: Option<usize>,
    pub checkpoint_score_attr: String,

    /// Seed for the search strategy and the scheduler's bracket draws.
    pub seed: Option<u64>,

    pub created_at: DateTime<Utc>,
}

impl TuneConfig {
    pub fn new(name: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            local_dir: local_dir.into(),
            num_samples: 300,
            max_concurrent: 4,
            metric: "kappa".to_string(),
            direction: ObjectiveDirection::Maximize,
            resources_per_trial: TrialResources::default(),
            total_gpus: None,
            scheduler: SchedulerConfig::default(),
            reuse_actors: true,
            resume: true,
            checkpoint_at_end: true,
            checkpoint_freq: 0,
            global_checkpoint_period_s: 360,
            keep_checkpoints_num: Some(5),
            checkpoint_score_attr: "kappa".to_string(),
            seed: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_num_samples(mut self, n: usize) -> Self {
        self.num_samples = n;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_resources(mut self, resources: TrialResources) -> Self {
        self.resources_per_trial = resources;
        self
    }

    pub fn with_total_gpus(mut self, gpus: f64) -> Self {
        self.total_gpus = Some(gpus);
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_checkpoint_freq(mut self, freq: u64) -> Self {
        self.checkpoint_freq = freq;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// `<local_dir>/<name>`
    pub fn experiment_dir(&self) -> PathBuf {
        self.local_dir.join(&self.name)
    }

    /// Reject configurations no trial could run under.
    pub fn validate(&self) -> TuneResult<()> {
        if self.name.trim().is_empty() {
            return Err(validation_error!("experiment name must not be empty"));
        }
        if self.num_samples == 0 {
            return Err(validation_error!("num_samples must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(validation_error!("max_concurrent must be at least 1"));
        }
        if self.metric.is_empty() {
            return Err(validation_error!("metric must not be empty"));
        }
        self.resources_per_trial.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Lifecycle state for a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Aggregate status of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: RunId,
    pub state: RunState,
    pub direction: ObjectiveDirection,
    pub trials_completed: usize,
    pub trials_pruned: usize,
    pub trials_failed: usize,
    pub trials_running: usize,
    pub best_trial: Option<TrialResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    pub fn new(config: &TuneConfig) -> Self {
        Self {
            id: config.id,
            state: RunState::Pending,
            direction: config.direction,
            trials_completed: 0,
            trials_pruned: 0,
            trials_failed: 0,
            trials_running: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.state = RunState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = RunState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Update the best trial if `result` improves on the current best.
    /// Ties keep the earlier trial.
    pub fn update_best(&mut self, result: &TrialResult) {
        let improves = match &self.best_trial {
            None => true,
            Some(current_best) => self
                .direction
                .is_better(result.objective, current_best.objective),
        };
        if improves {
            self.best_trial = Some(result.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// A single trial (one configuration trained round by round).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub run_id: RunId,
    pub trial_number: usize,
    /// The sampled values only.
    pub parameters: ParamMap,
    /// Constants merged with the sampled values.
    pub config: TrialConfig,
    pub resources: TrialResources,
    pub status: TrialStatus,
    pub last_result: Option<MetricReport>,
    pub results: Vec<MetricReport>,
    pub checkpoints: CheckpointHistory,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<usize>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(
        run_id: RunId,
        trial_number: usize,
        parameters: ParamMap,
        config: TrialConfig,
        resources: TrialResources,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            trial_number,
            parameters,
            config,
            resources,
            status: TrialStatus::Pending,
            last_result: None,
            results: Vec::new(),
            checkpoints: CheckpointHistory::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            error: None,
        }
    }

    /// Directory name of this trial under the experiment directory.
    pub fn dir_name(&self) -> String {
        let id = self.id.simple().to_string();
        format!("trial_{:05}_{}", self.trial_number, &id[..8])
    }

    pub fn dir(&self, experiment_dir: &Path) -> PathBuf {
        experiment_dir.join(self.dir_name())
    }

    pub fn iteration(&self) -> u64 {
        self.last_result
            .as_ref()
            .map(|r| r.training_iteration)
            .unwrap_or(0)
    }

    pub fn mark_running(&mut self, worker_id: Option<usize>) {
        self.status = TrialStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.worker_id = worker_id;
    }

    pub fn record(&mut self, report: MetricReport) {
        self.results.push(report.clone());
        self.last_result = Some(report);
    }

    pub fn mark_completed(&mut self) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_pruned(&mut self) {
        self.status = TrialStatus::Pruned;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Summary of the last report, if it carries the objective metric.
    pub fn result(&self, metric: &str) -> Option<TrialResult> {
        let report = self.last_result.as_ref()?;
        Some(TrialResult {
            trial_id: self.id,
            trial_number: self.trial_number,
            objective: report.metric(metric)?,
            metrics: report.metrics.clone(),
            parameters: self.parameters.clone(),
            training_iteration: report.training_iteration,
            duration_seconds: report.time_total_s,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    /// Ran to the end of its budget.
    Completed,
    /// Stopped early by the scheduler.
    Pruned,
    Failed,
}

impl TrialStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Pruned | Self::Failed)
    }
}

/// Result of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: Uuid,
    pub trial_number: usize,
    pub objective: f64,
    pub metrics: BTreeMap<String, f64>,
    pub parameters: ParamMap,
    pub training_iteration: u64,
    pub duration_seconds: f64,
}
