//! Command-line arguments of the `croptune` binary.

use clap::Parser;
use std::path::PathBuf;

use ct_types::{config_error, TuneResult};

use crate::experiments::ExperimentTemplate;
use crate::resources::TrialResources;
use crate::trial::TuneConfig;

/// Directory under the home directory that holds experiment runs.
pub const DEFAULT_RESULTS_DIR: &str = "ray_results";

/// Tune hyperparameters of a crop classification model
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "croptune", version)]
pub struct TuneArgs {
    /// Experiment to tune: rnn, transformer, conv1d or linear
    pub experiment: String,

    /// Batch size
    #[arg(short, long, default_value_t = 96)]
    pub batchsize: i64,

    /// CPUs reserved per trial
    #[arg(short, long, default_value_t = 2.0)]
    pub cpu: f64,

    /// Worker threads used to parse dataset files
    #[arg(short, long, default_value_t = 2)]
    pub workers: i64,

    /// GPU share reserved per trial
    #[arg(short, long, default_value_t = 0.2)]
    pub gpu: f64,

    /// Root directory of experiment runs (default: $HOME/ray_results)
    #[arg(short = 'r', long)]
    pub local_dir: Option<PathBuf>,

    /// Maximum number of trials
    #[arg(long, default_value_t = 300)]
    pub num_samples: usize,

    /// Maximum number of trials running at once
    #[arg(long, default_value_t = 4)]
    pub max_concurrent: usize,

    /// Override the experiment's model type
    #[arg(long)]
    pub model: Option<String>,

    /// GPUs available to the run (default: from CUDA_VISIBLE_DEVICES)
    #[arg(long)]
    pub num_gpus: Option<f64>,

    /// Seed for search and scheduling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Start from scratch even if a saved experiment state exists
    #[arg(long)]
    pub no_resume: bool,

    /// Also write the result table to this CSV file
    #[arg(long)]
    pub export: Option<PathBuf>,
}

impl TuneArgs {
    /// `--local-dir`, else `<home>/ray_results`.
    pub fn local_dir(&self) -> TuneResult<PathBuf> {
        if let Some(dir) = &self.local_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(DEFAULT_RESULTS_DIR))
            .ok_or_else(|| config_error!("cannot locate the home directory; pass --local-dir"))
    }

    pub fn tune_config(&self) -> TuneResult<TuneConfig> {
        let mut config = TuneConfig::new(&self.experiment, self.local_dir()?)
            .with_num_samples(self.num_samples)
            .with_max_concurrent(self.max_concurrent)
            .with_resources(TrialResources::new(self.cpu, self.gpu))
            .with_resume(!self.no_resume);
        if let Some(gpus) = self.num_gpus {
            config = config.with_total_gpus(gpus);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        Ok(config)
    }

    /// Layer the run-level arguments over the experiment constants.
    pub fn apply(&self, template: ExperimentTemplate) -> ExperimentTemplate {
        let template = template
            .with_constant("batchsize", self.batchsize)
            .with_constant("workers", self.workers);
        match &self.model {
            Some(model) => template.with_constant("model", model.as_str()),
            None => template,
        }
    }
}
