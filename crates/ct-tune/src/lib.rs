//! # ct-tune
//!
//! Hyperparameter tuning for crop classification models.
//!
//! Provides the experiment catalog, search spaces and strategies (grid,
//! random, TPE), the ASHA scheduler, the trainable actor and the threaded
//! run driver with checkpointing, resume and result export.

pub mod algorithm;
pub mod checkpoint;
pub mod cli;
pub mod experiments;
pub mod resources;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod search;
pub mod state;
pub mod trainable;
pub mod trial;

pub use algorithm::{SearchAlgorithm, Suggestion};
pub use checkpoint::{checkpoint_dir, CheckpointHistory, CheckpointRecord};
pub use cli::TuneArgs;
pub use experiments::{ExperimentCatalog, ExperimentDefinition, ExperimentTemplate, SEED_POINTS};
pub use resources::{ClusterResources, TrialResources, WorkerAllocation};
pub use results::{append_best_summary, ResultRow, ResultTable, TrialLogger};
pub use runner::{StopHandle, TuneAnalysis, TuneRunner};
pub use scheduler::{AsyncHyperBandScheduler, FifoScheduler, SchedulerConfig, SchedulerDecision, TrialScheduler};
pub use search::{
    GridSearch, ParameterDef, ParameterKind, RandomSearch, SearchSpace, SearchStrategy, TpeSearch,
};
pub use state::ExperimentState;
pub use trainable::{ActorState, CropTrainable, Trainable, TrainableFactory};
pub use trial::{
    ObjectiveDirection, RunState, RunStatus, Trial, TrialResult, TrialStatus, TuneConfig,
};
