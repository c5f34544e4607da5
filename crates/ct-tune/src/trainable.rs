//! The trainable actor: one model configuration trained round by round.
//!
//! A round runs `epochs` training epochs followed by exactly one evaluation
//! pass. The run driver owns one actor per worker and reuses it across
//! trials through [`Trainable::reset`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ct_data::{DataManager, DatasetRequest};
use ct_model::{Adam, AdamSettings, EpochTrainer, ModelRegistry, ModelShape, StateDict, Trainer, DEFAULT_BATCH_SIZE};
use ct_types::{scalar_stats, validation_error, StatValue, TrialConfig, TrialError, TuneResult};

/// Weights file written into each checkpoint directory.
pub const MODEL_FILE: &str = "model.json";

/// Evaluation statistics that never reach a metric report.
pub const EXCLUDED_STATS: &[&str] = &["inputs", "ids", "confusion_matrix", "probas"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Uninitialized,
    Configured,
    Evaluated,
    Checkpointed,
    Restored,
    Terminated,
}

/// Lifecycle the run driver drives an actor through.
pub trait Trainable: Send {
    fn setup(&mut self, config: &TrialConfig) -> TuneResult<()>;

    /// One round; returns the scalar metrics of the evaluation pass.
    fn step(&mut self) -> TuneResult<BTreeMap<String, f64>>;

    /// Write the current weights under `dir`, returning the file path.
    fn save(&mut self, dir: &Path) -> TuneResult<PathBuf>;

    fn restore(&mut self, path: &Path) -> TuneResult<()>;

    /// Reconfigure in place for a new trial.
    fn reset(&mut self, config: &TrialConfig) -> TuneResult<()> {
        self.setup(config)
    }

    fn stop(&mut self);

    fn state(&self) -> ActorState;
}

/// Builds a fresh actor for each worker.
pub type TrainableFactory = Arc<dyn Fn() -> Box<dyn Trainable> + Send + Sync>;

/// Trains registry models on provider datasets with Adam.
pub struct CropTrainable {
    data: Arc<DataManager>,
    registry: Arc<ModelRegistry>,
    trainer: Option<EpochTrainer>,
    epochs: usize,
    epoch: usize,
    state: ActorState,
}

impl CropTrainable {
    pub fn new(data: Arc<DataManager>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            data,
            registry,
            trainer: None,
            epochs: 0,
            epoch: 0,
            state: ActorState::Uninitialized,
        }
    }

    /// Factory sharing one data manager (and its split cache) across actors.
    pub fn factory(data: Arc<DataManager>, registry: Arc<ModelRegistry>) -> TrainableFactory {
        Arc::new(move || Box::new(CropTrainable::new(data.clone(), registry.clone())) as Box<dyn Trainable>)
    }

    fn trainer_mut(&mut self) -> TuneResult<&mut EpochTrainer> {
        self.trainer
            .as_mut()
            .ok_or_else(|| TrialError::NotConfigured.into())
    }

    /// Evaluation output of the current model; no training happens.
    pub fn evaluate(&mut self) -> TuneResult<ct_types::Stats> {
        self.trainer_mut()?.test_epoch()
    }
}

impl Trainable for CropTrainable {
    fn setup(&mut self, config: &TrialConfig) -> TuneResult<()> {
        let epochs = config.get_usize("epochs")?;
        if epochs == 0 {
            return Err(validation_error!("epochs must be at least 1"));
        }

        let request = DatasetRequest::from_config(config)?;
        let splits = self.data.prepare_dataset(&request)?;
        let shape = ModelShape {
            nclasses: splits.train.nclasses,
            seqlength: splits.train.sequencelength,
            input_dims: splits.train.ndims,
        };

        let kind = config.get_str("model")?;
        let model = self.registry.build(kind, &shape, config)?;
        let optimizer = Adam::new(AdamSettings::from_config(config)?);
        let batch_size = if config.contains("batchsize") {
            config.get_usize("batchsize")?
        } else {
            DEFAULT_BATCH_SIZE
        };

        tracing::info!(
            "Setting up {} model ({} trainable parameters) on {}: {} train / {} valid samples, {} classes",
            kind,
            model.num_trainable(),
            request.dataset,
            splits.train.len(),
            splits.valid.len(),
            shape.nclasses
        );

        let mut trainer = EpochTrainer::new(model, Box::new(optimizer), splits, batch_size);
        if config.contains("seed") {
            trainer = trainer.with_seed(config.get_usize("seed")? as u64);
        }

        self.trainer = Some(trainer);
        self.epochs = epochs;
        self.epoch = 0;
        self.state = ActorState::Configured;
        Ok(())
    }

    fn step(&mut self) -> TuneResult<BTreeMap<String, f64>> {
        let epochs = self.epochs;
        let first_epoch = self.epoch;
        let trainer = self.trainer_mut()?;

        let mut train_stats = ct_types::Stats::new();
        for e in 0..epochs {
            train_stats = trainer.train_epoch(first_epoch + e)?;
        }
        let stats = trainer.test_epoch()?;
        self.epoch += epochs;

        let mut metrics = scalar_stats(&stats);
        for key in EXCLUDED_STATS {
            metrics.remove(*key);
        }

        let trainloss = train_stats
            .get("loss")
            .and_then(StatValue::as_scalar)
            .ok_or_else(|| TrialError::MissingMetric {
                metric: "trainloss".to_string(),
            })?;
        let loss = metrics.get("loss").copied().ok_or_else(|| TrialError::MissingMetric {
            metric: "loss".to_string(),
        })?;
        metrics.insert("trainloss".to_string(), trainloss);
        metrics.insert("lossdelta".to_string(), trainloss - loss);

        tracing::debug!(
            "Round done after epoch {}: loss {:.4}, trainloss {:.4}",
            self.epoch,
            loss,
            trainloss
        );
        self.state = ActorState::Evaluated;
        Ok(metrics)
    }

    fn save(&mut self, dir: &Path) -> TuneResult<PathBuf> {
        let trainer = self.trainer_mut()?;
        fs::create_dir_all(dir)?;
        let path = dir.join(MODEL_FILE);
        trainer.model().state_dict().save_json(&path)?;
        self.state = ActorState::Checkpointed;
        Ok(path)
    }

    fn restore(&mut self, path: &Path) -> TuneResult<()> {
        let state = StateDict::load_json(path)?;
        self.trainer_mut()?.model_mut().load_state_dict(&state)?;
        tracing::debug!("Restored weights from {}", path.display());
        self.state = ActorState::Restored;
        Ok(())
    }

    fn reset(&mut self, config: &TrialConfig) -> TuneResult<()> {
        tracing::debug!("Reusing actor for a new trial");
        self.trainer = None;
        self.state = ActorState::Uninitialized;
        self.setup(config)
    }

    fn stop(&mut self) {
        self.trainer = None;
        self.state = ActorState::Terminated;
    }

    fn state(&self) -> ActorState {
        self.state
    }
}

impl fmt::Debug for CropTrainable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CropTrainable")
            .field("state", &self.state)
            .field("epochs", &self.epochs)
            .field("epoch", &self.epoch)
            .finish()
    }
}
