use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ct_types::{TrialConfig, TuneError, TuneResult};

use crate::linear::LinearProbe;
use crate::tensor::{Parameter, StateDict};

/// Input/output dimensions a model is built for, taken from the training split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub nclasses: usize,
    pub seqlength: usize,
    pub input_dims: usize,
}

/// Sequence classifier driven by the epoch trainer.
pub trait Model: Send + fmt::Debug {
    /// Registry key this model was built under
    fn kind(&self) -> &str;

    fn shape(&self) -> ModelShape;

    /// Class logits for one `seqlength x input_dims` sample
    fn forward(&self, x: &[Vec<f64>]) -> Vec<f64>;

    /// Accumulate parameter gradients given the loss gradient w.r.t. the logits
    fn backward(&mut self, x: &[Vec<f64>], grad_logits: &[f64]);

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    fn num_trainable(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.requires_grad)
            .map(|p| p.value.numel())
            .sum()
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for param in self.parameters() {
            state.insert(param.name.clone(), param.value.clone());
        }
        state
    }

    /// Replace every parameter with the tensor of the same name. Missing
    /// names and shape mismatches are errors; nothing is modified then.
    fn load_state_dict(&mut self, state: &StateDict) -> TuneResult<()> {
        for param in self.parameters() {
            let tensor = state.get(&param.name).ok_or_else(|| {
                TuneError::Checkpoint(format!("checkpoint has no tensor '{}'", param.name))
            })?;
            if tensor.shape != param.value.shape || tensor.numel() != param.value.numel() {
                return Err(TuneError::Checkpoint(format!(
                    "tensor '{}' has shape {:?}, model expects {:?}",
                    param.name, tensor.shape, param.value.shape
                )));
            }
        }
        for param in self.parameters_mut() {
            if let Some(tensor) = state.get(&param.name) {
                param.value.data.copy_from_slice(&tensor.data);
            }
        }
        Ok(())
    }
}

/// Constructor for one model type.
pub type ModelBuilder =
    Arc<dyn Fn(&ModelShape, &TrialConfig) -> TuneResult<Box<dyn Model>> + Send + Sync>;

/// Model constructors keyed by the `model` configuration string.
#[derive(Clone)]
pub struct ModelRegistry {
    builders: BTreeMap<String, ModelBuilder>,
}

impl ModelRegistry {
    /// Empty registry without any backend
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `linear` baseline
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(LinearProbe::KIND, |shape, config| {
            Ok(Box::new(LinearProbe::from_config(*shape, config)?) as Box<dyn Model>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, builder: F)
    where
        F: Fn(&ModelShape, &TrialConfig) -> TuneResult<Box<dyn Model>> + Send + Sync + 'static,
    {
        self.builders.insert(kind.into(), Arc::new(builder));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    pub fn build(&self, kind: &str, shape: &ModelShape, config: &TrialConfig) -> TuneResult<Box<dyn Model>> {
        let builder = self.builders.get(kind).ok_or_else(|| {
            TuneError::Model(format!(
                "no backend registered for model type '{}' (registered: {})",
                kind,
                self.kinds().join(", ")
            ))
        })?;
        tracing::debug!(
            "Building {} model for {} classes, {}x{} input",
            kind,
            shape.nclasses,
            shape.seqlength,
            shape.input_dims
        );
        builder(shape, config)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
