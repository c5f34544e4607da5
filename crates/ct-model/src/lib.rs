//! Collaborators the trainable actor drives: models built from a registry,
//! the Adam optimizer and the epoch trainer with its classification metrics.

pub mod linear;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod tensor;
pub mod trainer;

pub use linear::LinearProbe;
pub use metrics::ConfusionMatrix;
pub use model::{Model, ModelBuilder, ModelRegistry, ModelShape};
pub use optim::{Adam, AdamSettings, Optimizer};
pub use tensor::{Parameter, StateDict, Tensor};
pub use trainer::{log_softmax, EpochTrainer, Trainer, DEFAULT_BATCH_SIZE};
