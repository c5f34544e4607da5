use thiserror::Error;

/// Main error type for the CropTune system
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Unknown experiment '{name}' (known experiments: {known})")]
    UnknownExperiment { name: String, known: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data source not found: {0}")]
    SourceNotFound(String),

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },

    #[error("Unknown dataset: {name}")]
    UnknownDataset { name: String },
}

/// Errors raised while driving a single trial
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Missing config key: {key}")]
    MissingKey { key: String },

    #[error("Config key {key} has wrong type: expected {expected}")]
    WrongType { key: String, expected: String },

    #[error("Trainable used before setup")]
    NotConfigured,

    #[error("Metric '{metric}' missing from report")]
    MissingMetric { metric: String },

    #[error("Trainable panicked: {message}")]
    Panicked { message: String },

    #[error("Worker disconnected: {message}")]
    WorkerLost { message: String },
}

/// Result type alias for CropTune operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
