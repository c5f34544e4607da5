//! Dataset request derived from a trial configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use ct_types::{TrialConfig, TuneResult};

/// Default fraction of the training id list held out as the `valid`
/// partition when no separate test id list is given.
pub const DEFAULT_VALID_FRACTION: f64 = 0.25;

/// Everything a dataset provider needs to build the train/valid splits of a
/// trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRequest {
    pub dataset: String,
    pub trainids: Option<PathBuf>,
    pub testids: Option<PathBuf>,
    pub classmapping: Option<PathBuf>,
    pub trainregions: Vec<String>,
    pub testregions: Vec<String>,
    pub train_on: String,
    pub test_on: String,
    pub samplet: usize,
    pub workers: usize,
    pub valid_fraction: f64,
}

impl DatasetRequest {
    pub fn new(dataset: impl Into<String>, samplet: usize) -> Self {
        Self {
            dataset: dataset.into(),
            trainids: None,
            testids: None,
            classmapping: None,
            trainregions: Vec::new(),
            testregions: Vec::new(),
            train_on: "train".to_string(),
            test_on: "valid".to_string(),
            samplet,
            workers: 2,
            valid_fraction: DEFAULT_VALID_FRACTION,
        }
    }

    /// Read the dataset keys of a trial config. `dataset` and `samplet` are
    /// required, everything else has a default.
    pub fn from_config(config: &TrialConfig) -> TuneResult<Self> {
        let mut request = Self::new(config.get_str("dataset")?, config.get_usize("samplet")?);

        request.trainids = config.get_opt_str("trainids")?.map(PathBuf::from);
        request.testids = config.get_opt_str("testids")?.map(PathBuf::from);
        request.classmapping = config.get_opt_str("classmapping")?.map(PathBuf::from);
        if config.contains("trainregions") {
            request.trainregions = config.get_str_list("trainregions")?;
        }
        if config.contains("testregions") {
            request.testregions = config.get_str_list("testregions")?;
        }
        if let Some(train_on) = config.get_opt_str("train_on")? {
            request.train_on = train_on.to_string();
        }
        if let Some(test_on) = config.get_opt_str("test_on")? {
            request.test_on = test_on.to_string();
        }
        if config.contains("workers") {
            request.workers = config.get_usize("workers")?.max(1);
        }
        if config.contains("valid_fraction") {
            request.valid_fraction = config.get_f64("valid_fraction")?.clamp(0.0, 1.0);
        }

        Ok(request)
    }

    pub fn with_classmapping(mut self, path: impl AsRef<Path>) -> Self {
        self.classmapping = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_trainids(mut self, path: impl AsRef<Path>) -> Self {
        self.trainids = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_regions(mut self, train: Vec<String>, test: Vec<String>) -> Self {
        self.trainregions = train;
        self.testregions = test;
        self
    }

    /// Stable identity used by the dataset cache. The worker count does not
    /// change the loaded data and is left out.
    pub fn cache_key(&self) -> String {
        let mut keyed = self.clone();
        keyed.workers = 0;
        serde_json::to_string(&keyed).unwrap_or_else(|_| format!("{keyed:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_types::ParameterValue;
    use serde_json::json;

    #[test]
    fn request_from_config() {
        let mut config = TrialConfig::default();
        config.insert("dataset", "BavarianCrops");
        config.insert("samplet", 50i64);
        config.insert("trainids", "/data/ids/train.txt");
        config.insert("testids", ParameterValue::Json(serde_json::Value::Null));
        config.insert("classmapping", "/data/classmapping.csv");
        config.insert("trainregions", ParameterValue::Json(json!(["HOLL_2018_MT_pilot"])));
        config.insert("workers", 4i64);

        let request = DatasetRequest::from_config(&config).unwrap();
        assert_eq!(request.dataset, "BavarianCrops");
        assert_eq!(request.samplet, 50);
        assert_eq!(request.trainids, Some(PathBuf::from("/data/ids/train.txt")));
        assert_eq!(request.testids, None);
        assert_eq!(request.trainregions, vec!["HOLL_2018_MT_pilot"]);
        assert!(request.testregions.is_empty());
        assert_eq!(request.train_on, "train");
        assert_eq!(request.test_on, "valid");
        assert_eq!(request.workers, 4);
    }

    #[test]
    fn request_requires_dataset_and_samplet() {
        let mut config = TrialConfig::default();
        config.insert("dataset", "BavarianCrops");
        assert!(DatasetRequest::from_config(&config).is_err());
    }

    #[test]
    fn cache_key_ignores_workers() {
        let mut a = DatasetRequest::new("synthetic", 20);
        let mut b = a.clone();
        a.workers = 1;
        b.workers = 8;
        assert_eq!(a.cache_key(), b.cache_key());

        b.samplet = 30;
        assert_ne!(a.cache_key(), b.cache_key());
    }
}
