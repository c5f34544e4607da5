pub mod cache;
pub mod classmapping;
pub mod dataset;
pub mod loaders;
pub mod providers;
pub mod request;
pub mod synthetic;

pub use cache::*;
pub use classmapping::*;
pub use dataset::*;
pub use loaders::*;
pub use providers::*;
pub use request::*;
pub use synthetic::*;

use std::path::PathBuf;
use std::sync::Arc;

use ct_types::{DataError, TuneResult};

/// Environment variable overriding the dataset root directory.
pub const DATA_ROOT_ENV: &str = "CROPTUNE_DATA_ROOT";

/// Resolve the dataset root: `$CROPTUNE_DATA_ROOT`, else `<home>/data`.
pub fn data_root() -> TuneResult<PathBuf> {
    if let Ok(root) = std::env::var(DATA_ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    dirs::home_dir()
        .map(|home| home.join("data"))
        .ok_or_else(|| {
            ct_types::TuneError::Config(format!(
                "cannot locate the dataset root: set {} or HOME",
                DATA_ROOT_ENV
            ))
        })
}

/// Data manager coordinates dataset preparation across providers and the
/// shared split cache.
#[derive(Debug, Default)]
pub struct DataManager {
    pub cache: DatasetCache,
    pub providers: Vec<Arc<dyn DatasetProvider>>,
}

impl DataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with the synthetic provider and a parcel CSV provider rooted
    /// at `root`.
    pub fn with_data_root(root: impl Into<PathBuf>) -> Self {
        let mut manager = Self::new();
        manager.add_provider(Arc::new(SyntheticDatasetProvider::new(4, 6)));
        manager.add_provider(Arc::new(CsvDatasetProvider::new(root.into())));
        manager
    }

    pub fn add_provider(&mut self, provider: Arc<dyn DatasetProvider>) {
        self.providers.push(provider);
    }

    /// Prepare the splits for `request`, serving repeated requests from the
    /// cache. Providers are tried in registration order.
    pub fn prepare_dataset(&self, request: &DatasetRequest) -> TuneResult<DatasetSplits> {
        let key = request.cache_key();
        if let Some(splits) = self.cache.get(&key) {
            tracing::debug!("Dataset cache hit for {}", request.dataset);
            return Ok(splits);
        }

        let provider = self
            .providers
            .iter()
            .find(|p| p.supports_dataset(&request.dataset))
            .ok_or_else(|| DataError::UnknownDataset {
                name: request.dataset.clone(),
            })?;

        tracing::info!("Preparing dataset {} with {}", request.dataset, provider.name());
        let splits = provider.prepare(request)?;
        self.cache.store(&key, &splits);
        Ok(splits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_caches_prepared_splits() {
        let mut manager = DataManager::new();
        manager.add_provider(Arc::new(SyntheticDatasetProvider::new(2, 3).with_sizes(6, 2)));

        let request = DatasetRequest::new(SYNTHETIC_DATASET, 5);
        let first = manager.prepare_dataset(&request).unwrap();
        let second = manager.prepare_dataset(&request).unwrap();

        assert!(Arc::ptr_eq(&first.train, &second.train));
        assert_eq!(manager.cache.get_stats().stores, 1);
    }

    #[test]
    fn manager_rejects_unknown_dataset() {
        let manager = DataManager::new();
        let result = manager.prepare_dataset(&DatasetRequest::new("BavarianCrops", 5));
        assert!(matches!(
            result,
            Err(ct_types::TuneError::Data(DataError::UnknownDataset { .. }))
        ));
    }
}
