use std::collections::HashSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use ct_types::{DataError, TuneResult};

use crate::classmapping::ClassMapping;
use crate::dataset::{resample, DatasetSplits, Sample, TimeSeriesDataset};
use crate::loaders::{read_id_list, Parcel, ParcelLoader};
use crate::request::DatasetRequest;

/// Trait for dataset providers (parcel CSV trees, synthetic generators, ...)
pub trait DatasetProvider: Send + Sync + Debug {
    /// Check if this provider can build the named dataset
    fn supports_dataset(&self, dataset: &str) -> bool;

    /// Build the train and validation partitions described by `request`
    fn prepare(&self, request: &DatasetRequest) -> TuneResult<DatasetSplits>;

    /// Get provider name
    fn name(&self) -> &str;
}

/// Which slice of a parcel pool a partition name selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Train,
    Valid,
    TrainValid,
}

impl Partition {
    pub fn parse(name: &str) -> TuneResult<Self> {
        match name {
            "train" => Ok(Self::Train),
            "valid" | "eval" => Ok(Self::Valid),
            "trainvalid" => Ok(Self::TrainValid),
            other => Err(DataError::InvalidFormat {
                message: format!("unknown partition '{}' (expected train, valid or trainvalid)", other),
            }
            .into()),
        }
    }

    /// Deterministic hold-out assignment: the same id always lands in the
    /// same partition for a given fraction.
    pub fn contains(self, id: i64, valid_fraction: f64) -> bool {
        let held_out = unit_hash(id) < valid_fraction;
        match self {
            Self::Train => !held_out,
            Self::Valid => held_out,
            Self::TrainValid => true,
        }
    }
}

/// Map an id to [0, 1) with a splitmix64 finalizer.
fn unit_hash(id: i64) -> f64 {
    let mut z = (id as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// Parcel CSV tree provider: `<root>/<dataset>/csv/<region>/<id>.csv`.
#[derive(Debug)]
pub struct CsvDatasetProvider {
    pub name: String,
    pub data_root: PathBuf,
}

impl CsvDatasetProvider {
    pub fn new<P: AsRef<Path>>(data_root: P) -> Self {
        Self {
            name: "CSV Parcel Provider".to_string(),
            data_root: data_root.as_ref().to_path_buf(),
        }
    }

    fn load_pool(
        &self,
        loader: &ParcelLoader,
        dataset: &str,
        regions: &[String],
        ids: Option<&HashSet<i64>>,
    ) -> TuneResult<Vec<Parcel>> {
        if regions.is_empty() {
            return Err(DataError::InsufficientData {
                message: format!("no regions requested for dataset {}", dataset),
            }
            .into());
        }
        let mut pool = Vec::new();
        for region in regions {
            pool.extend(loader.load_region(&self.data_root, dataset, region, ids)?);
        }
        Ok(pool)
    }

    fn to_dataset(
        request: &DatasetRequest,
        partition_name: &str,
        parcels: &[Parcel],
        select: impl Fn(i64) -> bool,
        mapping: &ClassMapping,
    ) -> TuneResult<TimeSeriesDataset> {
        let mut skipped = 0usize;
        let mut samples = Vec::new();
        for parcel in parcels.iter().filter(|p| select(p.id)) {
            match parcel.code.and_then(|code| mapping.class_of(code)) {
                Some(y) => samples.push(Sample {
                    id: parcel.id.to_string(),
                    x: resample(&parcel.series, request.samplet),
                    y,
                }),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(
                "Skipped {} parcels without a mapped class in partition {}",
                skipped,
                partition_name
            );
        }
        TimeSeriesDataset::new(
            request.dataset.clone(),
            partition_name,
            samples,
            mapping.class_names().to_vec(),
        )
    }
}

impl DatasetProvider for CsvDatasetProvider {
    fn supports_dataset(&self, dataset: &str) -> bool {
        self.data_root.join(dataset).is_dir()
    }

    fn prepare(&self, request: &DatasetRequest) -> TuneResult<DatasetSplits> {
        let mapping_path = request.classmapping.as_ref().ok_or_else(|| DataError::InvalidFormat {
            message: format!("dataset {} needs a classmapping file", request.dataset),
        })?;
        let mapping = ClassMapping::load(mapping_path)?;
        let loader = ParcelLoader::with_workers(request.workers);

        let train_ids: Option<HashSet<i64>> = match &request.trainids {
            Some(path) => Some(read_id_list(path)?.into_iter().collect()),
            None => None,
        };
        let train_pool = self.load_pool(&loader, &request.dataset, &request.trainregions, train_ids.as_ref())?;

        let train_on = Partition::parse(&request.train_on)?;
        let fraction = request.valid_fraction;
        let train = Self::to_dataset(request, &request.train_on, &train_pool, |id| train_on.contains(id, fraction), &mapping)?;

        let valid = match &request.testids {
            Some(path) => {
                let test_ids: HashSet<i64> = read_id_list(path)?.into_iter().collect();
                let regions = if request.testregions.is_empty() {
                    &request.trainregions
                } else {
                    &request.testregions
                };
                let test_pool = self.load_pool(&loader, &request.dataset, regions, Some(&test_ids))?;
                Self::to_dataset(request, &request.test_on, &test_pool, |_| true, &mapping)?
            }
            None => {
                let test_on = Partition::parse(&request.test_on)?;
                let same_regions =
                    request.testregions.is_empty() || request.testregions == request.trainregions;
                if same_regions {
                    Self::to_dataset(request, &request.test_on, &train_pool, |id| test_on.contains(id, fraction), &mapping)?
                } else {
                    let test_pool =
                        self.load_pool(&loader, &request.dataset, &request.testregions, train_ids.as_ref())?;
                    Self::to_dataset(request, &request.test_on, &test_pool, |id| test_on.contains(id, fraction), &mapping)?
                }
            }
        };

        tracing::info!(
            "Prepared dataset {}: {} train / {} valid samples, {} classes, {}x{}",
            request.dataset,
            train.len(),
            valid.len(),
            train.nclasses,
            train.sequencelength,
            train.ndims
        );
        DatasetSplits::new(train, valid)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_tree(root: &Path, n: i64) -> (PathBuf, PathBuf) {
        let region = ParcelLoader::region_dir(root, "BavarianCrops", "HOLL_2018_MT_pilot");
        fs::create_dir_all(&region).unwrap();
        for id in 0..n {
            let code = if id % 2 == 0 { 1 } else { 411 };
            let mut file = fs::File::create(region.join(format!("{id}.csv"))).unwrap();
            writeln!(file, "B2,B3,label").unwrap();
            for t in 0..6 {
                writeln!(file, "{},{},{}", t + id, t * 2, code).unwrap();
            }
        }
        // one parcel with a code outside the mapping
        let mut file = fs::File::create(region.join(format!("{n}.csv"))).unwrap();
        writeln!(file, "B2,B3,label").unwrap();
        writeln!(file, "1,1,999").unwrap();

        let mapping = root.join("classmapping.csv");
        fs::write(&mapping, "id,classid,classname\n1,0,grassland\n411,1,maize\n").unwrap();

        let ids = root.join("train.txt");
        let listed: Vec<String> = (0..=n).map(|i| i.to_string()).collect();
        fs::write(&ids, listed.join("\n")).unwrap();
        (mapping, ids)
    }

    #[test]
    fn partition_assignment_is_disjoint_and_stable() {
        for id in 0..200 {
            let train = Partition::Train.contains(id, 0.25);
            let valid = Partition::Valid.contains(id, 0.25);
            assert_ne!(train, valid);
            assert!(Partition::TrainValid.contains(id, 0.25));
            assert_eq!(valid, Partition::Valid.contains(id, 0.25));
        }
        let held_out = (0..1000).filter(|id| Partition::Valid.contains(*id, 0.25)).count();
        assert!(held_out > 150 && held_out < 350, "held out {held_out}");
    }

    #[test]
    fn unknown_partition_fails() {
        assert!(Partition::parse("test").is_err());
        assert_eq!(Partition::parse("eval").unwrap(), Partition::Valid);
    }

    #[test]
    fn csv_provider_builds_disjoint_splits() {
        let root = TempDir::new().unwrap();
        let (mapping, ids) = write_tree(root.path(), 40);

        let provider = CsvDatasetProvider::new(root.path());
        assert!(provider.supports_dataset("BavarianCrops"));
        assert!(!provider.supports_dataset("Other"));

        let request = DatasetRequest::new("BavarianCrops", 4)
            .with_classmapping(&mapping)
            .with_trainids(&ids)
            .with_regions(vec!["HOLL_2018_MT_pilot".into()], vec!["HOLL_2018_MT_pilot".into()]);
        let splits = provider.prepare(&request).unwrap();

        assert_eq!(splits.train.len() + splits.valid.len(), 40);
        assert_eq!(splits.train.nclasses, 2);
        assert_eq!(splits.train.sequencelength, 4);
        assert_eq!(splits.train.ndims, 2);

        let train_ids: HashSet<&str> = splits.train.samples.iter().map(|s| s.id.as_str()).collect();
        assert!(splits.valid.samples.iter().all(|s| !train_ids.contains(s.id.as_str())));
    }

    #[test]
    fn csv_provider_requires_classmapping() {
        let root = TempDir::new().unwrap();
        write_tree(root.path(), 4);
        let provider = CsvDatasetProvider::new(root.path());
        let request = DatasetRequest::new("BavarianCrops", 4)
            .with_regions(vec!["HOLL_2018_MT_pilot".into()], vec![]);
        assert!(provider.prepare(&request).is_err());
    }
}
