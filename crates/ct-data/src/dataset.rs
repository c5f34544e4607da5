//! In-memory time-series datasets and batching.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

use ct_types::{DataError, TuneResult};

/// One parcel: a `sequencelength x ndims` observation matrix and its class.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: String,
    pub x: Vec<Vec<f64>>,
    pub y: usize,
}

/// A labelled set of equally shaped samples.
#[derive(Debug, Clone)]
pub struct TimeSeriesDataset {
    pub name: String,
    pub partition: String,
    pub samples: Vec<Sample>,
    pub nclasses: usize,
    pub sequencelength: usize,
    pub ndims: usize,
    pub class_names: Vec<String>,
}

impl TimeSeriesDataset {
    /// Build a dataset, checking that every sample matches the declared shape
    /// and label range.
    pub fn new(
        name: impl Into<String>,
        partition: impl Into<String>,
        samples: Vec<Sample>,
        class_names: Vec<String>,
    ) -> TuneResult<Self> {
        let name = name.into();
        let partition = partition.into();
        let nclasses = class_names.len();

        let first = samples.first().ok_or_else(|| DataError::InsufficientData {
            message: format!("dataset {name} partition {partition} has no samples"),
        })?;
        let sequencelength = first.x.len();
        let ndims = first.x.first().map(Vec::len).unwrap_or(0);
        if sequencelength == 0 || ndims == 0 {
            return Err(DataError::InvalidFormat {
                message: format!("sample {} has an empty observation matrix", first.id),
            }
            .into());
        }

        for sample in &samples {
            if sample.x.len() != sequencelength || sample.x.iter().any(|row| row.len() != ndims) {
                return Err(DataError::InvalidFormat {
                    message: format!(
                        "sample {} does not match shape {}x{}",
                        sample.id, sequencelength, ndims
                    ),
                }
                .into());
            }
            if sample.y >= nclasses {
                return Err(DataError::InvalidFormat {
                    message: format!(
                        "sample {} has label {} but only {} classes exist",
                        sample.id, sample.y, nclasses
                    ),
                }
                .into());
            }
        }

        Ok(Self {
            name,
            partition,
            samples,
            nclasses,
            sequencelength,
            ndims,
            class_names,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.nclasses];
        for sample in &self.samples {
            counts[sample.y] += 1;
        }
        counts
    }

    /// Index batches over the samples. With an RNG the order is shuffled
    /// first; the last batch may be smaller.
    pub fn batch_indices<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: Option<&mut R>,
    ) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }
}

/// Train and validation partitions prepared for one trial.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Arc<TimeSeriesDataset>,
    pub valid: Arc<TimeSeriesDataset>,
}

impl DatasetSplits {
    pub fn new(train: TimeSeriesDataset, valid: TimeSeriesDataset) -> TuneResult<Self> {
        if train.ndims != valid.ndims || train.sequencelength != valid.sequencelength {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "train shape {}x{} differs from valid shape {}x{}",
                    train.sequencelength, train.ndims, valid.sequencelength, valid.ndims
                ),
            }
            .into());
        }
        Ok(Self {
            train: Arc::new(train),
            valid: Arc::new(valid),
        })
    }
}

/// Bring a `T x D` series to exactly `samplet` time steps: evenly spaced
/// steps are kept when the series is longer, zero rows are appended when it
/// is shorter.
pub fn resample(series: &[Vec<f64>], samplet: usize) -> Vec<Vec<f64>> {
    let ndims = series.first().map(Vec::len).unwrap_or(0);
    if series.len() >= samplet {
        if samplet == 0 {
            return Vec::new();
        }
        if samplet == 1 {
            return vec![series[0].clone()];
        }
        let last = (series.len() - 1) as f64;
        (0..samplet)
            .map(|i| {
                let idx = (i as f64 * last / (samplet - 1) as f64).round() as usize;
                series[idx].clone()
            })
            .collect()
    } else {
        let mut out = series.to_vec();
        out.resize(samplet, vec![0.0; ndims]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(id: &str, y: usize) -> Sample {
        Sample {
            id: id.to_string(),
            x: vec![vec![0.0, 1.0]; 4],
            y,
        }
    }

    #[test]
    fn dataset_derives_shape() {
        let ds = TimeSeriesDataset::new(
            "toy",
            "train",
            vec![sample("1", 0), sample("2", 1), sample("3", 1)],
            vec!["grassland".into(), "maize".into()],
        )
        .unwrap();

        assert_eq!(ds.sequencelength, 4);
        assert_eq!(ds.ndims, 2);
        assert_eq!(ds.nclasses, 2);
        assert_eq!(ds.class_counts(), vec![1, 2]);
    }

    #[test]
    fn dataset_rejects_ragged_samples() {
        let mut bad = sample("2", 0);
        bad.x.pop();
        let result = TimeSeriesDataset::new("toy", "train", vec![sample("1", 0), bad], vec!["a".into()]);
        assert!(result.is_err());
    }

    #[test]
    fn dataset_rejects_out_of_range_label() {
        let result = TimeSeriesDataset::new("toy", "train", vec![sample("1", 3)], vec!["a".into()]);
        assert!(result.is_err());
    }

    #[test]
    fn batches_cover_every_sample_once() {
        let samples = (0..10).map(|i| sample(&i.to_string(), 0)).collect();
        let ds = TimeSeriesDataset::new("toy", "train", samples, vec!["a".into()]).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let batches = ds.batch_indices(4, Some(&mut rng));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);

        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn resample_shortens_and_pads() {
        let series: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let short = resample(&series, 4);
        assert_eq!(short.len(), 4);
        assert_eq!(short[0], vec![0.0]);
        assert_eq!(short[3], vec![9.0]);

        let padded = resample(&series[..2], 5);
        assert_eq!(padded.len(), 5);
        assert_eq!(padded[1], vec![1.0]);
        assert_eq!(padded[4], vec![0.0]);
    }
}
