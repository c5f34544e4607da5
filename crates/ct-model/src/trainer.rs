//! Mini-batch training and evaluation epochs producing statistic dictionaries.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

use ct_data::{DatasetSplits, TimeSeriesDataset};
use ct_types::{StatValue, Stats, TuneError, TuneResult};

use crate::metrics::ConfusionMatrix;
use crate::model::Model;
use crate::optim::Optimizer;

pub const DEFAULT_BATCH_SIZE: usize = 96;

/// Runs training and evaluation epochs for one model.
pub trait Trainer: Send {
    /// One pass over the training split; returns at least `loss`
    fn train_epoch(&mut self, epoch: usize) -> TuneResult<Stats>;

    /// One pass over the validation split; returns `loss`, `accuracy`,
    /// `kappa`, macro `precision`/`recall`/`f1` and the per-sample arrays
    fn test_epoch(&mut self) -> TuneResult<Stats>;

    fn model(&self) -> &dyn Model;

    fn model_mut(&mut self) -> &mut dyn Model;
}

/// Numerically stable log-softmax.
pub fn log_softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = logits.iter().map(|l| (l - max).exp()).sum::<f64>().ln() + max;
    logits.iter().map(|l| l - log_sum).collect()
}

pub struct EpochTrainer {
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    splits: DatasetSplits,
    batch_size: usize,
    rng: StdRng,
}

impl EpochTrainer {
    pub fn new(
        model: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        splits: DatasetSplits,
        batch_size: usize,
    ) -> Self {
        Self {
            model,
            optimizer,
            splits,
            batch_size: batch_size.max(1),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn splits(&self) -> &DatasetSplits {
        &self.splits
    }

    fn check_shape(&self, dataset: &TimeSeriesDataset) -> TuneResult<()> {
        let shape = self.model.shape();
        if dataset.ndims != shape.input_dims || dataset.nclasses != shape.nclasses {
            return Err(TuneError::Model(format!(
                "{} partition has {} bands / {} classes, model was built for {} / {}",
                dataset.partition, dataset.ndims, dataset.nclasses, shape.input_dims, shape.nclasses
            )));
        }
        Ok(())
    }
}

impl Trainer for EpochTrainer {
    fn train_epoch(&mut self, epoch: usize) -> TuneResult<Stats> {
        let started = Instant::now();
        let dataset = self.splits.train.clone();
        self.check_shape(&dataset)?;

        let mut total_loss = 0.0;
        let mut correct = 0usize;
        for batch in dataset.batch_indices(self.batch_size, Some(&mut self.rng)) {
            self.model.zero_grad();
            let scale = 1.0 / batch.len() as f64;
            for &idx in &batch {
                let sample = &dataset.samples[idx];
                let logp = log_softmax(&self.model.forward(&sample.x));
                total_loss -= logp[sample.y];
                if argmax(&logp) == sample.y {
                    correct += 1;
                }
                let grad: Vec<f64> = logp
                    .iter()
                    .enumerate()
                    .map(|(c, lp)| (lp.exp() - if c == sample.y { 1.0 } else { 0.0 }) * scale)
                    .collect();
                self.model.backward(&sample.x, &grad);
            }
            self.optimizer.step(&mut self.model.parameters_mut());
        }

        let n = dataset.len().max(1) as f64;
        let loss = total_loss / n;
        if !loss.is_finite() {
            tracing::warn!("Training loss diverged in epoch {}", epoch);
        }
        tracing::debug!(
            "epoch {}: train loss {:.4} ({:.2}s)",
            epoch,
            loss,
            started.elapsed().as_secs_f64()
        );

        let mut stats = Stats::new();
        stats.insert("loss".into(), StatValue::Scalar(loss));
        stats.insert("accuracy".into(), StatValue::Scalar(correct as f64 / n));
        Ok(stats)
    }

    fn test_epoch(&mut self) -> TuneResult<Stats> {
        let dataset = self.splits.valid.clone();
        self.check_shape(&dataset)?;

        let mut cm = ConfusionMatrix::new(dataset.nclasses);
        let mut total_loss = 0.0;
        let mut probas = Vec::with_capacity(dataset.len());
        let mut inputs = Vec::with_capacity(dataset.len());
        let mut targets = Vec::with_capacity(dataset.len());
        let mut ids = Vec::with_capacity(dataset.len());

        for sample in &dataset.samples {
            let logp = log_softmax(&self.model.forward(&sample.x));
            total_loss -= logp[sample.y];
            cm.add(sample.y, argmax(&logp));
            probas.push(logp.iter().map(|lp| lp.exp()).collect());
            inputs.push(sample.x.iter().flatten().copied().collect());
            targets.push(sample.y as f64);
            ids.push(sample.id.clone());
        }

        let mut stats = Stats::new();
        stats.insert("loss".into(), StatValue::Scalar(total_loss / dataset.len().max(1) as f64));
        stats.insert("accuracy".into(), StatValue::Scalar(cm.accuracy()));
        stats.insert("kappa".into(), StatValue::Scalar(cm.kappa()));
        stats.insert("precision".into(), StatValue::Scalar(cm.macro_precision()));
        stats.insert("recall".into(), StatValue::Scalar(cm.macro_recall()));
        stats.insert("f1".into(), StatValue::Scalar(cm.macro_f1()));
        stats.insert("confusion_matrix".into(), StatValue::Matrix(cm.to_rows()));
        stats.insert("probas".into(), StatValue::Matrix(probas));
        stats.insert("inputs".into(), StatValue::Matrix(inputs));
        stats.insert("targets".into(), StatValue::Vector(targets));
        stats.insert("ids".into(), StatValue::Labels(ids));
        Ok(stats)
    }

    fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    fn model_mut(&mut self) -> &mut dyn Model {
        self.model.as_mut()
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best, best_v)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearProbe;
    use crate::model::ModelShape;
    use crate::optim::{Adam, AdamSettings};
    use ct_data::{DatasetProvider, DatasetRequest, SyntheticDatasetProvider, SYNTHETIC_DATASET};
    use tempfile::TempDir;

    fn trainer(seed: u64) -> EpochTrainer {
        let splits = SyntheticDatasetProvider::new(3, 2)
            .with_sizes(60, 30)
            .with_noise(0.05)
            .prepare(&DatasetRequest::new(SYNTHETIC_DATASET, 12))
            .unwrap();
        let shape = ModelShape {
            nclasses: 3,
            seqlength: 12,
            input_dims: 2,
        };
        let optimizer = Adam::new(AdamSettings {
            learning_rate: 0.05,
            ..AdamSettings::default()
        });
        EpochTrainer::new(Box::new(LinearProbe::new(shape, seed)), Box::new(optimizer), splits, 16)
    }

    fn scalar(stats: &Stats, key: &str) -> f64 {
        stats[key].as_scalar().unwrap()
    }

    #[test]
    fn log_softmax_normalizes() {
        let logp = log_softmax(&[1000.0, 1000.0]);
        assert!((logp[0] - (0.5f64).ln()).abs() < 1e-12);
        let total: f64 = log_softmax(&[0.1, 2.0, -3.0]).iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn training_reduces_loss() {
        let mut trainer = trainer(5);
        let first = scalar(&trainer.train_epoch(0).unwrap(), "loss");
        let mut last = first;
        for epoch in 1..30 {
            last = scalar(&trainer.train_epoch(epoch).unwrap(), "loss");
        }
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_epoch_reports_metrics_and_arrays() {
        let mut trainer = trainer(1);
        let stats = trainer.test_epoch().unwrap();
        for key in ["loss", "accuracy", "kappa", "precision", "recall", "f1"] {
            assert!(scalar(&stats, key).is_finite(), "{key}");
        }
        for key in ["confusion_matrix", "probas", "inputs", "targets", "ids"] {
            assert!(stats[key].as_scalar().is_none(), "{key}");
        }
        match &stats["probas"] {
            StatValue::Matrix(rows) => assert_eq!(rows.len(), 30),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn restored_weights_reproduce_evaluation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");

        let mut trained = trainer(2);
        for epoch in 0..3 {
            trained.train_epoch(epoch).unwrap();
        }
        trained.model().state_dict().save_json(&path).unwrap();
        let expected = trained.test_epoch().unwrap();

        let mut fresh = trainer(99);
        let state = crate::tensor::StateDict::load_json(&path).unwrap();
        fresh.model_mut().load_state_dict(&state).unwrap();
        assert_eq!(fresh.test_epoch().unwrap(), expected);
    }
}
