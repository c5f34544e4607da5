//! Softmax regression over time-pooled band statistics.
//!
//! Each sample is reduced to the per-band mean and standard deviation over
//! time, giving `2 * input_dims` features; a single dense layer maps them to
//! class logits.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ct_types::{TrialConfig, TuneError, TuneResult};

use crate::model::{Model, ModelShape};
use crate::tensor::{Parameter, Tensor};

#[derive(Debug, Clone)]
pub struct LinearProbe {
    shape: ModelShape,
    weight: Parameter,
    bias: Parameter,
}

impl LinearProbe {
    pub const KIND: &'static str = "linear";

    /// Uniform initialisation in `±1/sqrt(fan_in)`.
    pub fn new(shape: ModelShape, seed: u64) -> Self {
        let features = 2 * shape.input_dims;
        let bound = 1.0 / (features.max(1) as f64).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut weight = Tensor::zeros(vec![shape.nclasses, features]);
        weight
            .data
            .iter_mut()
            .for_each(|w| *w = rng.random_range(-bound..=bound));
        let mut bias = Tensor::zeros(vec![shape.nclasses]);
        bias.data
            .iter_mut()
            .for_each(|b| *b = rng.random_range(-bound..=bound));

        Self {
            shape,
            weight: Parameter::new("weight", weight),
            bias: Parameter::new("bias", bias),
        }
    }

    /// Reads the optional `seed` key (default 0).
    pub fn from_config(shape: ModelShape, config: &TrialConfig) -> TuneResult<Self> {
        if shape.nclasses == 0 || shape.input_dims == 0 {
            return Err(TuneError::Model(format!(
                "linear model needs classes and input bands, got {:?}",
                shape
            )));
        }
        let seed = match config.get("seed") {
            Some(value) => value
                .as_i64()
                .ok_or_else(|| TuneError::Model("seed must be an integer".to_string()))?,
            None => 0,
        };
        Ok(Self::new(shape, seed as u64))
    }

    fn features(&self, x: &[Vec<f64>]) -> Vec<f64> {
        let dims = self.shape.input_dims;
        let steps = x.len().max(1) as f64;
        let mut mean = vec![0.0; dims];
        for row in x {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / steps;
            }
        }
        let mut var = vec![0.0; dims];
        for row in x {
            for ((s, v), m) in var.iter_mut().zip(row).zip(&mean) {
                *s += (v - m) * (v - m) / steps;
            }
        }
        mean.extend(var.into_iter().map(f64::sqrt));
        mean
    }
}

impl Model for LinearProbe {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn shape(&self) -> ModelShape {
        self.shape
    }

    fn forward(&self, x: &[Vec<f64>]) -> Vec<f64> {
        let features = self.features(x);
        let width = features.len();
        (0..self.shape.nclasses)
            .map(|c| {
                let row = &self.weight.value.data[c * width..(c + 1) * width];
                row.iter().zip(&features).map(|(w, f)| w * f).sum::<f64>() + self.bias.value.data[c]
            })
            .collect()
    }

    fn backward(&mut self, x: &[Vec<f64>], grad_logits: &[f64]) {
        let features = self.features(x);
        let width = features.len();
        for (c, g) in grad_logits.iter().enumerate().take(self.shape.nclasses) {
            let row = &mut self.weight.grad[c * width..(c + 1) * width];
            for (dw, f) in row.iter_mut().zip(&features) {
                *dw += g * f;
            }
            self.bias.grad[c] += g;
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}
