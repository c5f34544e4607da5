//! Adam with L2 weight decay folded into the gradient.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use ct_types::{TrialConfig, TuneError, TuneResult};

use crate::tensor::Parameter;

pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;

/// Trait for optimization algorithms
pub trait Optimizer: Send + fmt::Debug {
    /// Apply one update to every parameter that requires gradients
    fn step(&mut self, params: &mut [&mut Parameter]);

    fn lr(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamSettings {
    /// `learning_rate` and `weight_decay` from the trial config; absent keys
    /// keep the defaults.
    pub fn from_config(config: &TrialConfig) -> TuneResult<Self> {
        let mut settings = Self::default();
        if config.contains("learning_rate") {
            settings.learning_rate = config.get_f64("learning_rate")?;
        }
        if config.contains("weight_decay") {
            settings.weight_decay = config.get_f64("weight_decay")?;
        }
        if !(settings.learning_rate > 0.0 && settings.learning_rate.is_finite()) {
            return Err(TuneError::Model(format!(
                "learning_rate must be positive, got {}",
                settings.learning_rate
            )));
        }
        if settings.weight_decay < 0.0 {
            return Err(TuneError::Model(format!(
                "weight_decay must be non-negative, got {}",
                settings.weight_decay
            )));
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    settings: AdamSettings,
    t: u64,
    m: HashMap<String, Vec<f64>>,
    v: HashMap<String, Vec<f64>>,
}

impl Adam {
    pub fn new(settings: AdamSettings) -> Self {
        Self {
            settings,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &AdamSettings {
        &self.settings
    }

    pub fn step_count(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        self.t += 1;
        let (beta1, beta2) = self.settings.betas;
        let bias1 = 1.0 - beta1.powi(self.t as i32);
        let bias2 = 1.0 - beta2.powi(self.t as i32);

        for param in params.iter_mut().filter(|p| p.requires_grad) {
            let n = param.value.numel();
            let m = self.m.entry(param.name.clone()).or_insert_with(|| vec![0.0; n]);
            let v = self.v.entry(param.name.clone()).or_insert_with(|| vec![0.0; n]);

            for i in 0..n {
                let g = param.grad[i] + self.settings.weight_decay * param.value.data[i];
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                param.value.data[i] -= self.settings.learning_rate * m_hat / (v_hat.sqrt() + self.settings.eps);
            }
        }
    }

    fn lr(&self) -> f64 {
        self.settings.learning_rate
    }
}
