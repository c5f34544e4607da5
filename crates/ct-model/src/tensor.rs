//! Named parameter tensors and serialized weight dictionaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ct_types::{TuneError, TuneResult};

/// Dense row-major tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn from_vec(shape: Vec<usize>, data: Vec<f64>) -> TuneResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(TuneError::Model(format!(
                "tensor shape {:?} needs {} values, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A learnable (or frozen) tensor with its gradient buffer.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Vec<f64>,
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = vec![0.0; value.numel()];
        Self {
            name: name.into(),
            value,
            grad,
            requires_grad: true,
        }
    }

    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Model weights keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict {
    tensors: BTreeMap<String, Tensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn save_json(&self, path: &Path) -> TuneResult<()> {
        let json = serde_json::to_vec(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> TuneResult<Self> {
        let bytes = fs::read(path).map_err(|e| {
            TuneError::Checkpoint(format!("cannot read weights {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            TuneError::Checkpoint(format!("malformed weights {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tensor_shape_must_match_data() {
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0; 5]).is_err());
        assert_eq!(Tensor::zeros(vec![4, 2]).numel(), 8);
    }

    #[test]
    fn state_dict_file_round_trip_is_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");

        let mut state = StateDict::new();
        state.insert("weight", Tensor::from_vec(vec![3], vec![0.1, 1.0 / 3.0, -2.5e-17]).unwrap());
        state.save_json(&path).unwrap();

        let loaded = StateDict::load_json(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn loading_missing_weights_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let result = StateDict::load_json(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(TuneError::Checkpoint(_))));
    }
}
