//! Parameter values and concrete trial configurations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{TrialError, TuneResult};

/// A concrete parameter value produced by a search strategy or fixed by an
/// experiment template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

/// Named parameter values, ordered by name.
pub type ParamMap = BTreeMap<String, ParameterValue>;

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }

    /// Integer view. Floats with an integral value are accepted so that values
    /// read back from CSV tables (`3.0`) still resolve.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            Self::Float(_) => None,
            Self::Json(v) => v
                .as_i64()
                .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Json(serde_json::Value::Null))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Json(v) => v.clone(),
        }
    }

    /// Equality that treats numbers by value, so `Int(3)`, `Float(3.0)` and
    /// `Json(3)` all compare equal.
    pub fn loosely_equals(&self, other: &ParameterValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.to_json() == other.to_json(),
            _ => false,
        }
    }

    /// Parse a table cell back into a value: integer, then float, then
    /// boolean / null / JSON, falling back to a plain string.
    pub fn parse_cell(cell: &str) -> Self {
        let trimmed = cell.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return Self::Int(v);
        }
        if let Ok(v) = trimmed.parse::<f64>() {
            return Self::Float(v);
        }
        if trimmed.is_empty() {
            return Self::Json(serde_json::Value::Null);
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(v) => Self::Json(v),
            Err(_) => Self::Json(serde_json::Value::String(trimmed.to_string())),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Json(serde_json::Value::Bool(v))
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Json(serde_json::Value::String(v.to_string()))
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Json(serde_json::Value::String(v))
    }
}

impl From<serde_json::Value> for ParameterValue {
    fn from(v: serde_json::Value) -> Self {
        match &v {
            serde_json::Value::Number(n) if n.is_i64() => Self::Int(n.as_i64().unwrap_or_default()),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Float).unwrap_or(Self::Json(v)),
            _ => Self::Json(v),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// The fully resolved configuration one trial runs with: experiment
/// constants merged with the sampled values and the run-level overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialConfig {
    values: ParamMap,
}

impl TrialConfig {
    pub fn new(values: ParamMap) -> Self {
        Self { values }
    }

    /// Layer `overrides` on top of `base`; later keys win.
    pub fn merged(base: &ParamMap, overrides: &ParamMap) -> Self {
        let mut values = base.clone();
        values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { values }
    }

    pub fn values(&self) -> &ParamMap {
        &self.values
    }

    pub fn into_values(self) -> ParamMap {
        self.values
    }

    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParameterValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ParameterValue> {
        self.values.remove(key)
    }

    fn require(&self, key: &str) -> TuneResult<&ParameterValue> {
        self.values
            .get(key)
            .ok_or_else(|| TrialError::MissingKey { key: key.to_string() }.into())
    }

    fn wrong_type(key: &str, expected: &str) -> crate::TuneError {
        TrialError::WrongType {
            key: key.to_string(),
            expected: expected.to_string(),
        }
        .into()
    }

    pub fn get_f64(&self, key: &str) -> TuneResult<f64> {
        self.require(key)?
            .as_f64()
            .ok_or_else(|| Self::wrong_type(key, "number"))
    }

    pub fn get_usize(&self, key: &str) -> TuneResult<usize> {
        let value = self
            .require(key)?
            .as_i64()
            .ok_or_else(|| Self::wrong_type(key, "integer"))?;
        usize::try_from(value).map_err(|_| Self::wrong_type(key, "non-negative integer"))
    }

    pub fn get_bool(&self, key: &str) -> TuneResult<bool> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| Self::wrong_type(key, "boolean"))
    }

    pub fn get_str(&self, key: &str) -> TuneResult<&str> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| Self::wrong_type(key, "string"))
    }

    /// Optional string: absent keys and `null` both map to `None`.
    pub fn get_opt_str(&self, key: &str) -> TuneResult<Option<&str>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => v.as_str().map(Some).ok_or_else(|| Self::wrong_type(key, "string")),
        }
    }

    pub fn get_str_list(&self, key: &str) -> TuneResult<Vec<String>> {
        match self.require(key)? {
            ParameterValue::Json(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Self::wrong_type(key, "list of strings"))
                })
                .collect(),
            ParameterValue::Json(serde_json::Value::String(s)) => Ok(vec![s.clone()]),
            _ => Err(Self::wrong_type(key, "list of strings")),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl fmt::Display for TrialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
