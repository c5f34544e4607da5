//! Statistic dictionaries returned by trainers and the per-round metric
//! reports the scheduler and search algorithm consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One entry of a trainer statistic dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
    Labels(Vec<String>),
}

impl StatValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

/// Statistic dictionary keyed by statistic name (`loss`, `kappa`, `probas`, ...).
pub type Stats = BTreeMap<String, StatValue>;

/// Snapshot reported by a trainable after one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// 1-based round counter, the scheduler's time attribute.
    pub training_iteration: u64,
    pub time_this_iter_s: f64,
    pub time_total_s: f64,
    pub timestamp: DateTime<Utc>,
    /// Finite values only; JSON has no encoding for NaN or infinity.
    #[serde(serialize_with = "serialize_finite", deserialize_with = "deserialize_finite")]
    pub metrics: BTreeMap<String, f64>,
}

fn serialize_finite<S: Serializer>(metrics: &BTreeMap<String, f64>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(metrics.iter().filter(|(_, v)| v.is_finite()))
}

/// Entries written as `null` by older logs are skipped.
fn deserialize_finite<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error> {
    let raw = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| v.filter(|v| v.is_finite()).map(|v| (k, v)))
        .collect())
}

impl MetricReport {
    /// Non-finite metrics (a diverged loss) are dropped.
    pub fn new(training_iteration: u64, mut metrics: BTreeMap<String, f64>) -> Self {
        metrics.retain(|_, v| v.is_finite());
        Self {
            training_iteration,
            time_this_iter_s: 0.0,
            time_total_s: 0.0,
            timestamp: Utc::now(),
            metrics,
        }
    }

    pub fn with_timing(mut self, this_iter_s: f64, total_s: f64) -> Self {
        self.time_this_iter_s = this_iter_s;
        self.time_total_s = total_s;
        self
    }

    /// Look up a metric; non-finite values count as missing.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|v| v.is_finite())
    }

    /// Flattened view used for result tables: bookkeeping columns followed by
    /// the metrics.
    pub fn columns(&self) -> BTreeMap<String, String> {
        let mut cols: BTreeMap<String, String> = self
            .metrics
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        cols.insert("training_iteration".into(), self.training_iteration.to_string());
        cols.insert("time_this_iter_s".into(), self.time_this_iter_s.to_string());
        cols.insert("time_total_s".into(), self.time_total_s.to_string());
        cols.insert("timestamp".into(), self.timestamp.to_rfc3339());
        cols
    }
}

/// Keep only the scalar entries of a statistic dictionary.
pub fn scalar_stats(stats: &Stats) -> BTreeMap<String, f64> {
    stats
        .iter()
        .filter_map(|(k, v)| v.as_scalar().map(|s| (k.clone(), s)))
        .collect()
}
