//! Search space definitions and parameter sweep strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use ct_types::{validation_error, ParamMap, ParameterValue, TuneResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name as it appears in the trial config (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices, sampled.
    Choice { values: Vec<serde_json::Value> },
    /// Exhaustively enumerated values.
    Grid { values: Vec<serde_json::Value> },
}

impl ParameterDef {
    pub fn validate(&self) -> TuneResult<()> {
        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                if !(low.is_finite() && high.is_finite() && low <= high) {
                    return Err(validation_error!("{}: invalid range [{}, {}]", self.name, low, high));
                }
            }
            ParameterKind::IntRange { low, high } => {
                if low > high {
                    return Err(validation_error!("{}: invalid range [{}, {}]", self.name, low, high));
                }
            }
            ParameterKind::LogUniform { low, high } => {
                if !(low.is_finite() && high.is_finite() && *low > 0.0 && low <= high) {
                    return Err(validation_error!(
                        "{}: log-uniform range [{}, {}] must be positive",
                        self.name,
                        low,
                        high
                    ));
                }
            }
            ParameterKind::Choice { values } | ParameterKind::Grid { values } => {
                if values.is_empty() {
                    return Err(validation_error!("{}: no values to choose from", self.name));
                }
            }
        }
        Ok(())
    }

    /// Whether `value` lies inside this parameter's support.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match &self.kind {
            ParameterKind::FloatRange { low, high } | ParameterKind::LogUniform { low, high } => value
                .as_f64()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            ParameterKind::IntRange { low, high } => value
                .as_i64()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            ParameterKind::Choice { values } | ParameterKind::Grid { values } => values
                .iter()
                .any(|v| ParameterValue::from(v.clone()).loosely_equals(value)),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match &self.kind {
            ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.random_range(*low..=*high)),
            ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } | ParameterKind::Grid { values } => {
                let idx = rng.random_range(0..values.len());
                ParameterValue::from(values[idx].clone())
            }
        }
    }

    pub fn is_grid(&self) -> bool {
        matches!(self.kind, ParameterKind::Grid { .. })
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    fn add(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.add(name, ParameterKind::Choice { values })
    }

    pub fn add_grid(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.add(name, ParameterKind::Grid { values })
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// True when any dimension is an enumerated grid.
    pub fn is_grid(&self) -> bool {
        self.parameters.iter().any(ParameterDef::is_grid)
    }

    /// Every parameter has a well-defined support and names are unique.
    pub fn validate(&self) -> TuneResult<()> {
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(validation_error!("parameter {} is defined twice", param.name));
            }
            param.validate()?;
        }
        Ok(())
    }

    /// Every parameter of the space is present in `params` and inside its
    /// support. Extra keys are ignored.
    pub fn contains(&self, params: &ParamMap) -> bool {
        self.parameters.iter().all(|p| {
            params
                .get(&p.name)
                .map(|value| p.contains(value))
                .unwrap_or(false)
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamMap {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.sample(rng)))
            .collect()
    }

    /// Keep the values of `partial` and sample the parameters it lacks.
    pub fn sample_missing<R: Rng + ?Sized>(&self, partial: &ParamMap, rng: &mut R) -> ParamMap {
        let mut params = partial.clone();
        for param in &self.parameters {
            if !params.contains_key(&param.name) {
                params.insert(param.name.clone(), param.sample(rng));
            }
        }
        params
    }

    /// Number of grid points across the enumerated dimensions (`None` when
    /// the space has no grid dimension).
    pub fn grid_size(&self) -> Option<usize> {
        if !self.is_grid() {
            return None;
        }
        let mut total: usize = 1;
        for param in &self.parameters {
            if let ParameterKind::Grid { values } = &param.kind {
                total = total.checked_mul(values.len())?;
            }
        }
        Some(total)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Generate the next batch of parameter combinations to evaluate. May
    /// return fewer than `count` when the strategy is exhausted.
    fn suggest(&mut self, count: usize) -> Vec<ParamMap>;

    /// Report a completed trial so adaptive strategies can learn. The
    /// objective is oriented so that higher is better.
    fn report(&mut self, _params: &ParamMap, _objective: f64) {}

    /// A configuration proposed in an earlier session of the same run.
    fn observe(&mut self, _params: &ParamMap) {}

    /// No further suggestions will be produced.
    fn is_finished(&self) -> bool {
        false
    }

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn os_seeded() -> StdRng {
    StdRng::from_os_rng()
}

// ---- Grid search ----

/// Exhaustive enumeration of the grid dimensions; non-grid dimensions are
/// sampled once per grid point.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: SearchSpace,
    cursor: usize,
    combos: Vec<ParamMap>,
    rng: StdRng,
}

impl GridSearch {
    pub fn new(space: SearchSpace) -> Self {
        let combos = Self::build_grid(&space);
        Self {
            space,
            cursor: 0,
            combos,
            rng: os_seeded(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn build_grid(space: &SearchSpace) -> Vec<ParamMap> {
        let axes: Vec<(&str, Vec<ParameterValue>)> = space
            .parameters
            .iter()
            .filter_map(|param| match &param.kind {
                ParameterKind::Grid { values } => Some((
                    param.name.as_str(),
                    values.iter().cloned().map(ParameterValue::from).collect(),
                )),
                _ => None,
            })
            .collect();

        // Cartesian product, first axis varying slowest
        let mut result: Vec<ParamMap> = vec![ParamMap::new()];
        for (name, values) in &axes {
            let mut next = Vec::with_capacity(result.len() * values.len());
            for existing in &result {
                for value in values {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }

        result
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParamMap> {
        let end = (self.cursor + count).min(self.combos.len());
        let batch: Vec<ParamMap> = self.combos[self.cursor..end]
            .iter()
            .map(|combo| self.space.sample_missing(combo, &mut self.rng))
            .collect();
        self.cursor = end;
        batch
    }

    /// Drop the grid point `params` was drawn from so it is not run twice.
    fn observe(&mut self, params: &ParamMap) {
        let position = self.combos[self.cursor..].iter().position(|combo| {
            combo
                .iter()
                .all(|(name, value)| params.get(name).is_some_and(|p| p.loosely_equals(value)))
        });
        if let Some(offset) = position {
            self.combos.remove(self.cursor + offset);
        }
    }

    fn is_finished(&self) -> bool {
        self.cursor >= self.combos.len()
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            rng: os_seeded(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParamMap> {
        (0..count).map(|_| self.space.sample(&mut self.rng)).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Tree-structured Parzen estimator ----

/// TPE: random sampling for the first `n_startup` observations, then each
/// parameter is drawn from candidates around the good (top `gamma`
/// quantile) observations, keeping the candidate with the best
/// good/bad density ratio.
#[derive(Debug, Clone)]
pub struct TpeSearch {
    space: SearchSpace,
    observations: Vec<(ParamMap, f64)>,
    gamma: f64,
    n_startup: usize,
    n_candidates: usize,
    rng: StdRng,
}

impl TpeSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            observations: Vec::new(),
            gamma: 0.25,
            n_startup: 10,
            n_candidates: 24,
            rng: os_seeded(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    pub fn with_startup(mut self, n: usize) -> Self {
        self.n_startup = n.max(1);
        self
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    fn sample_guided(&mut self) -> ParamMap {
        let mut sorted: Vec<&(ParamMap, f64)> = self.observations.iter().collect();
        sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let n_good = ((sorted.len() as f64) * self.gamma).ceil() as usize;
        let n_good = n_good.max(1).min(sorted.len().saturating_sub(1).max(1));
        let (good, bad) = sorted.split_at(n_good.min(sorted.len()));
        let good: Vec<&ParamMap> = good.iter().map(|(p, _)| p).collect();
        let bad: Vec<&ParamMap> = bad.iter().map(|(p, _)| p).collect();

        let mut params = ParamMap::new();
        for param in &self.space.parameters {
            let value = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    let v = sample_continuous(&param.name, &good, &bad, *low, *high, false, self.n_candidates, &mut self.rng);
                    ParameterValue::Float(v)
                }
                ParameterKind::LogUniform { low, high } => {
                    let v = sample_continuous(&param.name, &good, &bad, *low, *high, true, self.n_candidates, &mut self.rng);
                    ParameterValue::Float(v)
                }
                ParameterKind::IntRange { low, high } => {
                    let choices: Vec<ParameterValue> = (*low..=*high).map(ParameterValue::Int).collect();
                    sample_categorical(&param.name, &good, &bad, &choices, &mut self.rng)
                }
                ParameterKind::Choice { values } | ParameterKind::Grid { values } => {
                    let choices: Vec<ParameterValue> = values.iter().cloned().map(ParameterValue::from).collect();
                    sample_categorical(&param.name, &good, &bad, &choices, &mut self.rng)
                }
            };
            params.insert(param.name.clone(), value);
        }
        params
    }
}

impl SearchStrategy for TpeSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParamMap> {
        (0..count)
            .map(|_| {
                if self.observations.len() < self.n_startup {
                    self.space.sample(&mut self.rng)
                } else {
                    self.sample_guided()
                }
            })
            .collect()
    }

    fn report(&mut self, params: &ParamMap, objective: f64) {
        if objective.is_finite() {
            self.observations.push((params.clone(), objective));
        }
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

/// Gaussian kernel density of `x` under `values` (1 when there are none).
fn kde_score(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|&v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp())
        .sum::<f64>()
        / values.len() as f64
}

#[allow(clippy::too_many_arguments)]
fn sample_continuous(
    name: &str,
    good: &[&ParamMap],
    bad: &[&ParamMap],
    low: f64,
    high: f64,
    log_scale: bool,
    n_candidates: usize,
    rng: &mut StdRng,
) -> f64 {
    let to_axis = |v: f64| if log_scale { v.max(f64::MIN_POSITIVE).ln() } else { v };
    let extract = |set: &[&ParamMap]| -> Vec<f64> {
        set.iter()
            .filter_map(|p| p.get(name)?.as_f64())
            .map(to_axis)
            .collect()
    };
    let good_values = extract(good);
    let bad_values = extract(bad);
    let (lo, hi) = (to_axis(low), to_axis(high));

    let value = if good_values.is_empty() || hi <= lo {
        rng.random_range(lo..=hi)
    } else {
        let bandwidth = (hi - lo) / 10.0;
        let mut best = (lo, f64::NEG_INFINITY);
        for _ in 0..n_candidates.max(1) {
            let base = good_values[rng.random_range(0..good_values.len())];
            // Box-Muller
            let u1: f64 = rng.random::<f64>().max(1e-10);
            let u2: f64 = rng.random();
            let noise = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos() * bandwidth;
            let candidate = (base + noise).clamp(lo, hi);

            let ratio = kde_score(candidate, &good_values, bandwidth)
                / (kde_score(candidate, &bad_values, bandwidth) + 1e-10);
            if ratio > best.1 {
                best = (candidate, ratio);
            }
        }
        best.0
    };

    let value = if log_scale { value.exp() } else { value };
    value.clamp(low, high)
}

fn sample_categorical(
    name: &str,
    good: &[&ParamMap],
    bad: &[&ParamMap],
    choices: &[ParameterValue],
    rng: &mut StdRng,
) -> ParameterValue {
    let count = |set: &[&ParamMap], choice: &ParameterValue| {
        set.iter()
            .filter(|p| p.get(name).map(|v| v.loosely_equals(choice)).unwrap_or(false))
            .count() as f64
    };
    // Laplace smoothing keeps unseen choices reachable
    let weights: Vec<f64> = choices
        .iter()
        .map(|c| (count(good, c) + 1.0) / (count(bad, c) + 1.0))
        .collect();
    let total: f64 = weights.iter().sum();

    let r = rng.random::<f64>() * total;
    let mut cumsum = 0.0;
    for (choice, w) in choices.iter().zip(&weights) {
        cumsum += w;
        if r < cumsum {
            return choice.clone();
        }
    }
    choices[choices.len() - 1].clone()
}
