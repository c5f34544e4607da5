//! Trial schedulers: asynchronous successive halving (ASHA) and FIFO.
//!
//! ASHA runs several brackets side by side. Bracket `s` places rungs at
//! `grace_period * rf^(k + s)`; when a trial reaches a rung it is compared
//! against the values recorded there and stopped when it falls below the
//! `(1 - 1/rf)` percentile. Reaching `max_t` always stops a trial.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use ct_types::{validation_error, MetricReport, TuneResult};

use crate::trial::ObjectiveDirection;

/// What the run driver should do with a trial after a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerDecision {
    Continue,
    Stop,
}

/// Decides, result by result, which trials keep running.
pub trait TrialScheduler: Send + fmt::Debug {
    fn on_trial_add(&mut self, trial_id: Uuid);

    fn on_trial_result(&mut self, trial_id: Uuid, report: &MetricReport) -> SchedulerDecision;

    /// The trial reached the end of its budget.
    fn on_trial_complete(&mut self, trial_id: Uuid, report: Option<&MetricReport>);

    /// The trial was stopped or failed and leaves the scheduler.
    fn on_trial_remove(&mut self, trial_id: Uuid);

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerConfig {
    Asha {
        max_t: u64,
        grace_period: u64,
        reduction_factor: f64,
        brackets: usize,
    },
    Fifo {
        max_t: Option<u64>,
    },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::Asha {
            max_t: 60,
            grace_period: 2,
            reduction_factor: 3.0,
            brackets: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> TuneResult<()> {
        match self {
            Self::Asha {
                max_t,
                grace_period,
                reduction_factor,
                brackets,
            } => {
                if *grace_period == 0 {
                    return Err(validation_error!("grace_period must be at least 1"));
                }
                if grace_period > max_t {
                    return Err(validation_error!(
                        "grace_period {} exceeds max_t {}",
                        grace_period,
                        max_t
                    ));
                }
                if !(*reduction_factor >= 2.0 && reduction_factor.is_finite()) {
                    return Err(validation_error!(
                        "reduction_factor must be at least 2, got {}",
                        reduction_factor
                    ));
                }
                if *brackets == 0 {
                    return Err(validation_error!("at least one bracket is required"));
                }
            }
            Self::Fifo { max_t } => {
                if *max_t == Some(0) {
                    return Err(validation_error!("max_t must be at least 1"));
                }
            }
        }
        Ok(())
    }

    /// Rounds after which every trial stops, if bounded.
    pub fn max_t(&self) -> Option<u64> {
        match self {
            Self::Asha { max_t, .. } => Some(*max_t),
            Self::Fifo { max_t } => *max_t,
        }
    }

    pub fn build(&self, metric: &str, direction: ObjectiveDirection, seed: Option<u64>) -> Box<dyn TrialScheduler> {
        match self {
            Self::Asha {
                max_t,
                grace_period,
                reduction_factor,
                brackets,
            } => {
                let scheduler = AsyncHyperBandScheduler::new(metric, direction)
                    .max_t(*max_t)
                    .grace_period(*grace_period)
                    .reduction_factor(*reduction_factor)
                    .brackets(*brackets);
                Box::new(match seed {
                    Some(seed) => scheduler.with_seed(seed),
                    None => scheduler,
                })
            }
            Self::Fifo { max_t } => Box::new(FifoScheduler { max_t: *max_t }),
        }
    }
}

// ---- Brackets ----

#[derive(Debug, Clone)]
struct Rung {
    milestone: f64,
    recorded: HashMap<Uuid, f64>,
}

/// One successive-halving policy. Rungs are kept highest milestone first.
#[derive(Debug, Clone)]
struct Bracket {
    rf: f64,
    rungs: Vec<Rung>,
}

impl Bracket {
    fn new(min_t: u64, max_t: u64, rf: f64, s: usize) -> Self {
        let max_rungs = ((max_t as f64 / min_t as f64).ln() / rf.ln() - s as f64 + 1.0).trunc();
        let max_rungs = if max_rungs > 0.0 { max_rungs as i32 } else { 0 };
        let rungs = (0..max_rungs)
            .rev()
            .map(|k| Rung {
                milestone: min_t as f64 * rf.powi(k + s as i32),
                recorded: HashMap::new(),
            })
            .collect();
        Self { rf, rungs }
    }

    fn milestones(&self) -> Vec<f64> {
        self.rungs.iter().map(|r| r.milestone).collect()
    }

    fn cutoff(&self, recorded: &HashMap<Uuid, f64>) -> Option<f64> {
        let values: Vec<f64> = recorded.values().copied().filter(|v| !v.is_nan()).collect();
        percentile(&values, (1.0 - 1.0 / self.rf) * 100.0)
    }

    /// `value` is oriented so that higher is better.
    fn on_result(&mut self, trial_id: Uuid, cur_iter: f64, value: f64) -> SchedulerDecision {
        let mut decision = SchedulerDecision::Continue;
        for idx in 0..self.rungs.len() {
            let rung = &self.rungs[idx];
            if cur_iter < rung.milestone || rung.recorded.contains_key(&trial_id) {
                continue;
            }
            if let Some(cutoff) = self.cutoff(&rung.recorded) {
                if value < cutoff {
                    decision = SchedulerDecision::Stop;
                }
            }
            self.rungs[idx].recorded.insert(trial_id, value);
            break;
        }
        decision
    }
}

/// Linear-interpolated percentile (`q` in 0..=100) of `values`.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

// ---- ASHA ----

#[derive(Debug, Clone)]
pub struct AsyncHyperBandScheduler {
    metric: String,
    direction: ObjectiveDirection,
    max_t: u64,
    grace_period: u64,
    reduction_factor: f64,
    brackets: Vec<Bracket>,
    trial_bracket: HashMap<Uuid, usize>,
    rng: StdRng,
}

impl AsyncHyperBandScheduler {
    /// Defaults: `max_t=60`, `grace_period=2`, `reduction_factor=3`, 4 brackets.
    pub fn new(metric: impl Into<String>, direction: ObjectiveDirection) -> Self {
        let mut scheduler = Self {
            metric: metric.into(),
            direction,
            max_t: 60,
            grace_period: 2,
            reduction_factor: 3.0,
            brackets: Vec::new(),
            trial_bracket: HashMap::new(),
            rng: StdRng::from_os_rng(),
        };
        scheduler.rebuild(4);
        scheduler
    }

    fn rebuild(&mut self, count: usize) {
        self.brackets = (0..count.max(1))
            .map(|s| Bracket::new(self.grace_period.max(1), self.max_t, self.reduction_factor, s))
            .collect();
    }

    pub fn max_t(mut self, max_t: u64) -> Self {
        self.max_t = max_t;
        let count = self.brackets.len();
        self.rebuild(count);
        self
    }

    pub fn grace_period(mut self, grace_period: u64) -> Self {
        self.grace_period = grace_period;
        let count = self.brackets.len();
        self.rebuild(count);
        self
    }

    pub fn reduction_factor(mut self, rf: f64) -> Self {
        self.reduction_factor = rf;
        let count = self.brackets.len();
        self.rebuild(count);
        self
    }

    pub fn brackets(mut self, count: usize) -> Self {
        self.rebuild(count);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Milestones of every bracket, highest first.
    pub fn milestones(&self) -> Vec<Vec<f64>> {
        self.brackets.iter().map(Bracket::milestones).collect()
    }

    pub fn bracket_of(&self, trial_id: Uuid) -> Option<usize> {
        self.trial_bracket.get(&trial_id).copied()
    }

    /// Brackets with more rungs are favoured: weight `e^(rungs - max_rungs)`.
    fn draw_bracket(&mut self) -> usize {
        let sizes: Vec<f64> = self.brackets.iter().map(|b| b.rungs.len() as f64).collect();
        let max = sizes.iter().copied().fold(0.0, f64::max);
        let weights: Vec<f64> = sizes.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = weights.iter().sum();

        let r = self.rng.random::<f64>() * total;
        let mut cumsum = 0.0;
        for (idx, w) in weights.iter().enumerate() {
            cumsum += w;
            if r < cumsum {
                return idx;
            }
        }
        weights.len() - 1
    }
}

impl TrialScheduler for AsyncHyperBandScheduler {
    fn on_trial_add(&mut self, trial_id: Uuid) {
        let bracket = self.draw_bracket();
        tracing::debug!("Trial {} assigned to bracket {}", trial_id, bracket);
        self.trial_bracket.insert(trial_id, bracket);
    }

    fn on_trial_result(&mut self, trial_id: Uuid, report: &MetricReport) -> SchedulerDecision {
        if report.training_iteration >= self.max_t {
            return SchedulerDecision::Stop;
        }
        let Some(value) = report.metric(&self.metric) else {
            return SchedulerDecision::Continue;
        };
        let Some(&bracket) = self.trial_bracket.get(&trial_id) else {
            return SchedulerDecision::Continue;
        };
        let value = self.direction.orient(value);
        self.brackets[bracket].on_result(trial_id, report.training_iteration as f64, value)
    }

    fn on_trial_complete(&mut self, trial_id: Uuid, report: Option<&MetricReport>) {
        if let (Some(report), Some(&bracket)) = (report, self.trial_bracket.get(&trial_id)) {
            if let Some(value) = report.metric(&self.metric) {
                let value = self.direction.orient(value);
                self.brackets[bracket].on_result(trial_id, report.training_iteration as f64, value);
            }
        }
        self.trial_bracket.remove(&trial_id);
    }

    fn on_trial_remove(&mut self, trial_id: Uuid) {
        self.trial_bracket.remove(&trial_id);
    }

    fn name(&self) -> &str {
        "async_hyperband"
    }
}

// ---- FIFO ----

/// Never prunes; stops trials only at `max_t`.
#[derive(Debug, Clone, Default)]
pub struct FifoScheduler {
    pub max_t: Option<u64>,
}

impl TrialScheduler for FifoScheduler {
    fn on_trial_add(&mut self, _trial_id: Uuid) {}

    fn on_trial_result(&mut self, _trial_id: Uuid, report: &MetricReport) -> SchedulerDecision {
        match self.max_t {
            Some(max_t) if report.training_iteration >= max_t => SchedulerDecision::Stop,
            _ => SchedulerDecision::Continue,
        }
    }

    fn on_trial_complete(&mut self, _trial_id: Uuid, _report: Option<&MetricReport>) {}

    fn on_trial_remove(&mut self, _trial_id: Uuid) {}

    fn name(&self) -> &str {
        "fifo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn report(iteration: u64, kappa: f64) -> MetricReport {
        let mut metrics = BTreeMap::new();
        metrics.insert("kappa".to_string(), kappa);
        MetricReport::new(iteration, metrics)
    }

    /// One bracket with rungs at 9, 3 and 1.
    fn single_bracket() -> AsyncHyperBandScheduler {
        AsyncHyperBandScheduler::new("kappa", ObjectiveDirection::Maximize)
            .max_t(10)
            .grace_period(1)
            .reduction_factor(3.0)
            .brackets(1)
            .with_seed(0)
    }

    fn added(scheduler: &mut AsyncHyperBandScheduler) -> Uuid {
        let id = Uuid::new_v4();
        scheduler.on_trial_add(id);
        id
    }

    #[test]
    fn default_bracket_milestones() {
        let scheduler = AsyncHyperBandScheduler::new("kappa", ObjectiveDirection::Maximize);
        assert_eq!(
            scheduler.milestones(),
            vec![
                vec![54.0, 18.0, 6.0, 2.0],
                vec![54.0, 18.0, 6.0],
                vec![54.0, 18.0],
                vec![54.0],
            ]
        );
    }

    #[test]
    fn percentile_interpolates_linearly() {
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[0.5], 66.0), Some(0.5));
        let p = percentile(&[0.5, 0.4, 0.6], 200.0 / 3.0).unwrap();
        assert!((p - (0.5 + 0.1 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn trials_below_cutoff_are_stopped() {
        let mut s = single_bracket();
        let (a, b, c, d) = (added(&mut s), added(&mut s), added(&mut s), added(&mut s));

        // first value at a rung only records
        assert_eq!(s.on_trial_result(a, &report(1, 0.5)), SchedulerDecision::Continue);
        // cutoff 0.5
        assert_eq!(s.on_trial_result(b, &report(1, 0.4)), SchedulerDecision::Stop);
        // cutoff 0.4 + 0.1 * 2/3
        assert_eq!(s.on_trial_result(c, &report(1, 0.6)), SchedulerDecision::Continue);
        // cutoff 0.5 + 0.1 * 1/3
        assert_eq!(s.on_trial_result(d, &report(1, 0.5)), SchedulerDecision::Stop);
    }

    #[test]
    fn equal_values_are_not_pruned() {
        let mut s = single_bracket();
        let (a, b) = (added(&mut s), added(&mut s));
        assert_eq!(s.on_trial_result(a, &report(1, 0.5)), SchedulerDecision::Continue);
        assert_eq!(s.on_trial_result(b, &report(1, 0.5)), SchedulerDecision::Continue);
    }

    #[test]
    fn a_rung_is_judged_once_per_trial() {
        let mut s = single_bracket();
        let (a, b) = (added(&mut s), added(&mut s));
        s.on_trial_result(a, &report(1, 0.9));
        s.on_trial_result(b, &report(1, 0.95));
        // iteration 2 is between rungs 1 and 3: nothing new to judge
        assert_eq!(s.on_trial_result(a, &report(2, 0.0)), SchedulerDecision::Continue);
        // rung 3 is new for both
        assert_eq!(s.on_trial_result(b, &report(3, 0.7)), SchedulerDecision::Continue);
        assert_eq!(s.on_trial_result(a, &report(3, 0.6)), SchedulerDecision::Stop);
    }

    #[test]
    fn nothing_is_pruned_before_the_grace_period() {
        let mut s = AsyncHyperBandScheduler::new("kappa", ObjectiveDirection::Maximize)
            .brackets(1)
            .with_seed(1);
        let strong = added(&mut s);
        let weak = added(&mut s);
        s.on_trial_result(strong, &report(2, 0.9));
        assert_eq!(s.on_trial_result(weak, &report(1, 0.0)), SchedulerDecision::Continue);
        assert_eq!(s.on_trial_result(weak, &report(2, 0.1)), SchedulerDecision::Stop);
    }

    #[test]
    fn max_t_stops_every_trial() {
        let mut s = single_bracket();
        let a = added(&mut s);
        assert_eq!(s.on_trial_result(a, &report(10, 1.0)), SchedulerDecision::Stop);

        let mut fifo = FifoScheduler { max_t: Some(3) };
        assert_eq!(fifo.on_trial_result(a, &report(2, 0.0)), SchedulerDecision::Continue);
        assert_eq!(fifo.on_trial_result(a, &report(3, 0.0)), SchedulerDecision::Stop);
    }

    #[test]
    fn minimize_flips_the_comparison() {
        let mut s = AsyncHyperBandScheduler::new("kappa", ObjectiveDirection::Minimize)
            .max_t(10)
            .grace_period(1)
            .brackets(1)
            .with_seed(0);
        let (a, b) = (added(&mut s), added(&mut s));
        s.on_trial_result(a, &report(1, 0.2));
        assert_eq!(s.on_trial_result(b, &report(1, 0.3)), SchedulerDecision::Stop);
    }

    #[test]
    fn missing_metric_continues() {
        let mut s = single_bracket();
        let a = added(&mut s);
        let empty = MetricReport::new(1, BTreeMap::new());
        assert_eq!(s.on_trial_result(a, &empty), SchedulerDecision::Continue);
    }

    #[test]
    fn larger_brackets_are_drawn_more_often() {
        let mut s = AsyncHyperBandScheduler::new("kappa", ObjectiveDirection::Maximize).with_seed(42);
        let mut counts = [0usize; 4];
        for _ in 0..4000 {
            let id = added(&mut s);
            counts[s.bracket_of(id).unwrap()] += 1;
        }
        // weights 1, e^-1, e^-2, e^-3 normalise to about 0.64 / 0.24 / 0.09 / 0.03
        let share = counts[0] as f64 / 4000.0;
        assert!(share > 0.58 && share < 0.70, "bracket 0 share {share}");
        assert!(counts[0] > counts[1] && counts[1] > counts[2] && counts[2] > counts[3]);
    }

    #[test]
    fn config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let bad_rf = SchedulerConfig::Asha {
            max_t: 60,
            grace_period: 2,
            reduction_factor: 1.5,
            brackets: 4,
        };
        assert!(bad_rf.validate().is_err());
        let bad_grace = SchedulerConfig::Asha {
            max_t: 5,
            grace_period: 6,
            reduction_factor: 3.0,
            brackets: 1,
        };
        assert!(bad_grace.validate().is_err());
        assert_eq!(SchedulerConfig::default().max_t(), Some(60));
    }
}
