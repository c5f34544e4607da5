//! Search algorithm: a strategy plus seeding, concurrency limiting and
//! support checks.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use ct_types::{MetricReport, ParamMap, TrialConfig};

use crate::search::{GridSearch, SearchSpace, SearchStrategy, TpeSearch};
use crate::trial::ObjectiveDirection;

/// Attempts at drawing an in-support proposal before giving up on a suggest call.
const MAX_PROPOSAL_ATTEMPTS: usize = 16;

/// One proposed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    /// The sampled values.
    pub parameters: ParamMap,
    /// Constants with the sampled values layered on top.
    pub config: TrialConfig,
}

pub struct SearchAlgorithm {
    strategy: Box<dyn SearchStrategy>,
    space: SearchSpace,
    constants: ParamMap,
    metric: String,
    direction: ObjectiveDirection,
    max_concurrent: usize,
    seeds: VecDeque<ParamMap>,
    live: HashMap<Uuid, ParamMap>,
    rng: StdRng,
}

impl SearchAlgorithm {
    /// Grid spaces are enumerated; anything else uses TPE.
    pub fn new(space: SearchSpace, constants: ParamMap, metric: impl Into<String>, seed: Option<u64>) -> Self {
        let strategy = Self::default_strategy(&space, seed);
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_os_rng(),
        };
        Self {
            strategy,
            space,
            constants,
            metric: metric.into(),
            direction: ObjectiveDirection::Maximize,
            max_concurrent: 4,
            seeds: VecDeque::new(),
            live: HashMap::new(),
            rng,
        }
    }

    pub fn default_strategy(space: &SearchSpace, seed: Option<u64>) -> Box<dyn SearchStrategy> {
        if space.is_grid() {
            let grid = GridSearch::new(space.clone());
            Box::new(match seed {
                Some(seed) => grid.with_seed(seed),
                None => grid,
            })
        } else {
            let tpe = TpeSearch::new(space.clone());
            Box::new(match seed {
                Some(seed) => tpe.with_seed(seed),
                None => tpe,
            })
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Queue points to evaluate before the strategy's own proposals. Missing
    /// parameters are sampled; points outside the space are dropped.
    pub fn with_points_to_evaluate(mut self, points: Vec<ParamMap>) -> Self {
        for point in points {
            let unknown: Vec<&String> = point
                .keys()
                .filter(|k| self.space.parameter(k).is_none())
                .collect();
            if !unknown.is_empty() {
                tracing::warn!("Dropping seed point with unknown parameters {:?}", unknown);
                continue;
            }
            let full = self.space.sample_missing(&point, &mut self.rng);
            if self.space.contains(&full) {
                self.seeds.push_back(full);
            } else {
                tracing::warn!("Dropping seed point outside the search space: {:?}", point);
            }
        }
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn pending_seeds(&self) -> usize {
        self.seeds.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Track a trial that was started elsewhere (e.g. restored on resume).
    /// Its point is not proposed again.
    pub fn register_live(&mut self, trial_id: Uuid, parameters: ParamMap) {
        self.seeds.retain(|seed| !same_point(seed, &parameters));
        self.strategy.observe(&parameters);
        self.live.insert(trial_id, parameters);
    }

    /// No seed is left and the strategy is exhausted.
    pub fn is_finished(&self) -> bool {
        self.seeds.is_empty() && self.strategy.is_finished()
    }

    /// Next configuration for `trial_id`, or `None` while `max_concurrent`
    /// trials are live or when nothing is left to propose.
    pub fn suggest(&mut self, trial_id: Uuid) -> Option<Suggestion> {
        if self.live.len() >= self.max_concurrent {
            return None;
        }

        let parameters = match self.seeds.pop_front() {
            Some(seed) => seed,
            None => self.propose()?,
        };

        self.live.insert(trial_id, parameters.clone());
        Some(Suggestion {
            config: TrialConfig::merged(&self.constants, &parameters),
            parameters,
        })
    }

    fn propose(&mut self) -> Option<ParamMap> {
        for _ in 0..MAX_PROPOSAL_ATTEMPTS {
            let proposal = self.strategy.suggest(1).into_iter().next()?;
            if self.space.contains(&proposal) {
                return Some(proposal);
            }
            tracing::warn!(
                "{} proposed a configuration outside the search space: {:?}",
                self.strategy.name(),
                proposal
            );
        }
        None
    }

    /// The trial finished (completed, pruned or failed). Its last report, if
    /// it carries the metric, feeds the strategy.
    pub fn on_trial_complete(&mut self, trial_id: Uuid, report: Option<&MetricReport>) {
        let Some(parameters) = self.live.remove(&trial_id) else {
            return;
        };
        match report.and_then(|r| r.metric(&self.metric)) {
            Some(value) => self.strategy.report(&parameters, self.direction.orient(value)),
            None => tracing::debug!("Trial {} finished without a {} value", trial_id, self.metric),
        }
    }
}

fn same_point(a: &ParamMap, b: &ParamMap) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(name, value)| b.get(name).is_some_and(|other| other.loosely_equals(value)))
}

impl std::fmt::Debug for SearchAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchAlgorithm")
            .field("strategy", &self.strategy.name())
            .field("metric", &self.metric)
            .field("max_concurrent", &self.max_concurrent)
            .field("seeds", &self.seeds.len())
            .field("live", &self.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_types::ParameterValue;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_choice("num_layers", (1..8).map(|v| json!(v)).collect())
            .add_float("dropout", 0.0, 1.0)
    }

    fn constants() -> ParamMap {
        let mut constants = ParamMap::new();
        constants.insert("epochs".into(), ParameterValue::Int(5));
        constants.insert("dataset".into(), ParameterValue::from("BavarianCrops"));
        constants
    }

    fn point(num_layers: i64, dropout: f64) -> ParamMap {
        let mut p = ParamMap::new();
        p.insert("num_layers".into(), ParameterValue::Int(num_layers));
        p.insert("dropout".into(), ParameterValue::Float(dropout));
        p
    }

    fn kappa(value: f64) -> MetricReport {
        let mut metrics = BTreeMap::new();
        metrics.insert("kappa".to_string(), value);
        MetricReport::new(1, metrics)
    }

    #[test]
    fn concurrency_is_bounded() {
        let mut algo = SearchAlgorithm::new(space(), constants(), "kappa", Some(1)).with_max_concurrent(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(algo.suggest(a).is_some());
        assert!(algo.suggest(b).is_some());
        assert!(algo.suggest(Uuid::new_v4()).is_none());

        algo.on_trial_complete(a, Some(&kappa(0.3)));
        assert!(algo.suggest(Uuid::new_v4()).is_some());
    }

    #[test]
    fn seeds_come_first_and_merge_constants() {
        let mut algo = SearchAlgorithm::new(space(), constants(), "kappa", Some(2))
            .with_points_to_evaluate(vec![point(3, 0.25), point(6, 0.5)]);
        assert_eq!(algo.pending_seeds(), 2);

        let first = algo.suggest(Uuid::new_v4()).unwrap();
        assert_eq!(first.parameters, point(3, 0.25));
        assert_eq!(first.config.get_usize("epochs").unwrap(), 5);
        assert_eq!(first.config.get_usize("num_layers").unwrap(), 3);

        let second = algo.suggest(Uuid::new_v4()).unwrap();
        assert_eq!(second.parameters, point(6, 0.5));
    }

    #[test]
    fn seeds_outside_space_are_dropped() {
        let algo = SearchAlgorithm::new(space(), constants(), "kappa", Some(3))
            .with_points_to_evaluate(vec![point(12, 0.25), point(2, 1.5), point(2, 0.5)]);
        assert_eq!(algo.pending_seeds(), 1);
    }

    #[test]
    fn partial_seeds_are_completed() {
        let mut partial = ParamMap::new();
        partial.insert("num_layers".into(), ParameterValue::Int(4));
        let mut algo = SearchAlgorithm::new(space(), constants(), "kappa", Some(4))
            .with_points_to_evaluate(vec![partial]);

        let suggestion = algo.suggest(Uuid::new_v4()).unwrap();
        assert_eq!(suggestion.parameters["num_layers"], ParameterValue::Int(4));
        assert!(suggestion.parameters.contains_key("dropout"));
    }

    #[test]
    fn grid_space_uses_grid_search_and_finishes() {
        let grid = SearchSpace::new().add_grid("n_heads", vec![json!(2), json!(4)]);
        let mut algo = SearchAlgorithm::new(grid, constants(), "kappa", Some(5)).with_max_concurrent(10);
        assert_eq!(algo.strategy_name(), "grid");
        assert!(algo.suggest(Uuid::new_v4()).is_some());
        assert!(algo.suggest(Uuid::new_v4()).is_some());
        assert!(algo.suggest(Uuid::new_v4()).is_none());
        assert!(algo.is_finished());
    }

    #[test]
    fn restored_points_are_not_proposed_again() {
        let grid = SearchSpace::new().add_grid("n_heads", vec![json!(2), json!(4)]);
        let mut algo = SearchAlgorithm::new(grid, constants(), "kappa", Some(5)).with_max_concurrent(10);
        let mut restored = ParamMap::new();
        restored.insert("n_heads".into(), ParameterValue::Int(2));
        algo.register_live(Uuid::new_v4(), restored);

        let next = algo.suggest(Uuid::new_v4()).unwrap();
        assert_eq!(next.parameters["n_heads"], ParameterValue::Int(4));
        assert!(algo.suggest(Uuid::new_v4()).is_none());
        assert_eq!(algo.live_count(), 2);
    }

    #[test]
    fn non_grid_space_uses_tpe() {
        let algo = SearchAlgorithm::new(space(), constants(), "kappa", None);
        assert_eq!(algo.strategy_name(), "tpe");
        assert!(!algo.is_finished());
    }

    #[test]
    fn every_suggestion_is_inside_the_space() {
        let mut algo = SearchAlgorithm::new(space(), constants(), "kappa", Some(6)).with_max_concurrent(1);
        for i in 0..40 {
            let id = Uuid::new_v4();
            let suggestion = algo.suggest(id).unwrap();
            assert!(space().contains(&suggestion.parameters));
            algo.on_trial_complete(id, Some(&kappa(i as f64 / 40.0)));
        }
    }
}
