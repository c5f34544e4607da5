//! Named experiment definitions: constants, search spaces and seed points
//! mined from earlier runs.

use serde_json::json;
use std::path::{Path, PathBuf};

use ct_model::ModelRegistry;
use ct_types::{config_error, ParamMap, ParameterValue, TuneError, TuneResult};

use crate::results::{ResultTable, RESULTS_CSV};
use crate::search::SearchSpace;
use crate::trial::ObjectiveDirection;

/// Number of prior rows turned into seed points.
pub const SEED_POINTS: usize = 3;

const DATASET: &str = "BavarianCrops";
const REGION: &str = "HOLL_2018_MT_pilot";

/// Constants and search space of one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentTemplate {
    pub name: String,
    pub constants: ParamMap,
    pub space: SearchSpace,
    /// Columns of a prior result table used to seed the search.
    pub seed_columns: Vec<String>,
}

impl ExperimentTemplate {
    pub fn new(name: impl Into<String>, constants: ParamMap, space: SearchSpace) -> Self {
        Self {
            name: name.into(),
            constants,
            space,
            seed_columns: Vec::new(),
        }
    }

    pub fn with_seed_columns(mut self, columns: &[&str]) -> Self {
        self.seed_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Override a constant. A constant that shadows a sampled dimension
    /// removes that dimension from the space.
    pub fn with_constant(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        let key = key.into();
        self.space.parameters.retain(|p| p.name != key);
        self.seed_columns.retain(|c| *c != key);
        self.constants.insert(key, value.into());
        self
    }

    /// Names of the sampled dimensions.
    pub fn sampled(&self) -> Vec<String> {
        self.space.names().map(str::to_string).collect()
    }

    /// Fail before any trial starts when no backend builds the `model` constant.
    pub fn check_model(&self, registry: &ModelRegistry) -> TuneResult<()> {
        let Some(kind) = self.constants.get("model").and_then(ParameterValue::as_str) else {
            return Err(config_error!("experiment {} has no model constant", self.name));
        };
        if registry.contains(kind) {
            return Ok(());
        }
        Err(config_error!(
            "no backend for model {} (available: {}); pass --model {}",
            kind,
            registry.kinds().join(", "),
            registry.kinds().first().map(String::as_str).unwrap_or("<kind>")
        ))
    }
}

/// A template plus the seed points found for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentDefinition {
    pub template: ExperimentTemplate,
    pub seed_points: Vec<ParamMap>,
}

/// Registry of the known experiments.
#[derive(Debug, Clone)]
pub struct ExperimentCatalog {
    data_root: PathBuf,
    metric: String,
    direction: ObjectiveDirection,
}

impl ExperimentCatalog {
    pub const KNOWN: &'static [&'static str] = &["rnn", "transformer", "conv1d", "linear"];

    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            metric: "kappa".to_string(),
            direction: ObjectiveDirection::Maximize,
        }
    }

    /// Metric used to rank prior rows when mining seed points.
    pub fn with_metric(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn template(&self, name: &str) -> TuneResult<ExperimentTemplate> {
        let template = match name {
            "rnn" => self.rnn(),
            "transformer" => self.transformer(),
            "conv1d" => self.conv1d(),
            "linear" => self.linear(),
            _ => {
                return Err(TuneError::UnknownExperiment {
                    name: name.to_string(),
                    known: Self::KNOWN.join(", "),
                })
            }
        };
        template.space.validate()?;
        Ok(template)
    }

    /// Template plus seed points mined from `<prior_dir>`, the directory of
    /// an earlier run of the same experiment.
    pub fn definition(&self, name: &str, prior_dir: &Path) -> TuneResult<ExperimentDefinition> {
        let template = self.template(name)?;
        let seed_points = self.seed_points(&template, prior_dir);
        Ok(ExperimentDefinition {
            template,
            seed_points,
        })
    }

    /// Top rows of the prior run, reduced to the template's seed columns.
    /// Never fails: any problem is logged and yields no points.
    pub fn seed_points(&self, template: &ExperimentTemplate, prior_dir: &Path) -> Vec<ParamMap> {
        if template.seed_columns.is_empty() {
            return Vec::new();
        }

        let table = match load_prior_table(prior_dir) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(
                    "could not extract previous runs from {}: {}",
                    prior_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let columns: Vec<&str> = template.seed_columns.iter().map(String::as_str).collect();
        let points = table.top_configs(&self.metric, self.direction, SEED_POINTS, &columns);
        if points.is_empty() {
            tracing::warn!("could not extract previous runs from {}", prior_dir.display());
        } else {
            tracing::info!(
                "Seeding {} with {} points from {}",
                template.name,
                points.len(),
                prior_dir.display()
            );
        }
        points
    }

    // ---- templates ----

    fn dataset_constants(&self, epochs: i64, model: &str) -> ParamMap {
        let root = self.data_root.join(DATASET);
        let mut constants = ParamMap::new();
        constants.insert("epochs".into(), ParameterValue::Int(epochs));
        constants.insert("model".into(), model.into());
        constants.insert("dataset".into(), DATASET.into());
        constants.insert(
            "classmapping".into(),
            root.join("classmapping.csv.gaf.v2").to_string_lossy().into_owned().into(),
        );
        constants.insert(
            "trainids".into(),
            root.join("ids/random/holl_2018_mt_pilot_train.txt")
                .to_string_lossy()
                .into_owned()
                .into(),
        );
        constants.insert("testids".into(), ParameterValue::Json(serde_json::Value::Null));
        constants.insert("samplet".into(), ParameterValue::Int(50));
        constants.insert("bidirectional".into(), true.into());
        constants.insert("train_on".into(), "train".into());
        constants.insert("test_on".into(), "valid".into());
        constants.insert("trainregions".into(), json!([REGION]).into());
        constants.insert("testregions".into(), json!([REGION]).into());
        constants
    }

    fn rnn(&self) -> ExperimentTemplate {
        let space = SearchSpace::new()
            .add_choice("num_layers", (1..=7).map(|n| json!(n)).collect())
            .add_choice("hidden_dims", [16, 32, 64, 128, 256].iter().map(|n| json!(n)).collect())
            .add_float("dropout", 0.0, 1.0)
            .add_log_uniform("weight_decay", (-8.0f64).exp(), (-4.0f64).exp())
            .add_log_uniform("learning_rate", (-5.0f64).exp(), (-1.0f64).exp());
        ExperimentTemplate::new("rnn", self.dataset_constants(5, "rnn"), space).with_seed_columns(&[
            "num_layers",
            "dropout",
            "weight_decay",
            "learning_rate",
        ])
    }

    fn transformer(&self) -> ExperimentTemplate {
        let space = SearchSpace::new()
            .add_grid("hidden_dims", vec![json!(128), json!(256), json!(64)])
            .add_grid("n_heads", vec![json!(2), json!(4), json!(6), json!(8)])
            .add_grid("n_layers", vec![json!(8), json!(4), json!(2), json!(1)])
            .add_grid("samplet", vec![json!(30), json!(50), json!(70)])
            .add_grid("dropout", vec![json!(0.25), json!(0.5), json!(0.75)]);
        let mut constants = self.dataset_constants(10, "transformer");
        constants.remove("samplet");
        ExperimentTemplate::new("transformer", constants, space)
    }

    fn conv1d(&self) -> ExperimentTemplate {
        let space = SearchSpace::new()
            .add_choice("num_layers", (1..=7).map(|n| json!(n)).collect())
            .add_choice("hidden_dims", [16, 32, 64, 128, 256].iter().map(|n| json!(n)).collect())
            .add_choice("kernel_size", vec![json!(3), json!(5), json!(7)])
            .add_float("dropout", 0.0, 1.0)
            .add_log_uniform("weight_decay", (-8.0f64).exp(), (-4.0f64).exp())
            .add_log_uniform("learning_rate", (-5.0f64).exp(), (-1.0f64).exp());
        ExperimentTemplate::new("conv1d", self.dataset_constants(5, "conv1d"), space).with_seed_columns(&[
            "num_layers",
            "dropout",
            "weight_decay",
            "learning_rate",
        ])
    }

    fn linear(&self) -> ExperimentTemplate {
        let space = SearchSpace::new()
            .add_log_uniform("weight_decay", (-8.0f64).exp(), (-4.0f64).exp())
            .add_log_uniform("learning_rate", (-5.0f64).exp(), (-1.0f64).exp());
        ExperimentTemplate::new("linear", self.dataset_constants(5, "linear"), space)
            .with_seed_columns(&["weight_decay", "learning_rate"])
    }
}

/// Result table of an earlier run: the trial logs if there are any, else an
/// exported `results.csv`.
fn load_prior_table(prior_dir: &Path) -> TuneResult<ResultTable> {
    let table = ResultTable::from_experiment_dir(prior_dir)?;
    if !table.is_empty() {
        return Ok(table);
    }
    let exported = prior_dir.join(RESULTS_CSV);
    if exported.exists() {
        return ResultTable::read_csv(&exported);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;
    use tempfile::TempDir;

    fn catalog() -> ExperimentCatalog {
        ExperimentCatalog::new("/data")
    }

    #[test]
    fn rnn_template_matches_the_experiment() {
        let template = catalog().template("rnn").unwrap();
        assert_eq!(template.constants["epochs"], ParameterValue::Int(5));
        assert_eq!(template.constants["model"].as_str(), Some("rnn"));
        assert_eq!(
            template.constants["classmapping"].as_str(),
            Some("/data/BavarianCrops/classmapping.csv.gaf.v2")
        );
        assert_eq!(
            template.sampled(),
            vec!["num_layers", "hidden_dims", "dropout", "weight_decay", "learning_rate"]
        );
        assert_eq!(template.seed_columns.len(), 4);
    }

    #[test]
    fn model_without_backend_is_rejected_up_front() {
        let registry = ModelRegistry::new();
        let err = catalog().template("rnn").unwrap().check_model(&registry).unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
        assert!(err.to_string().contains("linear"));

        assert!(catalog().template("linear").unwrap().check_model(&registry).is_ok());
        let overridden = catalog().template("rnn").unwrap().with_constant("model", "linear");
        assert!(overridden.check_model(&registry).is_ok());
    }

    #[test]
    fn transformer_is_a_full_grid() {
        let template = catalog().template("transformer").unwrap();
        assert!(template.space.is_grid());
        assert_eq!(template.space.grid_size(), Some(3 * 4 * 4 * 3 * 3));
        assert!(!template.constants.contains_key("samplet"));
        assert!(template.seed_columns.is_empty());
    }

    #[test]
    fn unknown_experiment_lists_known_names() {
        let err = catalog().template("lstm").unwrap_err();
        match err {
            TuneError::UnknownExperiment { name, known } => {
                assert_eq!(name, "lstm");
                assert!(known.contains("rnn") && known.contains("transformer"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn samples_lie_in_support_for_every_experiment() {
        let mut rng = StdRng::seed_from_u64(17);
        for name in ExperimentCatalog::KNOWN {
            let template = catalog().template(name).unwrap();
            for _ in 0..200 {
                let point = template.space.sample(&mut rng);
                assert!(template.space.contains(&point), "{name}: {point:?}");
            }
        }
    }

    #[test]
    fn constant_override_removes_dimension() {
        let template = catalog()
            .template("rnn")
            .unwrap()
            .with_constant("num_layers", 2i64)
            .with_constant("model", "linear");
        assert!(template.space.parameter("num_layers").is_none());
        assert_eq!(template.constants["num_layers"], ParameterValue::Int(2));
        assert_eq!(template.constants["model"].as_str(), Some("linear"));
        assert!(!template.seed_columns.iter().any(|c| c == "num_layers"));
    }

    #[test]
    fn seeds_from_prior_csv_take_top_three() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(RESULTS_CSV),
            "kappa,loss,config/num_layers,config/dropout,config/weight_decay,config/learning_rate,config/hidden_dims\n\
             0.40,1.0,1,0.1,0.001,0.01,16\n\
             0.80,0.5,2,0.2,0.002,0.02,32\n\
             0.60,0.7,3,0.3,0.003,0.03,64\n\
             0.70,0.6,4,0.4,0.004,0.04,128\n",
        )
        .unwrap();

        let definition = catalog().definition("rnn", dir.path()).unwrap();
        let points = definition.seed_points;
        assert_eq!(points.len(), 3);
        let layers: Vec<i64> = points.iter().map(|p| p["num_layers"].as_i64().unwrap()).collect();
        assert_eq!(layers, vec![2, 4, 3]);
        for point in &points {
            assert_eq!(point.len(), 4);
            assert!(!point.contains_key("hidden_dims"));
        }
    }

    #[test]
    fn missing_prior_run_means_no_seeds() {
        let dir = TempDir::new().unwrap();
        let definition = catalog().definition("rnn", &dir.path().join("rnn")).unwrap();
        assert!(definition.seed_points.is_empty());
    }

    #[test]
    fn malformed_prior_table_means_no_seeds() {
        let dir = TempDir::new().unwrap();
        let trial = dir.path().join("trial_00000_deadbeef");
        fs::create_dir_all(&trial).unwrap();
        fs::write(trial.join("result.json"), "not json\n").unwrap();

        let definition = catalog().definition("rnn", dir.path()).unwrap();
        assert!(definition.seed_points.is_empty());
    }
}
