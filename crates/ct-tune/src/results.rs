//! Per-trial logs, the experiment result table and the best-run summary.

use chrono::Local;
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use ct_types::{DataError, MetricReport, ParamMap, ParameterValue, TrialConfig, TuneResult};

use crate::trial::ObjectiveDirection;

pub const PARAMS_FILE: &str = "params.json";
pub const RESULT_FILE: &str = "result.json";
pub const PROGRESS_FILE: &str = "progress.csv";
pub const RESULTS_CSV: &str = "results.csv";
pub const BEST_FILE: &str = "best.txt";

/// Column prefix of configuration values in exported tables.
pub const CONFIG_PREFIX: &str = "config/";
const LEGACY_CONFIG_PREFIX: &str = "config:";

const TRIAL_DIR_PREFIX: &str = "trial_";

/// One line of a trial's `result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultLine {
    pub trial_id: Uuid,
    pub trial_number: usize,
    #[serde(flatten)]
    pub report: MetricReport,
}

// ---- per-trial logs ----

/// Append-only log files of one trial directory.
#[derive(Debug, Clone)]
pub struct TrialLogger {
    dir: PathBuf,
}

impl TrialLogger {
    pub fn new(trial_dir: impl Into<PathBuf>) -> TuneResult<Self> {
        let dir = trial_dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the trial's full configuration to `params.json`.
    pub fn write_params(&self, config: &TrialConfig) -> TuneResult<()> {
        let json = serde_json::to_string_pretty(config)?;
        fs::write(self.dir.join(PARAMS_FILE), json)?;
        Ok(())
    }

    /// Append one report to `result.json` and `progress.csv`.
    pub fn log(&self, trial_id: Uuid, trial_number: usize, report: &MetricReport) -> TuneResult<()> {
        let line = ResultLine {
            trial_id,
            trial_number,
            report: report.clone(),
        };
        let mut results = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(RESULT_FILE))?;
        writeln!(results, "{}", serde_json::to_string(&line)?)?;

        self.append_progress(report)
    }

    fn append_progress(&self, report: &MetricReport) -> TuneResult<()> {
        let path = self.dir.join(PROGRESS_FILE);
        let columns = report.columns();

        // The header is fixed by the first report; later columns are dropped.
        let header: Vec<String> = match read_header(&path)? {
            Some(header) => header,
            None => {
                let header: Vec<String> = columns.keys().cloned().collect();
                let mut wtr = WriterBuilder::new().from_path(&path)?;
                wtr.write_record(&header)?;
                wtr.flush()?;
                header
            }
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
        wtr.write_record(header.iter().map(|h| columns.get(h).map(String::as_str).unwrap_or("")))?;
        wtr.flush()?;
        Ok(())
    }

    /// All reports logged so far, oldest first.
    pub fn read_results(&self) -> TuneResult<Vec<ResultLine>> {
        read_result_lines(&self.dir.join(RESULT_FILE))
    }

    /// Drop logged rounds after `iteration`, so rounds replayed from a
    /// checkpoint are not logged twice. Returns the number of dropped lines.
    pub fn truncate_after(&self, iteration: u64) -> TuneResult<usize> {
        let lines = self.read_results()?;
        let total = lines.len();
        let kept: Vec<&ResultLine> = lines
            .iter()
            .filter(|l| l.report.training_iteration <= iteration)
            .collect();
        let dropped = total - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let mut json = String::new();
        for line in kept {
            json.push_str(&serde_json::to_string(line)?);
            json.push('\n');
        }
        fs::write(self.dir.join(RESULT_FILE), json)?;
        self.truncate_progress(iteration)?;
        Ok(dropped)
    }

    fn truncate_progress(&self, iteration: u64) -> TuneResult<()> {
        let path = self.dir.join(PROGRESS_FILE);
        if read_header(&path)?.is_none() {
            return Ok(());
        }
        let mut rdr = ReaderBuilder::new().has_headers(true).from_path(&path)?;
        let header = rdr.headers()?.clone();
        let Some(column) = header.iter().position(|h| h == "training_iteration") else {
            return Ok(());
        };
        let mut kept = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let round = record.get(column).and_then(|v| v.parse::<u64>().ok());
            if round.is_some_and(|r| r <= iteration) {
                kept.push(record);
            }
        }

        let mut wtr = WriterBuilder::new().from_path(&path)?;
        wtr.write_record(&header)?;
        for record in &kept {
            wtr.write_record(record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn read_header(path: &Path) -> TuneResult<Option<Vec<String>>> {
    if !path.exists() || fs::metadata(path)?.len() == 0 {
        return Ok(None);
    }
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    Ok(Some(rdr.headers()?.iter().map(str::to_string).collect()))
}

fn read_result_lines(path: &Path) -> TuneResult<Vec<ResultLine>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str(&line).map_err(|e| DataError::ParseError {
            message: format!("{}:{}: {}", path.display(), lineno + 1, e),
        })?;
        lines.push(parsed);
    }
    Ok(lines)
}

// ---- result table ----

/// A trial's configuration and its last report.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub trial_id: Option<Uuid>,
    pub trial_number: Option<usize>,
    pub training_iteration: u64,
    pub config: ParamMap,
    pub metrics: BTreeMap<String, f64>,
}

impl ResultRow {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|v| v.is_finite())
    }
}

/// One row per trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Assemble the table from the `trial_*` directories of an experiment.
    /// Trials that have not reported yet contribute no row.
    pub fn from_experiment_dir(dir: &Path) -> TuneResult<Self> {
        if !dir.is_dir() {
            return Ok(Self::default());
        }

        let mut trial_dirs: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(TRIAL_DIR_PREFIX))
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        trial_dirs.sort();

        let mut rows = Vec::new();
        for trial_dir in trial_dirs {
            let Some(last) = read_result_lines(&trial_dir.join(RESULT_FILE))?.pop() else {
                tracing::debug!("No results yet in {}", trial_dir.display());
                continue;
            };
            let params_path = trial_dir.join(PARAMS_FILE);
            let config: ParamMap = if params_path.exists() {
                serde_json::from_str(&fs::read_to_string(&params_path)?)?
            } else {
                ParamMap::new()
            };
            rows.push(ResultRow {
                trial_id: Some(last.trial_id),
                trial_number: Some(last.trial_number),
                training_iteration: last.report.training_iteration,
                config,
                metrics: last.report.metrics,
            });
        }

        rows.sort_by_key(|r| r.trial_number);
        Ok(Self { rows })
    }

    /// Read an exported table. Configuration columns carry a `config/` (or
    /// legacy `config:`) prefix; other numeric columns are metrics.
    pub fn read_csv(path: &Path) -> TuneResult<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut row = ResultRow {
                trial_id: None,
                trial_number: None,
                training_iteration: 0,
                config: ParamMap::new(),
                metrics: BTreeMap::new(),
            };
            for (header, cell) in headers.iter().zip(record.iter()) {
                if cell.trim().is_empty() {
                    continue;
                }
                if let Some(key) = strip_config_prefix(header) {
                    row.config.insert(key.to_string(), ParameterValue::parse_cell(cell));
                    continue;
                }
                match header.as_str() {
                    "trial_id" => row.trial_id = Uuid::parse_str(cell.trim()).ok(),
                    "trial_number" => row.trial_number = cell.trim().parse().ok(),
                    "training_iteration" => {
                        row.training_iteration = cell.trim().parse().map_err(|_| DataError::ParseError {
                            message: format!("bad training_iteration '{}' in {}", cell, path.display()),
                        })?
                    }
                    _ => {
                        if let Ok(value) = cell.trim().parse::<f64>() {
                            row.metrics.insert(header.clone(), value);
                        }
                    }
                }
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    /// Export as CSV: bookkeeping columns, metrics, then `config/<key>`.
    pub fn write_csv(&self, path: &Path) -> TuneResult<()> {
        let metric_names: BTreeSet<&String> = self.rows.iter().flat_map(|r| r.metrics.keys()).collect();
        let config_keys: BTreeSet<&String> = self.rows.iter().flat_map(|r| r.config.keys()).collect();

        let mut wtr = WriterBuilder::new().from_path(path)?;
        let mut header = vec![
            "trial_id".to_string(),
            "trial_number".to_string(),
            "training_iteration".to_string(),
        ];
        header.extend(metric_names.iter().map(|m| m.to_string()));
        header.extend(config_keys.iter().map(|k| format!("{CONFIG_PREFIX}{k}")));
        wtr.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![
                row.trial_id.map(|id| id.to_string()).unwrap_or_default(),
                row.trial_number.map(|n| n.to_string()).unwrap_or_default(),
                row.training_iteration.to_string(),
            ];
            record.extend(
                metric_names
                    .iter()
                    .map(|m| row.metrics.get(*m).map(|v| v.to_string()).unwrap_or_default()),
            );
            record.extend(
                config_keys
                    .iter()
                    .map(|k| row.config.get(*k).map(|v| v.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        tracing::info!("Exported {} result rows to {}", self.rows.len(), path.display());
        Ok(())
    }

    /// Rows carrying `metric`, best first. Ties keep table order.
    pub fn ranked(&self, metric: &str, direction: ObjectiveDirection) -> Vec<&ResultRow> {
        let mut ranked: Vec<(&ResultRow, f64)> = self
            .rows
            .iter()
            .filter_map(|row| row.metric(metric).map(|v| (row, direction.orient(v))))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.into_iter().map(|(row, _)| row).collect()
    }

    pub fn best(&self, metric: &str, direction: ObjectiveDirection) -> Option<&ResultRow> {
        self.ranked(metric, direction).into_iter().next()
    }

    /// Configurations of the `k` best rows, reduced to `columns`.
    pub fn top_configs(
        &self,
        metric: &str,
        direction: ObjectiveDirection,
        k: usize,
        columns: &[&str],
    ) -> Vec<ParamMap> {
        self.ranked(metric, direction)
            .into_iter()
            .take(k)
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|c| row.config.get(*c).map(|v| (c.to_string(), v.clone())))
                    .collect()
            })
            .collect()
    }
}

fn strip_config_prefix(header: &str) -> Option<&str> {
    header
        .strip_prefix(CONFIG_PREFIX)
        .or_else(|| header.strip_prefix(LEGACY_CONFIG_PREFIX))
}

// ---- best-run summary ----

/// Append a one-line summary of the best row to `path`:
/// `<time> finished tuning dataset <dataset> <metric> <value>, <k>:<v>, ...`
pub fn append_best_summary(
    path: &Path,
    row: &ResultRow,
    metric: &str,
    parameters: &[String],
) -> TuneResult<()> {
    let time = Local::now().format("%Y-%m-%d %H:%M:%S");
    let dataset = row
        .config
        .get("dataset")
        .map(|d| d.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let perf = match row.metric(metric) {
        Some(value) => format!("{metric} {value:.2}"),
        None => format!("{metric} n/a"),
    };
    let params = parameters
        .iter()
        .map(|name| {
            let value = row.config.get(name).map(|v| v.to_string()).unwrap_or_default();
            format!("{name}:{value}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{time} finished tuning dataset {dataset} {perf}, {params}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report(iteration: u64, kappa: f64, loss: f64) -> MetricReport {
        let mut metrics = BTreeMap::new();
        metrics.insert("kappa".to_string(), kappa);
        metrics.insert("loss".to_string(), loss);
        MetricReport::new(iteration, metrics)
    }

    fn config(num_layers: i64, lr: f64) -> TrialConfig {
        let mut config = TrialConfig::default();
        config.insert("num_layers", num_layers);
        config.insert("learning_rate", lr);
        config.insert("dataset", "BavarianCrops");
        config.insert(
            "trainregions",
            serde_json::json!(["HOLL_2018_MT_pilot"]),
        );
        config
    }

    fn row(number: usize, kappa: Option<f64>, num_layers: i64) -> ResultRow {
        let mut metrics = BTreeMap::new();
        if let Some(k) = kappa {
            metrics.insert("kappa".to_string(), k);
        }
        ResultRow {
            trial_id: None,
            trial_number: Some(number),
            training_iteration: 1,
            config: config(num_layers, 0.01).into_values(),
            metrics,
        }
    }

    #[test]
    fn logger_writes_params_results_and_progress() {
        let dir = TempDir::new().unwrap();
        let logger = TrialLogger::new(dir.path().join("trial_00000_abcd1234")).unwrap();
        let id = Uuid::new_v4();

        logger.write_params(&config(3, 0.01)).unwrap();
        logger.log(id, 0, &report(1, 0.3, 1.2)).unwrap();
        logger.log(id, 0, &report(2, 0.4, 1.0)).unwrap();

        let lines = logger.read_results().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].report.training_iteration, 2);
        assert_eq!(lines[1].trial_id, id);

        let progress = fs::read_to_string(logger.dir().join(PROGRESS_FILE)).unwrap();
        let progress: Vec<&str> = progress.lines().collect();
        assert_eq!(progress.len(), 3);
        assert!(progress[0].contains("kappa"));

        let params: ParamMap =
            serde_json::from_str(&fs::read_to_string(logger.dir().join(PARAMS_FILE)).unwrap()).unwrap();
        assert_eq!(params["num_layers"], ParameterValue::Int(3));
    }

    #[test]
    fn truncate_drops_replayed_rounds() {
        let dir = TempDir::new().unwrap();
        let logger = TrialLogger::new(dir.path().join("trial_00000_abcd1234")).unwrap();
        let id = Uuid::new_v4();
        for iteration in 1..=4 {
            logger.log(id, 0, &report(iteration, 0.1 * iteration as f64, 1.0)).unwrap();
        }

        assert_eq!(logger.truncate_after(2).unwrap(), 2);
        assert_eq!(logger.truncate_after(2).unwrap(), 0);
        logger.log(id, 0, &report(3, 0.5, 0.9)).unwrap();

        let rounds: Vec<u64> = logger
            .read_results()
            .unwrap()
            .iter()
            .map(|l| l.report.training_iteration)
            .collect();
        assert_eq!(rounds, vec![1, 2, 3]);
        let progress = fs::read_to_string(logger.dir().join(PROGRESS_FILE)).unwrap();
        assert_eq!(progress.lines().count(), 4);
    }

    #[test]
    fn diverged_loss_does_not_break_the_table() {
        let dir = TempDir::new().unwrap();
        let logger = TrialLogger::new(dir.path().join("trial_00000_abcd1234")).unwrap();
        logger.write_params(&config(2, 0.01)).unwrap();
        let mut diverged = report(1, 0.3, 1.0);
        diverged.metrics.insert("loss".to_string(), f64::NAN);
        diverged.metrics.insert("lossdelta".to_string(), f64::NEG_INFINITY);
        logger.log(Uuid::new_v4(), 0, &diverged).unwrap();

        let table = ResultTable::from_experiment_dir(dir.path()).unwrap();
        assert_eq!(table.len(), 1);
        let row = &table.rows()[0];
        assert_eq!(row.metric("kappa"), Some(0.3));
        assert!(!row.metrics.contains_key("loss"));
        assert!(!row.metrics.contains_key("lossdelta"));
    }

    #[test]
    fn table_from_experiment_dir_uses_last_report() {
        let dir = TempDir::new().unwrap();
        for (n, kappa) in [(0usize, 0.2), (1, 0.6)] {
            let logger = TrialLogger::new(dir.path().join(format!("trial_{n:05}_deadbeef"))).unwrap();
            logger.write_params(&config(n as i64 + 1, 0.01)).unwrap();
            logger.log(Uuid::new_v4(), n, &report(1, kappa / 2.0, 1.0)).unwrap();
            logger.log(Uuid::new_v4(), n, &report(2, kappa, 0.8)).unwrap();
        }
        // a trial that never reported
        TrialLogger::new(dir.path().join("trial_00002_cafebabe")).unwrap();

        let table = ResultTable::from_experiment_dir(dir.path()).unwrap();
        assert_eq!(table.len(), 2);
        let best = table.best("kappa", ObjectiveDirection::Maximize).unwrap();
        assert_eq!(best.trial_number, Some(1));
        assert_eq!(best.training_iteration, 2);
        assert_eq!(best.config["num_layers"], ParameterValue::Int(2));
    }

    #[test]
    fn missing_experiment_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let table = ResultTable::from_experiment_dir(&dir.path().join("nope")).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn csv_export_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESULTS_CSV);
        let table = ResultTable::new(vec![row(0, Some(0.5), 2), row(1, None, 4)]);
        table.write_csv(&path).unwrap();

        let back = ResultTable::read_csv(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.rows()[0].metric("kappa"), Some(0.5));
        assert_eq!(back.rows()[1].metric("kappa"), None);
        assert_eq!(back.rows()[0].config["num_layers"], ParameterValue::Int(2));
        assert_eq!(back.rows()[0].config["dataset"].as_str(), Some("BavarianCrops"));
        assert_eq!(
            back.rows()[0].config["trainregions"],
            ParameterValue::Json(serde_json::json!(["HOLL_2018_MT_pilot"]))
        );
    }

    #[test]
    fn legacy_config_prefix_is_stripped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(
            &path,
            "kappa,config:num_layers,config:dropout\n0.4,3,0.25\n0.7,5,0.5\n",
        )
        .unwrap();

        let table = ResultTable::read_csv(&path).unwrap();
        let top = table.top_configs("kappa", ObjectiveDirection::Maximize, 1, &["num_layers", "dropout"]);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["num_layers"], ParameterValue::Int(5));
        assert_eq!(top[0]["dropout"], ParameterValue::Float(0.5));
    }

    #[test]
    fn top_configs_ranks_and_reduces() {
        let table = ResultTable::new(vec![
            row(0, Some(0.1), 1),
            row(1, Some(0.9), 2),
            row(2, Some(0.5), 3),
            row(3, Some(0.7), 4),
            row(4, None, 5),
        ]);
        let top = table.top_configs("kappa", ObjectiveDirection::Maximize, 3, &["num_layers", "learning_rate"]);
        let layers: Vec<i64> = top.iter().map(|p| p["num_layers"].as_i64().unwrap()).collect();
        assert_eq!(layers, vec![2, 4, 3]);
        assert!(top.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn best_summary_line_is_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BEST_FILE);
        let best = row(1, Some(0.6789), 4);
        let params = vec!["learning_rate".to_string(), "num_layers".to_string()];

        append_best_summary(&path, &best, "kappa", &params).unwrap();
        append_best_summary(&path, &best, "kappa", &params).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("finished tuning dataset BavarianCrops kappa 0.68, learning_rate:0.01, num_layers:4"));
    }
}
