//! Run driver: a pool of worker threads, each owning one trainable actor,
//! coordinated by a single driver loop over crossbeam channels.
//!
//! Rounds of one trial are strictly sequential because every worker drains
//! its own FIFO command channel. Suspension points are round boundaries:
//! the scheduler and stop requests act between rounds.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use ct_types::{
    validation_error, MetricReport, ParamMap, TrialConfig, TrialError, TuneError, TuneResult,
};

use crate::algorithm::SearchAlgorithm;
use crate::checkpoint::{checkpoint_dir, CheckpointRecord};
use crate::experiments::{ExperimentDefinition, ExperimentTemplate};
use crate::resources::{ClusterResources, WorkerAllocation};
use crate::results::{append_best_summary, ResultRow, ResultTable, TrialLogger, BEST_FILE, RESULTS_CSV};
use crate::scheduler::{SchedulerDecision, TrialScheduler};
use crate::search::SearchStrategy;
use crate::state::ExperimentState;
use crate::trainable::{Trainable, TrainableFactory};
use crate::trial::{RunStatus, Trial, TrialStatus, TuneConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ---- worker protocol ----

enum WorkerCommand {
    Start {
        trial_id: Uuid,
        config: TrialConfig,
        restore_from: Option<PathBuf>,
    },
    Step {
        trial_id: Uuid,
    },
    Save {
        trial_id: Uuid,
        dir: PathBuf,
    },
    /// The trial left this worker; the actor is kept for reuse or stopped.
    Release,
    Shutdown,
}

enum WorkerEvent {
    Started {
        worker: usize,
        trial_id: Uuid,
        result: Result<(), String>,
    },
    Stepped {
        trial_id: Uuid,
        result: Result<BTreeMap<String, f64>, String>,
        elapsed_s: f64,
    },
    Saved {
        trial_id: Uuid,
        result: Result<PathBuf, String>,
    },
}

struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
    trial: Option<Uuid>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f`, turning errors and panics into a message. A panic also drops
/// the actor so the next trial gets a fresh one.
fn guarded<T>(actor: &mut Option<Box<dyn Trainable>>, f: impl FnOnce(&mut Option<Box<dyn Trainable>>) -> TuneResult<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *actor))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => {
            *actor = None;
            Err(TuneError::from(TrialError::Panicked {
                message: panic_message(payload.as_ref()),
            })
            .to_string())
        }
    }
}

fn configured(actor: &mut Option<Box<dyn Trainable>>) -> TuneResult<&mut Box<dyn Trainable>> {
    actor
        .as_mut()
        .ok_or_else(|| TrialError::NotConfigured.into())
}

fn worker_loop(
    worker: usize,
    factory: TrainableFactory,
    reuse_actors: bool,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
) {
    let mut actor: Option<Box<dyn Trainable>> = None;

    for command in commands.iter() {
        let event = match command {
            WorkerCommand::Start {
                trial_id,
                config,
                restore_from,
            } => {
                let result = guarded(&mut actor, |actor| {
                    let reused = reuse_actors && actor.is_some();
                    if !reused {
                        if let Some(mut old) = actor.take() {
                            old.stop();
                        }
                        *actor = Some(factory());
                    }
                    let trainable = configured(actor)?;
                    if reused {
                        trainable.reset(&config)?;
                    } else {
                        trainable.setup(&config)?;
                    }
                    if let Some(path) = &restore_from {
                        trainable.restore(path)?;
                    }
                    Ok(())
                });
                WorkerEvent::Started {
                    worker,
                    trial_id,
                    result,
                }
            }
            WorkerCommand::Step { trial_id } => {
                let started = Instant::now();
                let result = guarded(&mut actor, |actor| configured(actor)?.step());
                WorkerEvent::Stepped {
                    trial_id,
                    result,
                    elapsed_s: started.elapsed().as_secs_f64(),
                }
            }
            WorkerCommand::Save { trial_id, dir } => {
                let result = guarded(&mut actor, |actor| configured(actor)?.save(&dir));
                WorkerEvent::Saved { trial_id, result }
            }
            WorkerCommand::Release => {
                if !reuse_actors {
                    if let Some(mut old) = actor.take() {
                        old.stop();
                    }
                }
                continue;
            }
            WorkerCommand::Shutdown => break,
        };

        if events.send(event).is_err() {
            break;
        }
    }

    if let Some(mut actor) = actor.take() {
        actor.stop();
    }
    tracing::debug!("Worker {} exiting", worker);
}

// ---- public handles ----

/// Requests a graceful stop: no new trials start, running trials are
/// checkpointed after their current round and left resumable.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct TuneAnalysis {
    pub experiment_dir: PathBuf,
    pub metric: String,
    pub status: RunStatus,
    pub trials: Vec<Trial>,
    pub table: ResultTable,
}

impl TuneAnalysis {
    pub fn best_trial(&self) -> Option<&Trial> {
        let best = self.status.best_trial.as_ref()?;
        self.trials.iter().find(|t| t.id == best.trial_id)
    }

    /// Full configuration of the best trial.
    pub fn best_config(&self) -> Option<&TrialConfig> {
        self.best_trial().map(|t| &t.config)
    }

    pub fn best_row(&self) -> Option<&ResultRow> {
        self.table.best(&self.metric, self.status.direction)
    }
}

// ---- driver ----

pub struct TuneRunner {
    config: TuneConfig,
    template: ExperimentTemplate,
    seed_points: Vec<ParamMap>,
    factory: TrainableFactory,
    cluster: Option<ClusterResources>,
    strategy: Option<Box<dyn SearchStrategy>>,
    export_path: Option<PathBuf>,
    status: Arc<RwLock<RunStatus>>,
    stop: StopHandle,
}

impl TuneRunner {
    pub fn new(config: TuneConfig, definition: ExperimentDefinition, factory: TrainableFactory) -> Self {
        let status = Arc::new(RwLock::new(RunStatus::new(&config)));
        Self {
            config,
            template: definition.template,
            seed_points: definition.seed_points,
            factory,
            cluster: None,
            strategy: None,
            export_path: None,
            status,
            stop: StopHandle::default(),
        }
    }

    /// Use fixed cluster resources instead of detecting them.
    pub fn with_cluster(mut self, cluster: ClusterResources) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replace the default strategy (grid for grid spaces, else TPE).
    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Also write the result table to `path`.
    pub fn with_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.export_path = Some(path.into());
        self
    }

    /// Share an existing stop handle, e.g. one wired to a signal handler.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn status_handle(&self) -> Arc<RwLock<RunStatus>> {
        self.status.clone()
    }

    /// Block until every trial has finished or a stop was requested.
    pub fn run(self) -> TuneResult<TuneAnalysis> {
        let status = self.status.clone();
        match self.run_inner() {
            Ok(analysis) => Ok(analysis),
            Err(e) => {
                status.write().mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    fn run_inner(self) -> TuneResult<TuneAnalysis> {
        self.config.validate()?;
        self.template.space.validate()?;
        if self.config.scheduler.max_t().is_none() {
            return Err(validation_error!(
                "the scheduler has no max_t; trials would never finish"
            ));
        }

        let experiment_dir = self.config.experiment_dir();
        std::fs::create_dir_all(&experiment_dir)?;

        let cluster = self
            .cluster
            .unwrap_or_else(|| ClusterResources::detect(self.config.total_gpus));
        let allocation = WorkerAllocation::plan(
            cluster,
            self.config.resources_per_trial,
            self.config.max_concurrent,
        );

        let mut algorithm = SearchAlgorithm::new(
            self.template.space.clone(),
            self.template.constants.clone(),
            self.config.metric.clone(),
            self.config.seed,
        )
        .with_direction(self.config.direction)
        .with_max_concurrent(self.config.max_concurrent)
        .with_points_to_evaluate(self.seed_points.clone());
        if let Some(strategy) = self.strategy {
            algorithm = algorithm.with_strategy(strategy);
        }
        let scheduler = self
            .config
            .scheduler
            .build(&self.config.metric, self.config.direction, self.config.seed);

        tracing::info!(
            "Starting experiment {} in {}: {} samples, {} workers ({} CPU / {} GPU per trial), search {}, scheduler {}",
            self.template.name,
            experiment_dir.display(),
            self.config.num_samples,
            allocation.num_workers,
            allocation.resources.cpu,
            allocation.resources.gpu,
            algorithm.strategy_name(),
            scheduler.name()
        );

        let mut driver = Driver {
            config: self.config,
            experiment_dir,
            algorithm,
            scheduler,
            trials: Vec::new(),
            index: HashMap::new(),
            loggers: HashMap::new(),
            resume_queue: VecDeque::new(),
            next_trial_number: 0,
            status: self.status,
            stop: self.stop,
            allocation,
            sampled: self.template.sampled(),
            export_path: self.export_path,
            pending_saves: 0,
        };
        driver.config.resources_per_trial = driver.allocation.resources;

        if driver.config.resume {
            driver.restore_state()?;
        }
        driver.status.write().mark_running();

        let (event_tx, event_rx) = unbounded();
        let mut workers: Vec<WorkerHandle> = (0..driver.allocation.num_workers)
            .map(|worker| -> TuneResult<WorkerHandle> {
                let (cmd_tx, cmd_rx) = unbounded();
                let factory = self.factory.clone();
                let events = event_tx.clone();
                let reuse = driver.config.reuse_actors;
                let thread = thread::Builder::new()
                    .name(format!("croptune-worker-{worker}"))
                    .spawn(move || worker_loop(worker, factory, reuse, cmd_rx, events))?;
                Ok(WorkerHandle {
                    commands: cmd_tx,
                    thread: Some(thread),
                    trial: None,
                })
            })
            .collect::<TuneResult<_>>()?;
        drop(event_tx);

        let outcome = driver.event_loop(&mut workers, &event_rx);

        for worker in &workers {
            let _ = worker.commands.send(WorkerCommand::Shutdown);
        }
        for worker in &mut workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::warn!("A worker thread panicked during shutdown");
                }
            }
        }
        outcome?;

        driver.finish()
    }
}

struct Driver {
    config: TuneConfig,
    experiment_dir: PathBuf,
    algorithm: SearchAlgorithm,
    scheduler: Box<dyn TrialScheduler>,
    trials: Vec<Trial>,
    index: HashMap<Uuid, usize>,
    loggers: HashMap<Uuid, TrialLogger>,
    /// Unfinished trials of a resumed run, with the checkpoint to restore.
    resume_queue: VecDeque<(Uuid, Option<PathBuf>)>,
    next_trial_number: usize,
    status: Arc<RwLock<RunStatus>>,
    stop: StopHandle,
    allocation: WorkerAllocation,
    /// Names of the sampled parameters, for the best-run summary.
    sampled: Vec<String>,
    export_path: Option<PathBuf>,
    /// Checkpoints requested but not yet acknowledged by a worker.
    pending_saves: usize,
}

impl Driver {
    fn trial_mut(&mut self, id: Uuid) -> Option<&mut Trial> {
        let idx = *self.index.get(&id)?;
        self.trials.get_mut(idx)
    }

    fn add_trial(&mut self, trial: Trial) {
        self.index.insert(trial.id, self.trials.len());
        self.trials.push(trial);
    }

    // ---- resume ----

    fn restore_state(&mut self) -> TuneResult<()> {
        let Some(state) = ExperimentState::load(&self.experiment_dir)? else {
            return Ok(());
        };
        self.config.id = state.config.id;
        self.status.write().id = state.config.id;
        self.next_trial_number = state.next_trial_number;

        let mut finished = 0;
        for mut trial in state.trials {
            self.scheduler.on_trial_add(trial.id);

            if trial.status.is_finished() {
                for report in &trial.results {
                    self.scheduler.on_trial_result(trial.id, report);
                }
                match trial.status {
                    TrialStatus::Completed => self.scheduler.on_trial_complete(trial.id, trial.last_result.as_ref()),
                    _ => self.scheduler.on_trial_remove(trial.id),
                }
                self.algorithm.register_live(trial.id, trial.parameters.clone());
                self.algorithm.on_trial_complete(trial.id, trial.last_result.as_ref());
                finished += 1;
            } else {
                // Rounds after the latest checkpoint are replayed.
                let restore_from = trial.checkpoints.latest().map(|c| (c.iteration, c.path.clone()));
                let resume_at = restore_from.as_ref().map(|(iter, _)| *iter).unwrap_or(0);
                trial.results.retain(|r| r.training_iteration <= resume_at);
                trial.last_result = trial.results.last().cloned();
                for report in &trial.results {
                    self.scheduler.on_trial_result(trial.id, report);
                }
                trial.status = TrialStatus::Pending;
                self.algorithm.register_live(trial.id, trial.parameters.clone());
                self.resume_queue.push_back((trial.id, restore_from.map(|(_, path)| path)));
            }
            self.add_trial(trial);
        }

        tracing::info!(
            "Resuming experiment {}: {} finished trials, {} to restore",
            self.config.name,
            finished,
            self.resume_queue.len()
        );
        Ok(())
    }

    // ---- main loop ----

    fn event_loop(&mut self, workers: &mut [WorkerHandle], events: &Receiver<WorkerEvent>) -> TuneResult<()> {
        let period = Duration::from_secs(self.config.global_checkpoint_period_s);
        let mut last_state_save = Instant::now();

        loop {
            if !self.stop.is_stop_requested() {
                self.launch_trials(workers)?;
            }

            let busy = workers.iter().filter(|w| w.trial.is_some()).count();
            if busy == 0 && self.pending_saves == 0 {
                break;
            }

            match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.handle_event(event, workers),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TrialError::WorkerLost {
                        message: "all workers disconnected".to_string(),
                    }
                    .into())
                }
            }

            if last_state_save.elapsed() >= period {
                self.save_state();
                last_state_save = Instant::now();
            }
        }

        self.save_state();
        Ok(())
    }

    fn launch_trials(&mut self, workers: &mut [WorkerHandle]) -> TuneResult<()> {
        'workers: for worker in 0..workers.len() {
            while workers[worker].trial.is_none() {
                let Some((trial_id, restore_from, resumed)) = self.next_trial() else {
                    break 'workers;
                };
                let Some(idx) = self.index.get(&trial_id).copied() else {
                    continue;
                };

                // A trial whose logs cannot be opened fails alone.
                let logger = match self.open_logger(&self.trials[idx], resumed) {
                    Ok(logger) => logger,
                    Err(err) => {
                        self.fail_trial(workers, trial_id, format!("cannot open trial logs: {err}"));
                        continue;
                    }
                };
                self.loggers.insert(trial_id, logger);

                let trial = &mut self.trials[idx];
                tracing::info!(
                    "Launching trial {} on worker {}{}: {}",
                    trial.trial_number,
                    worker,
                    if restore_from.is_some() { " (restored)" } else { "" },
                    TrialConfig::new(trial.parameters.clone())
                );
                trial.mark_running(Some(worker));

                let command = WorkerCommand::Start {
                    trial_id,
                    config: trial.config.clone(),
                    restore_from,
                };
                if workers[worker].commands.send(command).is_err() {
                    return Err(TrialError::WorkerLost {
                        message: format!("worker {worker} is gone"),
                    }
                    .into());
                }
                workers[worker].trial = Some(trial_id);
            }
        }
        self.refresh_status();
        Ok(())
    }

    /// Restored trials first, then new suggestions. The flag marks a restored trial.
    fn next_trial(&mut self) -> Option<(Uuid, Option<PathBuf>, bool)> {
        if let Some((trial_id, restore_from)) = self.resume_queue.pop_front() {
            return Some((trial_id, restore_from, true));
        }
        if self.trials.len() >= self.config.num_samples {
            return None;
        }
        let candidate = Uuid::new_v4();
        let suggestion = self.algorithm.suggest(candidate)?;
        let mut trial = Trial::new(
            self.config.id,
            self.next_trial_number,
            suggestion.parameters,
            suggestion.config,
            self.config.resources_per_trial,
        );
        trial.id = candidate;
        self.next_trial_number += 1;
        self.scheduler.on_trial_add(trial.id);
        self.add_trial(trial);
        Some((candidate, None, false))
    }

    fn open_logger(&self, trial: &Trial, resumed: bool) -> TuneResult<TrialLogger> {
        let logger = TrialLogger::new(trial.dir(&self.experiment_dir))?;
        logger.write_params(&trial.config)?;
        if resumed {
            let dropped = logger.truncate_after(trial.iteration())?;
            if dropped > 0 {
                tracing::debug!(
                    "Trial {}: dropped {} logged rounds after iteration {}",
                    trial.trial_number,
                    dropped,
                    trial.iteration()
                );
            }
        }
        Ok(logger)
    }

    fn send(&self, workers: &[WorkerHandle], trial_id: Uuid, command: WorkerCommand) {
        let Some(worker) = workers.iter().find(|w| w.trial == Some(trial_id)) else {
            tracing::warn!("Trial {} is not assigned to any worker", trial_id);
            return;
        };
        if worker.commands.send(command).is_err() {
            tracing::error!("Worker for trial {} is gone", trial_id);
        }
    }

    fn request_save(&mut self, workers: &[WorkerHandle], trial_id: Uuid, dir: PathBuf) {
        if let Some(worker) = workers.iter().find(|w| w.trial == Some(trial_id)) {
            if worker.commands.send(WorkerCommand::Save { trial_id, dir }).is_ok() {
                self.pending_saves += 1;
            }
        }
    }

    fn release(&self, workers: &mut [WorkerHandle], trial_id: Uuid) {
        if let Some(worker) = workers.iter_mut().find(|w| w.trial == Some(trial_id)) {
            let _ = worker.commands.send(WorkerCommand::Release);
            worker.trial = None;
        }
    }

    fn handle_event(&mut self, event: WorkerEvent, workers: &mut [WorkerHandle]) {
        match event {
            WorkerEvent::Started {
                worker,
                trial_id,
                result,
            } => match result {
                Ok(()) => {
                    tracing::debug!("Trial {} set up on worker {}", trial_id, worker);
                    self.send(workers, trial_id, WorkerCommand::Step { trial_id });
                }
                Err(message) => self.fail_trial(workers, trial_id, message),
            },
            WorkerEvent::Stepped {
                trial_id,
                result,
                elapsed_s,
            } => match result {
                Ok(metrics) => self.on_round(workers, trial_id, metrics, elapsed_s),
                Err(message) => self.fail_trial(workers, trial_id, message),
            },
            WorkerEvent::Saved { trial_id, result } => {
                self.pending_saves = self.pending_saves.saturating_sub(1);
                match result {
                    Ok(path) => self.record_checkpoint(trial_id, path),
                    Err(message) => tracing::warn!("Checkpoint of trial {} failed: {}", trial_id, message),
                }
            }
        }
        self.refresh_status();
    }

    fn on_round(&mut self, workers: &mut [WorkerHandle], trial_id: Uuid, metrics: BTreeMap<String, f64>, elapsed_s: f64) {
        let metric = self.config.metric.clone();
        let Some(idx) = self.index.get(&trial_id).copied() else {
            return;
        };
        let trial = &mut self.trials[idx];
        let iteration = trial.iteration() + 1;
        let total_s = trial.last_result.as_ref().map(|r| r.time_total_s).unwrap_or(0.0) + elapsed_s;
        let report = MetricReport::new(iteration, metrics).with_timing(elapsed_s, total_s);

        if report.metric(&metric).is_none() {
            let message = TuneError::from(TrialError::MissingMetric { metric }).to_string();
            self.fail_trial(workers, trial_id, message);
            return;
        }

        trial.record(report.clone());
        let trial_number = trial.trial_number;
        let trial_dir = trial.dir(&self.experiment_dir);
        if let Some(logger) = self.loggers.get(&trial_id) {
            if let Err(e) = logger.log(trial_id, trial_number, &report) {
                tracing::warn!("Failed to log result of trial {}: {}", trial_number, e);
            }
        }
        tracing::debug!(
            "Trial {} iteration {}: {} = {:?}",
            trial_number,
            iteration,
            metric,
            report.metric(&metric)
        );

        let decision = self.scheduler.on_trial_result(trial_id, &report);
        let periodic =
            self.config.checkpoint_freq > 0 && iteration % self.config.checkpoint_freq == 0;
        let save_dir = checkpoint_dir(&trial_dir, iteration);

        if decision == SchedulerDecision::Stop {
            if periodic || self.config.checkpoint_at_end {
                self.request_save(workers, trial_id, save_dir);
            }
            let reached_budget = self
                .config
                .scheduler
                .max_t()
                .is_some_and(|max_t| iteration >= max_t);
            if reached_budget {
                self.scheduler.on_trial_complete(trial_id, Some(&report));
            } else {
                self.scheduler.on_trial_remove(trial_id);
            }
            self.algorithm.on_trial_complete(trial_id, Some(&report));
            if let Some(trial) = self.trial_mut(trial_id) {
                if reached_budget {
                    trial.mark_completed();
                    tracing::info!("Trial {} completed after {} iterations", trial_number, iteration);
                } else {
                    trial.mark_pruned();
                    tracing::info!("Trial {} stopped early at iteration {}", trial_number, iteration);
                }
            }
            self.release(workers, trial_id);
        } else if self.stop.is_stop_requested() {
            // Leave the trial resumable from this round.
            self.request_save(workers, trial_id, save_dir);
            if let Some(trial) = self.trial_mut(trial_id) {
                trial.status = TrialStatus::Pending;
            }
            self.release(workers, trial_id);
        } else {
            if periodic {
                self.request_save(workers, trial_id, save_dir);
            }
            self.send(workers, trial_id, WorkerCommand::Step { trial_id });
        }
    }

    fn fail_trial(&mut self, workers: &mut [WorkerHandle], trial_id: Uuid, message: String) {
        if let Some(trial) = self.trial_mut(trial_id) {
            tracing::error!("Trial {} failed: {}", trial.trial_number, message);
            trial.mark_failed(message);
        }
        self.scheduler.on_trial_remove(trial_id);
        self.algorithm.on_trial_complete(trial_id, None);
        self.release(workers, trial_id);
    }

    fn record_checkpoint(&mut self, trial_id: Uuid, path: PathBuf) {
        let score_attr = self.config.checkpoint_score_attr.clone();
        let keep = self.config.keep_checkpoints_num;
        let direction = self.config.direction;
        let Some(trial) = self.trial_mut(trial_id) else {
            return;
        };
        let iteration = trial.iteration();
        let score = trial.last_result.as_ref().and_then(|r| r.metric(&score_attr));
        tracing::debug!("Trial {} checkpointed at iteration {}", trial.trial_number, iteration);
        trial
            .checkpoints
            .add(CheckpointRecord::new(iteration, path, score), keep, direction);
    }

    fn refresh_status(&self) {
        let mut status = self.status.write();
        status.trials_completed = self.count(TrialStatus::Completed);
        status.trials_pruned = self.count(TrialStatus::Pruned);
        status.trials_failed = self.count(TrialStatus::Failed);
        status.trials_running = self.count(TrialStatus::Running);
    }

    fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }

    fn save_state(&self) {
        let state = ExperimentState::new(self.config.clone(), self.trials.clone(), self.next_trial_number);
        if let Err(e) = state.save(&self.experiment_dir) {
            tracing::warn!("Failed to save experiment state: {}", e);
        }
    }

    // ---- completion ----

    fn finish(self) -> TuneResult<TuneAnalysis> {
        let metric = self.config.metric.clone();
        let stopped = self.stop.is_stop_requested();

        let status = {
            let mut status = self.status.write();
            for trial in &self.trials {
                if matches!(trial.status, TrialStatus::Completed | TrialStatus::Pruned) {
                    if let Some(result) = trial.result(&metric) {
                        status.update_best(&result);
                    }
                }
            }
            if stopped {
                status.mark_cancelled();
            } else {
                status.mark_completed();
            }
            status.clone()
        };

        let table = match ResultTable::from_experiment_dir(&self.experiment_dir) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!("Could not read trial logs back: {}", e);
                table_from_trials(&self.trials)
            }
        };

        let analysis = TuneAnalysis {
            experiment_dir: self.experiment_dir.clone(),
            metric: metric.clone(),
            status,
            trials: self.trials,
            table,
        };

        match analysis.best_config() {
            Some(best) => tracing::info!("Best config is {}", best),
            None => tracing::warn!("No trial reported {}", metric),
        }

        if let Some(row) = analysis.best_row() {
            append_best_summary(&self.experiment_dir.join(BEST_FILE), row, &metric, &self.sampled)?;
        }
        analysis.table.write_csv(&self.experiment_dir.join(RESULTS_CSV))?;
        if let Some(path) = &self.export_path {
            analysis.table.write_csv(path)?;
        }

        tracing::info!(
            "Experiment {} {:?}: {} completed, {} pruned, {} failed",
            self.config.name,
            analysis.status.state,
            analysis.status.trials_completed,
            analysis.status.trials_pruned,
            analysis.status.trials_failed
        );
        Ok(analysis)
    }
}

fn table_from_trials(trials: &[Trial]) -> ResultTable {
    ResultTable::new(
        trials
            .iter()
            .filter_map(|trial| {
                let report = trial.last_result.as_ref()?;
                Some(ResultRow {
                    trial_id: Some(trial.id),
                    trial_number: Some(trial.trial_number),
                    training_iteration: report.training_iteration,
                    config: trial.config.values().clone(),
                    metrics: report.metrics.clone(),
                })
            })
            .collect(),
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::TrialResources;
    use crate::results::{ResultLine, RESULT_FILE};
    use crate::scheduler::SchedulerConfig;
    use crate::search::SearchSpace;
    use crate::trainable::ActorState;
    use crate::trial::RunState;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Reports `kappa = score` every round. `mode` switches to a panicking,
    /// a metric-less or a NaN-loss actor.
    struct ScriptedTrainable {
        score: f64,
        mode: String,
        iteration: u64,
        stop_at: Option<(StopHandle, u64)>,
        state: ActorState,
    }

    impl Trainable for ScriptedTrainable {
        fn setup(&mut self, config: &TrialConfig) -> TuneResult<()> {
            self.score = config.get_f64("score")?;
            self.mode = if config.contains("mode") {
                config.get_str("mode")?.to_string()
            } else {
                "ok".to_string()
            };
            self.iteration = 0;
            self.state = ActorState::Configured;
            Ok(())
        }

        fn step(&mut self) -> TuneResult<BTreeMap<String, f64>> {
            self.iteration += 1;
            if let Some((handle, at)) = &self.stop_at {
                if self.iteration == *at {
                    handle.request_stop();
                }
            }
            let mut metrics = BTreeMap::new();
            metrics.insert("loss".to_string(), 1.0 - self.score);
            match self.mode.as_str() {
                "panic" => panic!("diverged at iteration {}", self.iteration),
                "silent" => {}
                "diverge" => {
                    metrics.insert("loss".to_string(), f64::NAN);
                    metrics.insert("kappa".to_string(), self.score);
                }
                _ => {
                    metrics.insert("kappa".to_string(), self.score);
                }
            }
            self.state = ActorState::Evaluated;
            Ok(metrics)
        }

        fn save(&mut self, dir: &Path) -> TuneResult<PathBuf> {
            fs::create_dir_all(dir)?;
            let path = dir.join("state.txt");
            fs::write(&path, self.iteration.to_string())?;
            Ok(path)
        }

        fn restore(&mut self, path: &Path) -> TuneResult<()> {
            let text = fs::read_to_string(path)?;
            self.iteration = text
                .trim()
                .parse()
                .map_err(|_| TuneError::Checkpoint(format!("bad state in {}", path.display())))?;
            self.state = ActorState::Restored;
            Ok(())
        }

        fn stop(&mut self) {
            self.state = ActorState::Terminated;
        }

        fn state(&self) -> ActorState {
            self.state
        }
    }

    fn factory(stop_at: Option<(StopHandle, u64)>) -> TrainableFactory {
        Arc::new(move || {
            Box::new(ScriptedTrainable {
                score: 0.0,
                mode: String::new(),
                iteration: 0,
                stop_at: stop_at.clone(),
                state: ActorState::Uninitialized,
            }) as Box<dyn Trainable>
        })
    }

    fn runner(
        dir: &Path,
        space: SearchSpace,
        scheduler: SchedulerConfig,
        workers: usize,
        factory: TrainableFactory,
    ) -> TuneRunner {
        let config = TuneConfig::new("scripted", dir)
            .with_num_samples(8)
            .with_max_concurrent(workers)
            .with_scheduler(scheduler)
            .with_resources(TrialResources::new(1.0, 0.0))
            .with_resume(false)
            .with_seed(7);
        let definition = ExperimentDefinition {
            template: ExperimentTemplate::new("scripted", ParamMap::new(), space),
            seed_points: Vec::new(),
        };
        TuneRunner::new(config, definition, factory).with_cluster(ClusterResources {
            num_cpus: workers as f64,
            num_gpus: 0.0,
        })
    }

    fn scores(values: &[f64]) -> SearchSpace {
        SearchSpace::new().add_grid("score", values.iter().map(|v| json!(v)).collect())
    }

    #[test]
    fn every_grid_point_runs_to_max_t() {
        let dir = TempDir::new().unwrap();
        let analysis = runner(
            dir.path(),
            scores(&[0.1, 0.5, 0.9]),
            SchedulerConfig::Fifo { max_t: Some(3) },
            2,
            factory(None),
        )
        .run()
        .unwrap();

        assert_eq!(analysis.status.state, RunState::Completed);
        assert_eq!(analysis.status.trials_completed, 3);
        assert_eq!(analysis.trials.len(), 3);
        for trial in &analysis.trials {
            assert_eq!(trial.status, TrialStatus::Completed);
            assert_eq!(trial.results.len(), 3);
            assert_eq!(trial.checkpoints.latest().map(|c| c.iteration), Some(3));
        }
        let best = analysis.best_config().unwrap();
        assert_eq!(best.get_f64("score").unwrap(), 0.9);
        assert_eq!(analysis.table.len(), 3);
        assert_eq!(analysis.best_row().and_then(|r| r.metric("kappa")), Some(0.9));

        let experiment_dir = dir.path().join("scripted");
        assert!(experiment_dir.join(RESULTS_CSV).exists());
        let summary = fs::read_to_string(experiment_dir.join(BEST_FILE)).unwrap();
        assert!(summary.contains("kappa 0.90, score:0.9"));
        let state = ExperimentState::load(&experiment_dir).unwrap().unwrap();
        assert!(state.trials.iter().all(|t| t.status.is_finished()));
        assert_eq!(state.next_trial_number, 3);
    }

    #[test]
    fn panicking_trial_fails_without_stopping_the_run() {
        let dir = TempDir::new().unwrap();
        let space = scores(&[0.5]).add_grid("mode", vec![json!("panic"), json!("ok")]);
        let analysis = runner(dir.path(), space, SchedulerConfig::Fifo { max_t: Some(2) }, 1, factory(None))
            .run()
            .unwrap();

        assert_eq!(analysis.status.state, RunState::Completed);
        assert_eq!(analysis.status.trials_failed, 1);
        assert_eq!(analysis.status.trials_completed, 1);
        let failed = analysis
            .trials
            .iter()
            .find(|t| t.status == TrialStatus::Failed)
            .unwrap();
        assert!(failed.error.as_deref().unwrap().contains("diverged"));
        assert!(failed.results.is_empty());
        assert_eq!(analysis.table.len(), 1);
    }

    #[test]
    fn report_without_metric_fails_the_trial() {
        let dir = TempDir::new().unwrap();
        let space = scores(&[0.5]).add_grid("mode", vec![json!("silent")]);
        let analysis = runner(dir.path(), space, SchedulerConfig::Fifo { max_t: Some(2) }, 1, factory(None))
            .run()
            .unwrap();

        let trial = &analysis.trials[0];
        assert_eq!(trial.status, TrialStatus::Failed);
        assert!(trial.error.as_deref().unwrap().contains("kappa"));
        assert!(analysis.best_config().is_none());
    }

    #[test]
    fn asha_stops_trials_below_the_rung_cutoff() {
        let dir = TempDir::new().unwrap();
        let scheduler = SchedulerConfig::Asha {
            max_t: 9,
            grace_period: 1,
            reduction_factor: 3.0,
            brackets: 1,
        };
        let analysis = runner(dir.path(), scores(&[0.9, 0.1]), scheduler, 1, factory(None))
            .run()
            .unwrap();

        let strong = &analysis.trials[0];
        assert_eq!(strong.status, TrialStatus::Completed);
        assert_eq!(strong.iteration(), 9);
        let weak = &analysis.trials[1];
        assert_eq!(weak.status, TrialStatus::Pruned);
        assert_eq!(weak.iteration(), 1);
        assert_eq!(analysis.status.trials_pruned, 1);
    }

    #[test]
    fn fifo_without_max_t_is_rejected() {
        let dir = TempDir::new().unwrap();
        let runner = runner(dir.path(), scores(&[0.5]), SchedulerConfig::Fifo { max_t: None }, 1, factory(None));
        let status = runner.status_handle();
        assert!(matches!(runner.run(), Err(TuneError::Validation(_))));
        assert_eq!(status.read().state, RunState::Failed);
    }

    #[test]
    fn stopped_run_resumes_from_the_latest_checkpoint() {
        let dir = TempDir::new().unwrap();
        let stop = StopHandle::default();
        let first = runner(
            dir.path(),
            scores(&[0.7]),
            SchedulerConfig::Fifo { max_t: Some(4) },
            1,
            factory(Some((stop.clone(), 2))),
        )
        .with_stop_handle(stop)
        .run()
        .unwrap();

        assert_eq!(first.status.state, RunState::Cancelled);
        let trial = &first.trials[0];
        assert_eq!(trial.status, TrialStatus::Pending);
        assert_eq!(trial.iteration(), 2);
        assert_eq!(trial.checkpoints.latest().map(|c| c.iteration), Some(2));

        let mut resumed = runner(
            dir.path(),
            scores(&[0.7]),
            SchedulerConfig::Fifo { max_t: Some(4) },
            1,
            factory(None),
        );
        resumed.config.resume = true;
        let second = resumed.run().unwrap();

        assert_eq!(second.status.state, RunState::Completed);
        assert_eq!(second.status.id, first.status.id);
        assert_eq!(second.trials.len(), 1);
        let trial = &second.trials[0];
        assert_eq!(trial.id, first.trials[0].id);
        assert_eq!(trial.status, TrialStatus::Completed);
        let iterations: Vec<u64> = trial.results.iter().map(|r| r.training_iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3, 4]);
    }

    fn stop_after_two_rounds(dir: &Path, space: SearchSpace) -> TuneAnalysis {
        let stop = StopHandle::default();
        runner(
            dir,
            space,
            SchedulerConfig::Fifo { max_t: Some(4) },
            1,
            factory(Some((stop.clone(), 2))),
        )
        .with_stop_handle(stop)
        .run()
        .unwrap()
    }

    fn resume(dir: &Path, space: SearchSpace) -> TuneAnalysis {
        let mut resumed = runner(dir, space, SchedulerConfig::Fifo { max_t: Some(4) }, 1, factory(None));
        resumed.config.resume = true;
        resumed.run().unwrap()
    }

    fn logged_rounds(trial_dir: &Path) -> Vec<u64> {
        fs::read_to_string(trial_dir.join(RESULT_FILE))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<ResultLine>(line).unwrap().report.training_iteration)
            .collect()
    }

    #[test]
    fn rounds_logged_after_the_checkpoint_are_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let first = stop_after_two_rounds(dir.path(), scores(&[0.7]));
        let experiment_dir = dir.path().join("scripted");
        let trial_dir = first.trials[0].dir(&experiment_dir);

        // A crash after logging round 3 but before its checkpoint.
        let mut lost = first.trials[0].last_result.clone().unwrap();
        lost.training_iteration = 3;
        let line = ResultLine {
            trial_id: first.trials[0].id,
            trial_number: 0,
            report: lost,
        };
        let mut log = fs::read_to_string(trial_dir.join(RESULT_FILE)).unwrap();
        log.push_str(&serde_json::to_string(&line).unwrap());
        log.push('\n');
        fs::write(trial_dir.join(RESULT_FILE), log).unwrap();

        let second = resume(dir.path(), scores(&[0.7]));
        assert_eq!(second.trials[0].status, TrialStatus::Completed);
        assert_eq!(logged_rounds(&trial_dir), vec![1, 2, 3, 4]);
        let progress = fs::read_to_string(trial_dir.join("progress.csv")).unwrap();
        assert_eq!(progress.lines().count(), 5);
    }

    #[test]
    fn unwritable_trial_dir_fails_only_that_trial() {
        let dir = TempDir::new().unwrap();
        let first = stop_after_two_rounds(dir.path(), scores(&[0.7, 0.2]));
        let experiment_dir = dir.path().join("scripted");
        let blocked = first.trials[0].dir(&experiment_dir);
        fs::remove_dir_all(&blocked).unwrap();
        fs::write(&blocked, "not a directory").unwrap();

        let second = resume(dir.path(), scores(&[0.7, 0.2]));
        assert_eq!(second.status.state, RunState::Completed);
        assert_eq!(second.trials.len(), 2);
        let failed = second.trials.iter().find(|t| t.id == first.trials[0].id).unwrap();
        assert_eq!(failed.status, TrialStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("cannot open trial logs"));
        let other = second.trials.iter().find(|t| t.id != first.trials[0].id).unwrap();
        assert_eq!(other.status, TrialStatus::Completed);
        assert_eq!(second.status.trials_failed, 1);
    }

    #[test]
    fn diverged_loss_survives_stop_and_resume() {
        let dir = TempDir::new().unwrap();
        let space = scores(&[0.6]).add_grid("mode", vec![json!("diverge")]);
        let first = stop_after_two_rounds(dir.path(), space.clone());
        assert_eq!(first.trials[0].iteration(), 2);
        assert!(first.trials[0].last_result.as_ref().unwrap().metric("loss").is_none());

        let experiment_dir = dir.path().join("scripted");
        let state = ExperimentState::load(&experiment_dir).unwrap().unwrap();
        assert_eq!(state.trials[0].results.len(), 2);

        let second = resume(dir.path(), space);
        assert_eq!(second.status.state, RunState::Completed);
        let trial = &second.trials[0];
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.iteration(), 4);
        assert_eq!(second.best_row().and_then(|r| r.metric("kappa")), Some(0.6));
    }
}
