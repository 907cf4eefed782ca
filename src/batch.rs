//! Batch execution of simulations on a fixed pool of worker threads.

use crate::config::{ModelConfig, SimulationParameters};
use crate::detector::StopEvent;
use crate::foodweb::{FoodWeb, NodeId};
use crate::model::AtnEquations;
use crate::simulation::Simulation;
use anyhow::{Context, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use glob::glob;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch was interrupted")]
    Interrupted,

    #[error("batch i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(io::Error),
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub parameters: SimulationParameters,
    pub model: ModelConfig,
    /// Factor applied to every biomass in the node configs.
    pub biomass_scale: f64,
    pub threads: usize,
    pub output_dir: PathBuf,
    /// How long to wait for all tasks before cancelling the rest.
    pub drain_timeout: Duration,
    /// How long cancelled workers get to wind down.
    pub grace_period: Duration,
}

impl BatchSettings {
    pub fn new<P: AsRef<Path>>(parameters: SimulationParameters, output_dir: P) -> Self {
        Self {
            parameters,
            model: ModelConfig::default(),
            biomass_scale: 1000.0,
            threads: 4,
            output_dir: output_dir.as_ref().to_path_buf(),
            drain_timeout: Duration::from_secs(1000 * 24 * 60 * 60),
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Summary of a task that wrote its results.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub file: PathBuf,
    pub stop_event: StopEvent,
    pub timesteps_simulated: usize,
}

#[derive(Debug)]
pub struct TaskReport {
    /// Position of the record in the node-config stream.
    pub id: usize,
    pub outcome: anyhow::Result<TaskSummary>,
}

/// Name of the results file of task `id`.
pub fn result_file_name(id: usize) -> String {
    format!("simulation-{id:04}.msgpack")
}

/// Parse one node-config record, `{"<node id>": biomass, ...}`, scaling
/// every biomass by `scale`.
pub fn parse_node_config(record: &str, scale: f64) -> anyhow::Result<BTreeMap<NodeId, f64>> {
    let raw: BTreeMap<u32, f64> =
        serde_json::from_str(record).context("failed to deserialize node config")?;
    if raw.is_empty() {
        bail!("node config has no nodes");
    }

    let mut biomass = BTreeMap::new();
    for (id, value) in raw {
        if !value.is_finite() || value < 0.0 {
            bail!("biomass of node {id} must be finite and non-negative, but is {value}");
        }
        biomass.insert(NodeId(id), value * scale);
    }
    Ok(biomass)
}

/// Stops a running batch from another thread.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    interrupted: Arc<AtomicBool>,
}

impl BatchHandle {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

struct Task {
    id: usize,
    record: String,
}

/// Runs one simulation per node-config record over a shared food web.
pub struct BatchDispatcher {
    web: Arc<FoodWeb>,
    settings: Arc<BatchSettings>,
    interrupted: Arc<AtomicBool>,
}

impl BatchDispatcher {
    pub fn new(web: Arc<FoodWeb>, settings: BatchSettings) -> Self {
        Self {
            web,
            settings: Arc::new(settings),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> BatchHandle {
        BatchHandle {
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    /// Run every non-blank line of `records` as a task.
    ///
    /// Returns one report per task in submission order. Failing tasks
    /// are reported, not propagated.
    pub fn run<R: BufRead>(&self, records: R) -> Result<Vec<TaskReport>, BatchError> {
        let mut tasks = Vec::new();
        for line in records.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            tasks.push(Task {
                id: tasks.len(),
                record: line,
            });
        }
        let n_tasks = tasks.len();

        let output_dir = &self.settings.output_dir;
        fs::create_dir_all(output_dir)?;
        match count_result_files(output_dir) {
            Ok(0) => {}
            Ok(count) => {
                log::warn!("{count} existing result files in {output_dir:?} may be overwritten")
            }
            Err(error) => log::warn!("{error:#}"),
        }
        log::info!(
            "running {n_tasks} simulations on {} threads",
            self.settings.threads
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<Task>();
        let (report_tx, report_rx) = crossbeam_channel::unbounded::<TaskReport>();

        let mut workers = Vec::with_capacity(self.settings.threads);
        for index in 0..self.settings.threads.max(1) {
            let spawned = self.spawn_worker(index, task_rx.clone(), report_tx.clone(), &cancel);
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    cancel.store(true, Ordering::SeqCst);
                    return Err(BatchError::WorkerSpawn(error));
                }
            }
        }
        drop(task_rx);
        drop(report_tx);

        for task in tasks {
            // Receivers only go away when every worker has died.
            if task_tx.send(task).is_err() {
                break;
            }
        }
        drop(task_tx);

        let mut reports = Vec::with_capacity(n_tasks);
        let started = Instant::now();
        let mut interrupted = false;
        while reports.len() < n_tasks {
            if self.interrupted.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            if started.elapsed() >= self.settings.drain_timeout {
                log::warn!(
                    "batch did not finish in {:?}, cancelling",
                    self.settings.drain_timeout
                );
                break;
            }
            match report_rx.recv_timeout(POLL_INTERVAL) {
                Ok(report) => {
                    log_report(&report, n_tasks);
                    reports.push(report);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Cancelled tasks and the workers share one grace period.
        let grace_deadline = Instant::now() + self.settings.grace_period;
        if reports.len() < n_tasks {
            cancel.store(true, Ordering::SeqCst);
            while reports.len() < n_tasks && Instant::now() < grace_deadline {
                match report_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(report) => {
                        log_report(&report, n_tasks);
                        reports.push(report);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        while workers.iter().any(|w| !w.is_finished()) && Instant::now() < grace_deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if workers.iter().any(|w| !w.is_finished()) {
            log::warn!("pool did not terminate");
        } else {
            for worker in workers {
                if worker.join().is_err() {
                    log::error!("worker thread panicked");
                }
            }
        }

        if interrupted {
            return Err(BatchError::Interrupted);
        }

        reports.sort_by_key(|report| report.id);
        Ok(reports)
    }

    fn spawn_worker(
        &self,
        index: usize,
        tasks: Receiver<Task>,
        reports: Sender<TaskReport>,
        cancel: &Arc<AtomicBool>,
    ) -> io::Result<thread::JoinHandle<()>> {
        let web = Arc::clone(&self.web);
        let settings = Arc::clone(&self.settings);
        let cancel = Arc::clone(cancel);
        thread::Builder::new()
            .name(format!("atnsim-worker-{index}"))
            .spawn(move || {
                for task in tasks.iter() {
                    let outcome = if cancel.load(Ordering::SeqCst) {
                        Err(anyhow::anyhow!("skipped after cancellation"))
                    } else {
                        run_task(&web, &settings, &cancel, &task)
                    };
                    let report = TaskReport {
                        id: task.id,
                        outcome,
                    };
                    if reports.send(report).is_err() {
                        break;
                    }
                }
            })
    }
}

fn run_task(
    web: &FoodWeb,
    settings: &BatchSettings,
    cancel: &Arc<AtomicBool>,
    task: &Task,
) -> anyhow::Result<TaskSummary> {
    let biomass = parse_node_config(&task.record, settings.biomass_scale)
        .with_context(|| format!("invalid node config record {}", task.id))?;

    let ids: BTreeSet<NodeId> = biomass.keys().copied().collect();
    let web = web.subweb(&ids).context("failed to select food web nodes")?;
    let equations = AtnEquations::new(&web, &settings.model.model);

    // `subweb` keeps exactly the record's nodes, in ascending id order.
    let initial_biomass: Vec<f64> = biomass.values().copied().collect();

    let simulation = Simulation::new(settings.parameters, equations, initial_biomass)
        .context("failed to construct simulation")?
        .with_settings(
            settings.model.integrator.clone(),
            settings.model.detectors.clone(),
        )
        .with_cancel_flag(Arc::clone(cancel));

    let results = simulation
        .run()
        .with_context(|| format!("simulation {} failed", task.id))?;

    let file = settings.output_dir.join(result_file_name(task.id));
    results
        .save(&file)
        .with_context(|| format!("failed to save {file:?}"))?;

    Ok(TaskSummary {
        file,
        stop_event: results.stop_event,
        timesteps_simulated: results.timesteps_simulated,
    })
}

fn log_report(report: &TaskReport, n_tasks: usize) {
    match &report.outcome {
        Ok(summary) => log::info!(
            "simulation {} of {n_tasks}: {:?} after {} timesteps",
            report.id,
            summary.stop_event,
            summary.timesteps_simulated
        ),
        Err(error) => log::error!("simulation {} of {n_tasks}: {error:#}", report.id),
    }
}

fn count_result_files(dir: &Path) -> anyhow::Result<usize> {
    let pattern = dir.join("simulation-*.msgpack");
    let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
    let count = glob(pattern)
        .context("failed to glob result files")?
        .filter_map(Result::ok)
        .count();
    Ok(count)
}
