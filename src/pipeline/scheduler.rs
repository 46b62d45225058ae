//! Dependency-ordered, budget-bounded dispatch of stage instances.
//!
//! A single coordinator owns every instance's state and the channel router.
//! Ready instances are pushed onto a shared work queue consumed by a fixed
//! pool of workers; completions come back over an mpsc channel and are the
//! only events that can make further instances ready.
//!
//! ```text
//!             ┌──────────────┐  WorkItem   ┌──────────┐
//! Topology ──▶│ Coordinator  │────────────▶│ Worker×N │──▶ external process
//!             │ (router,     │◀────────────│          │
//!             │  CPU budget) │ Completion  └──────────┘
//!             └──────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::{Config, Database};
use crate::error::{PipelineError, StageFailure};
use crate::pipeline::budget::{CpuBudget, CpuReservation};
use crate::pipeline::executor::{check_database, execute, Execution, Job, StageRunner};
use crate::pipeline::journal::CompletionJournal;
use crate::pipeline::{Artifact, ChannelRouter, Metrics, MetricsReporter, SampleKey};
use crate::samples::Sample;
use crate::topology::{ChannelKind, ChannelRole, CommandContext, Scope, StageKind, Topology};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool (concurrently running processes)
    pub workers: usize,

    /// Total CPU tokens shared by running instances
    pub max_cpus: usize,

    /// Reuse journaled completions
    pub resume: bool,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            resume: false,
            enable_metrics: true,
            metrics_interval_secs: 30,
            metrics_output_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        let options = config.options();
        Self {
            workers: options.resources.workers,
            max_cpus: options.resources.max_cpus,
            resume: config.resume(),
            enable_metrics: options.metrics.enable,
            metrics_interval_secs: options.metrics.interval_secs,
            metrics_output_path: options.metrics.output_path.clone(),
        }
    }
}

/// Why an instance never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An instance this one depends on failed or was skipped
    BlockedByUpstreamFailure { stage: String, sample: String },
    /// The run stopped dispatching after a fatal error
    RunAborted,
    /// Inputs never became available
    NeverReady,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BlockedByUpstreamFailure { stage, sample } => {
                write!(f, "blocked by upstream failure of {stage}/{sample}")
            }
            SkipReason::RunAborted => write!(f, "run aborted"),
            SkipReason::NeverReady => write!(f, "inputs never became ready"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Running,
    Succeeded { cached: bool },
    Failed(StageFailure),
    Skipped(SkipReason),
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Pending | InstanceStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstanceStatus::Succeeded { .. })
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Succeeded { cached: false } => write!(f, "succeeded"),
            InstanceStatus::Succeeded { cached: true } => write!(f, "succeeded (cached)"),
            InstanceStatus::Failed(failure) => write!(f, "failed: {failure}"),
            InstanceStatus::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

/// Final state of one instance.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub stage: &'static str,
    pub sample: SampleKey,
    pub status: InstanceStatus,
    pub outputs: BTreeMap<ChannelRole, Vec<PathBuf>>,
}

/// Result of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Instances in dispatch order (topology order, then sample name)
    pub instances: Vec<InstanceReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&InstanceStatus) -> bool) -> usize {
        self.instances.iter().filter(|i| pred(&i.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(InstanceStatus::is_success)
    }

    pub fn cached(&self) -> usize {
        self.count(|s| matches!(s, InstanceStatus::Succeeded { cached: true }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, InstanceStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, InstanceStatus::Skipped(_)))
    }

    pub fn status(&self, stage: &str, sample: &SampleKey) -> Option<&InstanceStatus> {
        self.instances
            .iter()
            .find(|i| i.stage == stage && &i.sample == sample)
            .map(|i| &i.status)
    }

    pub fn instances_of<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a InstanceReport> + 'a {
        self.instances.iter().filter(move |i| i.stage == stage)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    /// 0 on full success, 2 when any instance failed or was skipped.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            2
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Succeeded: {} ({} cached), Failed: {}, Skipped: {}, Total: {}",
            self.succeeded(),
            self.cached(),
            self.failed(),
            self.skipped(),
            self.instances.len()
        )
    }
}

/// Rendered job kept between binding inputs and completion.
struct Prepared {
    job: Job,
    fingerprint: String,
}

struct Instance {
    /// Position in `Topology::stages()`
    stage: usize,
    sample: SampleKey,
    status: InstanceStatus,
    prepared: Option<Prepared>,
    outputs: BTreeMap<ChannelRole, Vec<PathBuf>>,
}

struct WorkItem {
    idx: usize,
    job: Job,
    reservation: CpuReservation,
}

struct Completion {
    idx: usize,
    execution: Execution,
}

/// Mutable state of one run, owned by the coordinator.
struct RunState {
    instances: Vec<Instance>,
    index: HashMap<(&'static str, SampleKey), usize>,
    router: ChannelRouter,
    budget: CpuBudget,
    running: usize,
    checked_dbs: BTreeSet<Database>,
    halted: Option<PipelineError>,
}

/// Runs a topology to completion.
pub struct Scheduler {
    config: Arc<Config>,
    topology: Arc<Topology>,
    runner: Arc<dyn StageRunner>,
    metrics: Arc<Metrics>,
    journal: CompletionJournal,
    settings: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        topology: Arc<Topology>,
        runner: Arc<dyn StageRunner>,
        metrics: Arc<Metrics>,
        settings: SchedulerConfig,
    ) -> Self {
        let journal = CompletionJournal::new(config.outdir());
        Self {
            config,
            topology,
            runner,
            metrics,
            journal,
            settings,
        }
    }

    /// Execute every instance of the topology for `samples`.
    ///
    /// Per-instance failures are reported in the summary. An `Err` means the
    /// run stopped early (a lazy database check failed or the channel
    /// protocol was violated); running instances are drained first.
    pub async fn run(
        &self,
        samples: &[Sample],
        control: Option<&Sample>,
    ) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        let mut state = self.init_state(samples);
        let total = state.instances.len();

        tracing::info!(
            "Scheduling {} instances across {} stages ({} workers, {} CPUs)",
            total,
            self.topology.stages().len(),
            self.settings.workers,
            state.budget.total()
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.settings.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.settings.metrics_interval_secs,
                total as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        // Shared work queue drained by a fixed pool of workers
        let (work_tx, work_rx) = async_channel::unbounded::<WorkItem>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        let mut handles = Vec::with_capacity(self.settings.workers);
        for _ in 0..self.settings.workers.max(1) {
            let runner = self.runner.clone();
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();

            handles.push(tokio::spawn(async move {
                while let Ok(item) = work_rx.recv().await {
                    let execution = execute(runner.as_ref(), &item.job).await;
                    drop(item.reservation);
                    if done_tx.send(Completion { idx: item.idx, execution }).is_err() {
                        tracing::debug!("Coordinator dropped, stopping worker");
                        break;
                    }
                }
            }));
        }
        drop(done_tx);

        if let Err(e) = self.materialize_sources(&mut state, samples, control) {
            state.halted = Some(e);
        }

        loop {
            if state.halted.is_none() {
                if let Err(e) = self.dispatch_ready(&mut state, &work_tx).await {
                    tracing::error!("Stopping dispatch: {}", e);
                    state.halted = Some(e);
                }
            }
            if state.running == 0 {
                break;
            }
            match done_rx.recv().await {
                Some(completion) => {
                    if let Err(e) = self.complete(&mut state, completion) {
                        tracing::error!("Stopping dispatch: {}", e);
                        state.halted.get_or_insert(e);
                    }
                }
                None => break,
            }
        }

        work_tx.close();
        futures::future::join_all(handles).await;

        let leftover = if state.halted.is_some() {
            SkipReason::RunAborted
        } else {
            SkipReason::NeverReady
        };
        for inst in state.instances.iter_mut() {
            if inst.status == InstanceStatus::Pending {
                inst.status = InstanceStatus::Skipped(leftover.clone());
                self.metrics.add_skipped();
            }
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.settings.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.settings.metrics_interval_secs,
                total as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.settings.metrics_output_path {
                if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path.display(), e);
                }
            }
        }

        if let Some(e) = state.halted {
            return Err(e);
        }

        let stages = self.topology.stages();
        let summary = RunSummary {
            instances: state
                .instances
                .into_iter()
                .map(|inst| InstanceReport {
                    stage: stages[inst.stage].id(),
                    sample: inst.sample,
                    status: inst.status,
                    outputs: inst.outputs,
                })
                .collect(),
            elapsed: start.elapsed(),
        };

        tracing::info!("Run complete: {}", summary);
        Ok(summary)
    }

    fn init_state(&self, samples: &[Sample]) -> RunState {
        let mut instances = Vec::new();
        let mut index = HashMap::new();

        for (pos, stage) in self.topology.stages().iter().enumerate() {
            let keys: Vec<SampleKey> = match stage.scope() {
                Scope::PerSample => samples.iter().map(|s| SampleKey::sample(&s.name)).collect(),
                Scope::Global => vec![SampleKey::Global],
            };
            for sample in keys {
                index.insert((stage.id(), sample.clone()), instances.len());
                instances.push(Instance {
                    stage: pos,
                    sample,
                    status: InstanceStatus::Pending,
                    prepared: None,
                    outputs: BTreeMap::new(),
                });
            }
        }

        RunState {
            instances,
            index,
            router: ChannelRouter::new(&self.topology, samples.len()),
            budget: CpuBudget::new(self.settings.max_cpus),
            running: 0,
            checked_dbs: BTreeSet::new(),
            halted: None,
        }
    }

    /// Publish discovered inputs through the source stages.
    fn materialize_sources(
        &self,
        state: &mut RunState,
        samples: &[Sample],
        control: Option<&Sample>,
    ) -> Result<(), PipelineError> {
        let files_by_name: HashMap<&str, &Vec<PathBuf>> =
            samples.iter().map(|s| (s.name.as_str(), &s.files)).collect();

        for idx in 0..state.instances.len() {
            let stage = &self.topology.stages()[state.instances[idx].stage];
            if stage.def.kind != StageKind::Source {
                continue;
            }
            let files = match &state.instances[idx].sample {
                SampleKey::Sample(name) => files_by_name.get(name.as_str()).map(|f| (*f).clone()),
                SampleKey::Global => control.map(|c| c.files.clone()),
            }
            .ok_or_else(|| {
                PipelineError::ConfigValidation(format!(
                    "no input files for source stage '{}'",
                    stage.id()
                ))
            })?;

            let outputs = stage.outputs.iter().map(|p| (p.role, files.clone())).collect();
            self.succeed(state, idx, outputs, false)?;
        }
        Ok(())
    }

    /// Dispatch every instance whose inputs are ready, until a pass makes no
    /// inline progress (cache hits and render failures change readiness).
    async fn dispatch_ready(
        &self,
        state: &mut RunState,
        work_tx: &async_channel::Sender<WorkItem>,
    ) -> Result<(), PipelineError> {
        loop {
            let mut progressed = false;

            for idx in 0..state.instances.len() {
                if state.instances[idx].status != InstanceStatus::Pending {
                    continue;
                }
                if state.instances[idx].prepared.is_none() {
                    match self.prepare(state, idx)? {
                        Some(prepared) => {
                            if self.settings.resume {
                                if let Some(outputs) =
                                    self.journal.lookup(&prepared.job, &prepared.fingerprint)
                                {
                                    tracing::info!(
                                        "[{}/{}] reusing journaled outputs",
                                        prepared.job.stage_id,
                                        prepared.job.sample
                                    );
                                    self.succeed(state, idx, outputs, true)?;
                                    progressed = true;
                                    continue;
                                }
                            }
                            state.instances[idx].prepared = Some(prepared);
                        }
                        None if state.instances[idx].status != InstanceStatus::Pending => {
                            progressed = true;
                            continue;
                        }
                        None => continue,
                    }
                }

                if state.running >= self.settings.workers {
                    continue;
                }
                let Some(cpus) = state.instances[idx].prepared.as_ref().map(|p| p.job.cpus) else {
                    continue;
                };
                let Some(reservation) = state.budget.try_reserve(cpus) else {
                    continue;
                };
                let Some(prepared) = state.instances[idx].prepared.as_ref() else {
                    continue;
                };

                let job = prepared.job.clone();
                tracing::debug!("Dispatching {}/{} ({} CPUs)", job.stage_id, job.sample, cpus);
                state.instances[idx].status = InstanceStatus::Running;
                state.running += 1;
                self.metrics.add_dispatched(cpus);

                if work_tx.send(WorkItem { idx, job, reservation }).await.is_err() {
                    state.running -= 1;
                    self.fail(state, idx, StageFailure::Launch("worker pool closed".into()));
                    progressed = true;
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Bind inputs and render the job of a Pending instance whose inputs are
    /// all ready. Returns `None` when inputs are not ready, or when the
    /// instance failed while rendering.
    fn prepare(&self, state: &mut RunState, idx: usize) -> Result<Option<Prepared>, PipelineError> {
        let stage = &self.topology.stages()[state.instances[idx].stage];
        let sample = state.instances[idx].sample.clone();

        let ready = stage
            .inputs
            .iter()
            .all(|role| state.router.is_ready(*role, stage.id(), &sample));
        if !ready {
            return Ok(None);
        }

        for db in &stage.def.databases {
            if !state.checked_dbs.contains(db) {
                check_database(&self.config, *db)?;
                state.checked_dbs.insert(*db);
            }
        }

        let mut inputs: BTreeMap<ChannelRole, Vec<PathBuf>> = BTreeMap::new();
        for role in &stage.inputs {
            let artifacts = state.router.read(*role, stage.id(), &sample)?;
            inputs
                .entry(*role)
                .or_default()
                .extend(artifacts.into_iter().flat_map(|a| a.files));
        }

        let Some(template) = stage.def.command else {
            self.fail(state, idx, StageFailure::Launch(format!("stage '{}' has no command", stage.id())));
            return Ok(None);
        };

        let cpus = state
            .budget
            .clamp(self.config.cpus_for(stage.id(), stage.def.cpus));
        let command = template(&CommandContext {
            config: &self.config,
            sample: &sample,
            inputs: &inputs,
            cpus,
        });
        let job = Job {
            stage_id: stage.id(),
            sample: sample.clone(),
            workdir: self.config.outdir().join(stage.id()),
            command,
            cpus,
            outputs: stage
                .outputs
                .iter()
                .map(|p| (p.role, p.glob_for(&sample)))
                .collect(),
        };

        let input_files: Vec<PathBuf> = inputs.into_values().flatten().collect();
        let fingerprint = CompletionJournal::fingerprint(&job, &input_files);
        Ok(Some(Prepared { job, fingerprint }))
    }

    fn complete(&self, state: &mut RunState, completion: Completion) -> Result<(), PipelineError> {
        let Completion { idx, execution } = completion;
        state.running -= 1;
        self.metrics.add_process_time(execution.elapsed);
        let prepared = state.instances[idx].prepared.take();

        match execution.result {
            Ok(outputs) => {
                if let Some(prepared) = prepared {
                    if let Err(e) = self.journal.record(&prepared.job, &prepared.fingerprint, &outputs) {
                        tracing::warn!(
                            "Failed to journal {}/{}: {}",
                            prepared.job.stage_id,
                            prepared.job.sample,
                            e
                        );
                    }
                }
                tracing::debug!(
                    "Completed {}/{} in {:.1}s",
                    self.topology.stages()[state.instances[idx].stage].id(),
                    state.instances[idx].sample,
                    execution.elapsed.as_secs_f64()
                );
                self.succeed(state, idx, outputs, false)
            }
            Err(failure) => {
                self.fail(state, idx, failure);
                Ok(())
            }
        }
    }

    fn succeed(
        &self,
        state: &mut RunState,
        idx: usize,
        outputs: BTreeMap<ChannelRole, Vec<PathBuf>>,
        cached: bool,
    ) -> Result<(), PipelineError> {
        let producer = self.topology.stages()[state.instances[idx].stage].id();
        let sample = state.instances[idx].sample.clone();

        for (role, files) in &outputs {
            state.router.publish(
                *role,
                Artifact {
                    producer,
                    sample: sample.clone(),
                    files: files.clone(),
                },
            )?;
        }

        let inst = &mut state.instances[idx];
        inst.status = InstanceStatus::Succeeded { cached };
        inst.outputs = outputs;
        if cached {
            self.metrics.add_cached();
        } else {
            self.metrics.add_succeeded();
        }
        Ok(())
    }

    fn fail(&self, state: &mut RunState, idx: usize, failure: StageFailure) {
        let stage = self.topology.stages()[state.instances[idx].stage].id();
        tracing::warn!("[{}/{}] failed: {}", stage, state.instances[idx].sample, failure);

        state.instances[idx].status = InstanceStatus::Failed(failure);
        state.instances[idx].prepared = None;
        self.metrics.add_failed();
        self.cancel_dependents(state, idx);
    }

    /// Skip every Pending instance that transitively consumes output of
    /// instance `origin`, and block the collecting channels it feeds.
    fn cancel_dependents(&self, state: &mut RunState, origin: usize) {
        let stages = self.topology.stages();
        let reason = SkipReason::BlockedByUpstreamFailure {
            stage: stages[state.instances[origin].stage].id().to_string(),
            sample: state.instances[origin].sample.to_string(),
        };

        let mut queue = vec![origin];
        while let Some(idx) = queue.pop() {
            let stage = &stages[state.instances[idx].stage];
            let sample = state.instances[idx].sample.clone();

            for port in &stage.outputs {
                let Some(edge) = self.topology.edge(port.role) else {
                    continue;
                };
                if edge.kind == ChannelKind::Collecting {
                    state.router.block(port.role);
                }

                for consumer in &edge.consumers {
                    let Some(consumer_stage) = self.topology.stage(consumer) else {
                        continue;
                    };
                    let targets: Vec<usize> = match (stage.scope(), consumer_stage.scope()) {
                        (_, Scope::Global) => state
                            .index
                            .get(&(*consumer, SampleKey::Global))
                            .copied()
                            .into_iter()
                            .collect(),
                        (Scope::PerSample, Scope::PerSample) => state
                            .index
                            .get(&(*consumer, sample.clone()))
                            .copied()
                            .into_iter()
                            .collect(),
                        (Scope::Global, Scope::PerSample) => state
                            .instances
                            .iter()
                            .enumerate()
                            .filter(|(_, inst)| stages[inst.stage].id() == *consumer)
                            .map(|(i, _)| i)
                            .collect(),
                    };

                    for target in targets {
                        if state.instances[target].status == InstanceStatus::Pending {
                            tracing::warn!(
                                "[{}/{}] skipped: {}",
                                consumer,
                                state.instances[target].sample,
                                reason
                            );
                            state.instances[target].status = InstanceStatus::Skipped(reason.clone());
                            self.metrics.add_skipped();
                            queue.push(target);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(stage: &'static str, sample: &str, status: InstanceStatus) -> InstanceReport {
        InstanceReport {
            stage,
            sample: SampleKey::sample(sample),
            status,
            outputs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.workers, 4);
        assert!(config.max_cpus > 0);
        assert!(!config.resume);
        assert!(config.enable_metrics);
        assert!(config.metrics_output_path.is_none());
    }

    #[test]
    fn test_run_summary_counts_and_exit_code() {
        let mut summary = RunSummary {
            instances: vec![
                report("trim", "s1", InstanceStatus::Succeeded { cached: false }),
                report("trim", "s2", InstanceStatus::Succeeded { cached: true }),
            ],
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.cached(), 1);
        assert_eq!(summary.exit_code(), 0);

        summary.instances.push(report(
            "kraken2",
            "s2",
            InstanceStatus::Failed(StageFailure::ExternalTool {
                exit_code: Some(1),
                stderr: String::new(),
            }),
        ));
        summary.instances.push(report(
            "kraken2_filter",
            "s2",
            InstanceStatus::Skipped(SkipReason::BlockedByUpstreamFailure {
                stage: "kraken2".into(),
                sample: "s2".into(),
            }),
        ));
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(summary.instances_of("trim").count(), 2);
        assert!(summary
            .status("kraken2", &SampleKey::sample("s2"))
            .is_some_and(|s| !s.is_success()));
    }

    #[test]
    fn test_run_summary_display() {
        let summary = RunSummary {
            instances: vec![report("trim", "s1", InstanceStatus::Succeeded { cached: false })],
            elapsed: Duration::ZERO,
        };
        let display = format!("{}", summary);
        assert!(display.contains("Succeeded: 1"));
        assert!(display.contains("Total: 1"));
    }

    #[test]
    fn test_status_display() {
        let skipped = InstanceStatus::Skipped(SkipReason::BlockedByUpstreamFailure {
            stage: "trim".into(),
            sample: "s1".into(),
        });
        assert_eq!(skipped.to_string(), "skipped: blocked by upstream failure of trim/s1");
        assert!(skipped.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
    }
}
