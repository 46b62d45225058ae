//! End-to-end scheduler tests with a scripted stage runner.
//!
//! The runner never launches processes: it records each job, optionally
//! fails it, and otherwise creates one file per declared output glob.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::{Config, Options};
use crate::error::{PipelineError, StageFailure};
use crate::pipeline::{
    InstanceStatus, Job, Metrics, ProcessOutput, SampleKey, Scheduler, SchedulerConfig,
    ShellRunner, SkipReason, StageRunner,
};
use crate::samples::discover;
use crate::topology::{ChannelRole, CommandContext, Scope, StageDef, StageRegistry, Topology};
use crate::run_pipeline;

#[derive(Default)]
struct ScriptedRunner {
    /// (stage, sample) pairs that exit non-zero
    fail: HashSet<(String, String)>,
    /// (stage, sample) pairs that exit 0 without writing outputs
    no_outputs: HashSet<(String, String)>,
    delay: Duration,
    calls: Mutex<Vec<(String, String, String)>>,
    cpus_in_flight: AtomicUsize,
    peak_cpus: AtomicUsize,
    jobs_in_flight: AtomicUsize,
    peak_jobs: AtomicUsize,
}

impl ScriptedRunner {
    fn failing(stage: &str, sample: &str) -> Self {
        Self {
            fail: HashSet::from([(stage.to_string(), sample.to_string())]),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(stage, sample, _)| (stage.clone(), sample.clone()))
            .collect()
    }

    fn command_of(&self, stage: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _, _)| s == stage)
            .map(|(_, _, cmd)| cmd.clone())
    }

    fn ran(&self, stage: &str, sample: &str) -> bool {
        self.calls()
            .iter()
            .any(|(st, sa)| st == stage && sa == sample)
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run(&self, job: &Job) -> Result<ProcessOutput, StageFailure> {
        let key = (job.stage_id.to_string(), job.sample.as_str().to_string());
        self.calls
            .lock()
            .unwrap()
            .push((key.0.clone(), key.1.clone(), job.command.clone()));

        let now = self.cpus_in_flight.fetch_add(job.cpus, Ordering::SeqCst) + job.cpus;
        self.peak_cpus.fetch_max(now, Ordering::SeqCst);
        let jobs = self.jobs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_jobs.fetch_max(jobs, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.jobs_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.cpus_in_flight.fetch_sub(job.cpus, Ordering::SeqCst);

        if self.fail.contains(&key) {
            return Ok(ProcessOutput {
                exit_code: Some(1),
                stderr: "simulated failure".into(),
            });
        }
        if !self.no_outputs.contains(&key) {
            for (_, pattern) in &job.outputs {
                let path = job.workdir.join(pattern.replace("[12]", "1").replace('*', "1"));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(&path, job.command.as_bytes()).unwrap();
            }
        }
        Ok(ProcessOutput::success())
    }
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, "@r\nACGT\n+\nIIII\n").unwrap();
}

/// Lay out reads, databases and a config under `dir`.
fn setup(dir: &Path, samples: &[&str], mode: &str, aligner: &str, control: bool) -> Config {
    for sample in samples {
        for mate in [1, 2] {
            touch(&dir.join(format!("reads/{sample}_R{mate}.fastq.gz")));
        }
    }
    if control {
        for mate in [1, 2] {
            touch(&dir.join(format!("control/blank_R{mate}.fastq.gz")));
        }
    }
    touch(&dir.join("db/hg38.1.bt2"));
    touch(&dir.join("db/k2/hash.k2d"));
    touch(&dir.join("db/cf.1.cf"));

    let control_line = if control {
        format!("  control: \"{}/control/blank_R{{1,2}}.fastq.gz\"\n", dir.display())
    } else {
        String::new()
    };
    let yaml = format!(
        "input:\n  reads: \"{d}/reads/*_R{{1,2}}.fastq.gz\"\n{control_line}\
         mode: {mode}\naligner: {aligner}\n\
         databases:\n  human_index: {d}/db/hg38\n  kraken2_db: {d}/db/k2\n  centrifuge_db: {d}/db/cf\n\
         resources:\n  max_cpus: 16\n  workers: 4\n\
         output:\n  outdir: {d}/results\n\
         metrics:\n  enable: false\n",
        d = dir.display(),
    );
    Config::resolve(Options::from_yaml(&yaml).unwrap()).unwrap()
}

fn with_resume(config: &Config) -> Config {
    let mut options = config.options().clone();
    options.output.resume = true;
    Config::resolve(options).unwrap()
}

const ANCIENT_KRAKEN_STAGES: [&str; 6] = [
    "fastqc",
    "trim",
    "align_human",
    "damage_profile",
    "kraken2",
    "kraken2_filter",
];

#[tokio::test]
async fn test_ancient_kraken2_run_completes() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1", "s2"], "ancient", "kraken2", false);
    let runner = Arc::new(ScriptedRunner::default());

    let summary = run_pipeline(config, runner.clone()).await.unwrap();

    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.exit_code(), 0);
    for stage in ANCIENT_KRAKEN_STAGES {
        assert_eq!(summary.instances_of(stage).count(), 2, "{stage}");
    }
    assert_eq!(summary.instances_of("multiqc").count(), 1);
    assert_eq!(summary.instances_of("taxonomy_report").count(), 1);
    for absent in ["control_reads", "index_control", "align_control", "centrifuge"] {
        assert_eq!(summary.instances_of(absent).count(), 0, "{absent}");
    }

    // 12 per-sample processes plus 2 aggregators, each dispatched once
    assert_eq!(runner.calls().len(), 14);

    let report = runner.command_of("taxonomy_report").unwrap();
    let s1 = report.find("s1.kraken2.krk").unwrap();
    let s2 = report.find("s2.kraken2.krk").unwrap();
    assert!(s1 < s2, "collected inputs are ordered by sample: {report}");
    assert!(dir.path().join("results/taxonomy_report/taxonomy.rcf.html").exists());
    assert!(dir.path().join("results/multiqc/multiqc_report.html").exists());
}

#[tokio::test]
async fn test_aggregator_runs_after_all_producers() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["a", "b", "c"], "ancient", "kraken2", false);
    let runner = Arc::new(ScriptedRunner {
        delay: Duration::from_millis(5),
        ..Default::default()
    });

    run_pipeline(config, runner.clone()).await.unwrap();

    let calls = runner.calls();
    let position = |stage: &str, sample: &str| {
        calls
            .iter()
            .position(|(st, sa)| st == stage && sa == sample)
            .unwrap()
    };
    let multiqc = position("multiqc", "*global*");
    for sample in ["a", "b", "c"] {
        for producer in ["fastqc", "trim", "align_human", "damage_profile"] {
            assert!(position(producer, sample) < multiqc, "{producer}/{sample}");
        }
    }
}

#[tokio::test]
async fn test_failure_is_isolated_to_sample() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1", "s2"], "ancient", "kraken2", false);
    let runner = Arc::new(ScriptedRunner::failing("kraken2", "s2"));

    let summary = run_pipeline(config, runner.clone()).await.unwrap();

    let s1 = SampleKey::sample("s1");
    let s2 = SampleKey::sample("s2");
    assert!(matches!(
        summary.status("kraken2", &s2),
        Some(InstanceStatus::Failed(StageFailure::ExternalTool { exit_code: Some(1), .. }))
    ));
    let blocked = InstanceStatus::Skipped(SkipReason::BlockedByUpstreamFailure {
        stage: "kraken2".into(),
        sample: "s2".into(),
    });
    assert_eq!(summary.status("kraken2_filter", &s2), Some(&blocked));
    assert_eq!(summary.status("taxonomy_report", &SampleKey::Global), Some(&blocked));

    // The sibling sample and the unrelated aggregator are unaffected.
    assert_eq!(
        summary.status("kraken2_filter", &s1),
        Some(&InstanceStatus::Succeeded { cached: false })
    );
    assert!(summary
        .status("multiqc", &SampleKey::Global)
        .is_some_and(InstanceStatus::is_success));

    assert!(!runner.ran("kraken2_filter", "s2"));
    assert!(!runner.ran("taxonomy_report", "*global*"));
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.skipped(), 2);
    assert_eq!(summary.exit_code(), 2);
}

#[tokio::test]
async fn test_missing_output_counts_as_failure() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1", "s2"], "modern", "kraken2", false);
    let runner = Arc::new(ScriptedRunner {
        no_outputs: HashSet::from([("trim".to_string(), "s1".to_string())]),
        ..Default::default()
    });

    let summary = run_pipeline(config, runner.clone()).await.unwrap();

    let s1 = SampleKey::sample("s1");
    assert!(matches!(
        summary.status("trim", &s1),
        Some(InstanceStatus::Failed(StageFailure::MissingDeclaredOutput { .. }))
    ));
    assert!(matches!(
        summary.status("align_human", &s1),
        Some(InstanceStatus::Skipped(_))
    ));
    // multiqc collects TrimReport, so it can never release
    assert!(matches!(
        summary.status("multiqc", &SampleKey::Global),
        Some(InstanceStatus::Skipped(_))
    ));
    assert!(summary
        .status("kraken2_filter", &SampleKey::sample("s2"))
        .is_some_and(InstanceStatus::is_success));
}

#[tokio::test]
async fn test_resume_dispatches_nothing() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1", "s2"], "ancient", "kraken2", false);
    let resumed = with_resume(&config);
    let first = Arc::new(ScriptedRunner::default());
    let summary = run_pipeline(config, first.clone()).await.unwrap();
    assert!(summary.is_success());
    let processes = first.calls().len();

    let second = Arc::new(ScriptedRunner::default());
    let summary = run_pipeline(resumed, second.clone()).await.unwrap();

    assert!(second.calls().is_empty());
    assert!(summary.is_success());
    assert_eq!(summary.cached(), processes);
}

#[tokio::test]
async fn test_resume_reruns_after_failure() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1", "s2"], "ancient", "kraken2", false);
    let resumed = with_resume(&config);
    let first = Arc::new(ScriptedRunner::failing("kraken2", "s2"));
    assert_eq!(run_pipeline(config, first).await.unwrap().exit_code(), 2);

    let second = Arc::new(ScriptedRunner::default());
    let summary = run_pipeline(resumed, second.clone()).await.unwrap();

    assert!(summary.is_success());
    let mut calls = second.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            ("kraken2".to_string(), "s2".to_string()),
            ("kraken2_filter".to_string(), "s2".to_string()),
            ("taxonomy_report".to_string(), "*global*".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_modern_control_centrifuge_topology() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1", "s2", "s3"], "modern", "centrifuge", true);
    let runner = Arc::new(ScriptedRunner::default());

    let summary = run_pipeline(config, runner.clone()).await.unwrap();

    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.instances_of("index_control").count(), 1);
    assert_eq!(summary.instances_of("align_control").count(), 3);
    assert_eq!(summary.instances_of("centrifuge_filter").count(), 3);
    assert_eq!(summary.instances_of("damage_profile").count(), 0);
    assert_eq!(summary.instances_of("kraken2").count(), 0);

    // AlignmentMetrics collects from align_human and align_control: 2 x 3
    let multiqc = runner.command_of("multiqc").unwrap();
    assert_eq!(multiqc.matches(".flagstat").count(), 6);

    let calls = runner.calls();
    let index = calls.iter().position(|(st, _)| st == "index_control").unwrap();
    for (i, (stage, _)) in calls.iter().enumerate() {
        if stage == "align_control" {
            assert!(index < i);
        }
    }
}

#[tokio::test]
async fn test_cpu_budget_is_never_exceeded() {
    let dir = TempDir::new().unwrap();
    let config = setup(
        dir.path(),
        &["s1", "s2", "s3", "s4"],
        "ancient",
        "kraken2",
        false,
    );
    let mut options = config.options().clone();
    options.resources.max_cpus = 6;
    options.resources.workers = 8;
    let config = Config::resolve(options).unwrap();

    let runner = Arc::new(ScriptedRunner {
        delay: Duration::from_millis(5),
        ..Default::default()
    });
    let summary = run_pipeline(config, runner.clone()).await.unwrap();

    assert!(summary.is_success());
    let peak = runner.peak_cpus.load(Ordering::SeqCst);
    assert!(peak <= 6, "peak CPU tokens {peak}");
    assert!(peak > 0);
}

#[tokio::test]
async fn test_worker_pool_bounds_running_jobs() {
    let dir = TempDir::new().unwrap();
    let config = setup(
        dir.path(),
        &["s1", "s2", "s3", "s4", "s5"],
        "ancient",
        "kraken2",
        false,
    );
    let mut options = config.options().clone();
    options.resources.max_cpus = 64;
    options.resources.workers = 2;
    let config = Config::resolve(options).unwrap();

    let runner = Arc::new(ScriptedRunner {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let summary = run_pipeline(config, runner.clone()).await.unwrap();

    assert!(summary.is_success());
    // Ten fastqc/trim instances are ready at once; only two may run.
    assert_eq!(runner.peak_jobs.load(Ordering::SeqCst), 2);
}

fn copy_reads(ctx: &CommandContext<'_>) -> String {
    format!("cat {} > {}.txt", ctx.files(ChannelRole::RawReads), ctx.name())
}

#[tokio::test]
async fn test_shell_runner_with_relative_paths() {
    let dir = TempDir::new_in(".").unwrap();
    let rel = dir.path().strip_prefix(".").unwrap_or(dir.path()).to_path_buf();
    std::fs::create_dir_all(rel.join("data")).unwrap();
    for mate in [1, 2] {
        std::fs::write(rel.join(format!("data/s1_R{mate}.fq")), format!("mate{mate}\n")).unwrap();
    }
    let yaml = format!(
        "input:\n  reads: \"{d}/data/*_R{{1,2}}.fq\"\n\
         databases:\n  human_index: {d}/db/hg38\n  kraken2_db: {d}/db/k2\n\
         output:\n  outdir: {d}/results\nmetrics:\n  enable: false\n",
        d = rel.display(),
    );
    let config = Config::resolve(Options::from_yaml(&yaml).unwrap()).unwrap();
    assert!(config.outdir().is_absolute());

    let mut registry = StageRegistry::new();
    registry
        .register(StageDef::source("reads", Scope::PerSample, ChannelRole::RawReads))
        .register(
            StageDef::process("copy", Scope::PerSample)
                .input(ChannelRole::RawReads)
                .output(ChannelRole::TrimmedReads, "{sample}.txt")
                .command(copy_reads),
        );
    let topology = Topology::build(&registry, &config).unwrap();
    let samples = discover(&config.options().input.reads, 2).unwrap();

    let outdir = config.outdir().to_path_buf();
    let settings = SchedulerConfig::from_config(&config);
    let scheduler = Scheduler::new(
        Arc::new(config),
        Arc::new(topology),
        Arc::new(ShellRunner),
        Metrics::new(),
        settings,
    );
    let summary = scheduler.run(&samples, None).await.unwrap();

    assert!(summary.is_success(), "{summary}");
    let copied = std::fs::read_to_string(outdir.join("copy/s1.txt")).unwrap();
    assert_eq!(copied, "mate1\nmate2\n");
}

#[tokio::test]
async fn test_missing_database_aborts_run() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1"], "ancient", "kraken2", false);
    std::fs::remove_dir_all(dir.path().join("db/k2")).unwrap();
    let runner = Arc::new(ScriptedRunner::default());

    let err = run_pipeline(config, runner.clone()).await.unwrap_err();

    match err {
        PipelineError::ConfigValidation(msg) => assert!(msg.contains("databases.kraken2_db"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!runner.ran("kraken2", "s1"));
    assert!(runner.ran("trim", "s1"));
}

#[tokio::test]
async fn test_single_end_ancient_run() {
    let dir = TempDir::new().unwrap();
    touch(&dir.path().join("reads/x.fastq.gz"));
    touch(&dir.path().join("reads/y.fastq.gz"));
    setup(dir.path(), &[], "ancient", "kraken2", false);
    let yaml = format!(
        "input:\n  reads: \"{d}/reads/*.fastq.gz\"\n  single_end: true\n\
         databases:\n  human_index: {d}/db/hg38\n  kraken2_db: {d}/db/k2\n\
         output:\n  outdir: {d}/results\nmetrics:\n  enable: false\n",
        d = dir.path().display(),
    );
    let config = Config::resolve(Options::from_yaml(&yaml).unwrap()).unwrap();
    let runner = Arc::new(ScriptedRunner::default());

    let summary = run_pipeline(config, runner).await.unwrap();

    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.instances_of("trim").count(), 2);
    let reads = &summary
        .instances
        .iter()
        .find(|i| i.stage == "reads" && i.sample == SampleKey::sample("x"))
        .unwrap()
        .outputs;
    assert_eq!(reads.values().next().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_group_fails_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), &["s1"], "ancient", "kraken2", false);
    touch(&dir.path().join("reads/lonely_R1.fastq.gz"));
    let runner = Arc::new(ScriptedRunner::default());

    let err = run_pipeline(config, runner.clone()).await.unwrap_err();

    assert!(err.is_pre_dispatch());
    assert!(runner.calls().is_empty());
}
