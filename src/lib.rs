//! sampleflow
//!
//! Declarative multi-stage pipeline engine for ancient and modern
//! metagenomic screening. Each stage runs once per sample (or once per run
//! for aggregators) as an external process; artifacts move between stages
//! through typed channels.
//!
//! # Architecture
//!
//! - **Config**: validated run options (mode, control, aligner, resources)
//! - **Samples**: glob discovery of single or paired read files
//! - **Topology**: predicate-driven stage registry resolved into an acyclic graph
//! - **Pipeline**: channel router, CPU-budgeted scheduler, process executor
//!
//! # Usage
//!
//! ```no_run
//! use sampleflow::{run_pipeline, Config, Options};
//! use sampleflow::pipeline::ShellRunner;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::resolve(Options::from_file("config.yaml".as_ref())?)?;
//!     let summary = run_pipeline(config, Arc::new(ShellRunner)).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod samples;
pub mod topology;

pub use config::{Aligner, Config, Database, Options, SampleMode};
pub use error::{ChannelError, DiscoveryError, PipelineError, StageFailure};
pub use pipeline::{Metrics, RunSummary, Scheduler, SchedulerConfig, StageRunner};
pub use samples::{discover, Sample};
pub use topology::{StageRegistry, Topology};

use std::sync::Arc;

/// Everything resolved before the first instance is dispatched.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub topology: Topology,
    pub samples: Vec<Sample>,
    pub control: Option<Sample>,
}

/// Discover inputs and build the topology for `config`.
pub fn plan(config: &Config) -> Result<RunPlan, PipelineError> {
    let options = config.options();

    let samples = discover(&options.input.reads, config.files_per_sample())?;
    tracing::info!("Discovered {} samples", samples.len());

    let control = match &options.input.control {
        Some(pattern) => {
            let mut found = discover(pattern, 2)?;
            if found.len() != 1 {
                return Err(PipelineError::ConfigValidation(format!(
                    "control pattern '{}' must match exactly one sample, found {}",
                    pattern,
                    found.len()
                )));
            }
            found.pop()
        }
        None => None,
    };

    let topology = Topology::build(&StageRegistry::standard(), config)?;
    tracing::info!(
        "Topology: {} stages, {} instances",
        topology.stages().len(),
        topology.instance_count(samples.len())
    );

    Ok(RunPlan {
        topology,
        samples,
        control,
    })
}

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(
    config: Config,
    runner: Arc<dyn StageRunner>,
) -> Result<RunSummary, PipelineError> {
    tracing::info!(
        "Starting sampleflow: mode={:?}, aligner={}, control={}",
        config.mode(),
        config.aligner(),
        config.has_control()
    );

    let RunPlan {
        topology,
        samples,
        control,
    } = plan(&config)?;

    std::fs::create_dir_all(config.outdir())?;

    let settings = SchedulerConfig::from_config(&config);
    let scheduler = Scheduler::new(
        Arc::new(config),
        Arc::new(topology),
        runner,
        Metrics::new(),
        settings,
    );

    scheduler.run(&samples, control.as_ref()).await
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
