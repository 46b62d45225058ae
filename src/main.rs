//! sampleflow CLI
//!
//! Runs the metagenomic screening pipeline described by a configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sampleflow::pipeline::ShellRunner;
use sampleflow::topology::ChannelKind;
use sampleflow::{build_runtime, plan, run_pipeline, Config, Options, StageRegistry, Topology};

#[derive(Parser)]
#[command(name = "sampleflow")]
#[command(about = "Multi-stage metagenomic screening pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of concurrently running stage processes
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Override the total CPU budget
    #[arg(long, global = true)]
    max_cpus: Option<usize>,

    /// Reuse outputs of previously completed instances
    #[arg(long, global = true)]
    resume: bool,

    /// Override the output directory
    #[arg(long, global = true)]
    outdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Discover samples and print the resolved stage graph
    Plan {
        /// Print Graphviz DOT instead of text
        #[arg(long)]
        dot: bool,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        None | Some(Commands::Run) => run_command(&cli),
        Some(Commands::Plan { dot }) => plan_command(&cli, *dot),
        Some(Commands::Validate) => validate_command(&cli),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Load options, apply CLI overrides and validate.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut options = Options::from_file(&cli.config)?;

    if let Some(workers) = cli.concurrency {
        options.resources.workers = workers;
    }
    if let Some(max_cpus) = cli.max_cpus {
        options.resources.max_cpus = max_cpus;
    }
    if cli.resume {
        options.output.resume = true;
    }
    if let Some(outdir) = &cli.outdir {
        options.output.outdir = outdir.clone();
    }

    Ok(Config::resolve(options)?)
}

fn run_command(cli: &Cli) -> Result<ExitCode> {
    let config = load_config(cli)?;

    let runtime = build_runtime(config.options().resources.worker_threads)?;
    let summary = runtime.block_on(run_pipeline(config, Arc::new(ShellRunner)))?;

    for report in &summary.instances {
        if !report.status.is_success() {
            eprintln!("{}/{}: {}", report.stage, report.sample, report.status);
        }
    }
    if summary.failed() > 0 {
        eprintln!("{} instance(s) failed", summary.failed());
    }

    Ok(ExitCode::from(summary.exit_code() as u8))
}

fn plan_command(cli: &Cli, dot: bool) -> Result<ExitCode> {
    let config = load_config(cli)?;
    let run_plan = plan(&config)?;

    if dot {
        print!("{}", run_plan.topology.to_dot());
        return Ok(ExitCode::SUCCESS);
    }

    let n = run_plan.samples.len();
    println!("\n=== Samples ({}) ===", n);
    for sample in &run_plan.samples {
        let files: Vec<_> = sample.files.iter().map(|f| f.display().to_string()).collect();
        println!("  {:<20} {}", sample.name, files.join(" "));
    }
    if let Some(control) = &run_plan.control {
        println!("  {:<20} (control)", control.name);
    }

    println!("\n=== Topology ===");
    print!("{}", run_plan.topology);

    println!("\n=== Collecting channels ===");
    for (role, edge) in run_plan.topology.edges() {
        if edge.kind == ChannelKind::Collecting && !edge.consumers.is_empty() {
            println!(
                "  {:<18} expects {} item(s) -> {}",
                role.as_str(),
                run_plan.topology.expected_count(*role, n),
                edge.consumers.join(", ")
            );
        }
    }

    println!("\nTotal instances: {}", run_plan.topology.instance_count(n));
    Ok(ExitCode::SUCCESS)
}

fn validate_command(cli: &Cli) -> Result<ExitCode> {
    let config = load_config(cli)?;
    Topology::build(&StageRegistry::standard(), &config)?;
    println!("Configuration is valid");
    Ok(ExitCode::SUCCESS)
}

fn generate_config_command(output: &Path) -> Result<ExitCode> {
    // Generate a commented YAML config
    let yaml = r#"# sampleflow configuration

# === INPUT: read files ===
input:
  # Glob with one {a,b} group selecting the mate; the text before the group
  # names the sample
  reads: "data/*_R{1,2}.fastq.gz"

  # Single-end reads (ancient mode only); use a pattern without a group
  single_end: false

  # Optional control (blank) sample, always paired
  # control: "control/blank_R{1,2}.fastq.gz"

  # Quality score base (33 or 64)
  phred: 33

# ancient | modern
mode: ancient

# kraken2 | centrifuge
aligner: kraken2

# === CLASSIFIER: tool parameters ===
classifier:
  kraken2:
    confidence: 0.0
    minimum_hit_groups: 2
  centrifuge:
    min_hitlen: 22
    max_assignments: 5
  # Minimum score in the taxonomy report
  # min_score: 10

# === TRIMMING ===
trimming:
  min_length: 30
  min_quality: 20

# === DATABASES: checked the first time a stage needs them ===
databases:
  human_index: "/db/bowtie2/hg38"
  kraken2_db: "/db/kraken2/standard"
  # centrifuge_db: "/db/centrifuge/p_compressed"

# === RESOURCES ===
resources:
  # Total CPU tokens shared by running stages (default: all cores)
  # max_cpus: 16

  # Concurrently running stage processes
  workers: 4

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Per-stage CPU overrides
  # cpus:
  #   align_human: 12

# === OUTPUT ===
output:
  outdir: "results"
  # Skip instances whose journaled outputs are still valid
  resume: false

# === METRICS ===
metrics:
  enable: true
  interval_secs: 30
  # output_path: "results/metrics.json"
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(ExitCode::SUCCESS)
}
