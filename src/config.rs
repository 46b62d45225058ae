//! Configuration for the sample pipeline.
//!
//! [`Options`] is the raw, deserialized form of a run configuration. It is
//! turned into a [`Config`] by [`Config::resolve`], which performs all
//! cross-option validation. A resolved `Config` is never mutated and is
//! shared by reference (`Arc<Config>`) with the topology builder and the
//! scheduler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Sample preparation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMode {
    #[default]
    Ancient,
    Modern,
}

/// Downstream taxonomic aligner. Exactly one branch is active per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aligner {
    #[default]
    Kraken2,
    Centrifuge,
}

impl Aligner {
    /// Database the aligner's branch reads from.
    pub fn database(self) -> Database {
        match self {
            Aligner::Kraken2 => Database::Kraken2Db,
            Aligner::Centrifuge => Database::CentrifugeDb,
        }
    }
}

impl fmt::Display for Aligner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aligner::Kraken2 => write!(f, "kraken2"),
            Aligner::Centrifuge => write!(f, "centrifuge"),
        }
    }
}

/// Reference databases and indexes referenced by stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Database {
    HumanIndex,
    Kraken2Db,
    CentrifugeDb,
}

impl Database {
    /// Option key used in configuration files and error messages.
    pub fn option_name(self) -> &'static str {
        match self {
            Database::HumanIndex => "databases.human_index",
            Database::Kraken2Db => "databases.kraken2_db",
            Database::CentrifugeDb => "databases.centrifuge_db",
        }
    }
}

/// Raw run options as read from a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Input read patterns
    pub input: InputConfig,

    /// Ancient or modern sample preparation
    #[serde(default)]
    pub mode: SampleMode,

    /// Downstream aligner branch
    #[serde(default)]
    pub aligner: Aligner,

    /// Per-branch classifier tuning
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Adapter trimming parameters
    #[serde(default)]
    pub trimming: TrimmingConfig,

    /// Reference database and index paths
    #[serde(default)]
    pub databases: DatabaseConfig,

    /// CPU budget, worker pool size and per-stage CPU requests
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Output location and resume behaviour
    #[serde(default)]
    pub output: OutputConfig,

    /// Progress reporting
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Input read configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Glob pattern for sample reads, e.g. `data/*_R{1,2}.fastq.gz`
    pub reads: String,

    /// Single-read layout (one file per sample). Ancient mode only.
    #[serde(default)]
    pub single_end: bool,

    /// Optional glob pattern for the paired control sample
    #[serde(default)]
    pub control: Option<String>,

    /// Quality encoding base (33 or 64)
    #[serde(default = "default_phred")]
    pub phred: u8,
}

/// Classifier tuning parameters, one block per aligner branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub kraken2: Kraken2Params,

    #[serde(default)]
    pub centrifuge: CentrifugeParams,

    /// Minimum score for a read to count in the taxonomy report
    #[serde(default)]
    pub min_score: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kraken2Params {
    /// Confidence score threshold (0.0-1.0)
    #[serde(default)]
    pub confidence: f64,

    /// Minimum number of hit groups needed to make a call
    #[serde(default = "default_minimum_hit_groups")]
    pub minimum_hit_groups: u32,
}

impl Default for Kraken2Params {
    fn default() -> Self {
        Self {
            confidence: 0.0,
            minimum_hit_groups: default_minimum_hit_groups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentrifugeParams {
    /// Minimum length of partial hits
    #[serde(default = "default_min_hitlen")]
    pub min_hitlen: u32,

    /// Maximum number of distinct assignments per read
    #[serde(default = "default_max_assignments")]
    pub max_assignments: u32,
}

impl Default for CentrifugeParams {
    fn default() -> Self {
        Self {
            min_hitlen: default_min_hitlen(),
            max_assignments: default_max_assignments(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimmingConfig {
    /// Discard reads shorter than this after trimming
    #[serde(default = "default_min_length")]
    pub min_length: u32,

    /// Trim bases below this quality
    #[serde(default = "default_min_quality")]
    pub min_quality: u32,
}

impl Default for TrimmingConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            min_quality: default_min_quality(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Bowtie2 index prefix of the human reference
    #[serde(default)]
    pub human_index: Option<PathBuf>,

    /// Kraken2 database directory
    #[serde(default)]
    pub kraken2_db: Option<PathBuf>,

    /// Centrifuge index prefix
    #[serde(default)]
    pub centrifuge_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Total CPU tokens shared by all running stage instances
    #[serde(default = "default_max_cpus")]
    pub max_cpus: usize,

    /// Number of worker slots (concurrently running external processes)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-stage CPU request overrides, keyed by stage id
    #[serde(default)]
    pub cpus: BTreeMap<String, usize>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpus: default_max_cpus(),
            workers: default_workers(),
            cpus: BTreeMap::new(),
            worker_threads: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory for per-stage outputs
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,

    /// Skip instances whose journaled outputs are still valid
    #[serde(default)]
    pub resume: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            outdir: default_outdir(),
            resume: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Log progress periodically
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,

    /// Optional path to save a metrics JSON snapshot after the run
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval_secs: default_metrics_interval(),
            output_path: None,
        }
    }
}

impl Options {
    /// Load options from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let options: Options = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(options)
    }

    /// Load options from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load options from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize options to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    options: Options,
}

impl Config {
    /// Validate raw options into a run configuration.
    ///
    /// Database paths are only checked for presence here. Whether they exist
    /// on disk is checked when the first stage that needs them is dispatched,
    /// so unused branches never touch the filesystem.
    ///
    /// The output directory and database paths are made absolute, since
    /// stage commands run inside per-stage working directories.
    pub fn resolve(mut options: Options) -> Result<Self, PipelineError> {
        let invalid = |msg: String| Err(PipelineError::ConfigValidation(msg));

        if options.input.reads.trim().is_empty() {
            return invalid("input.reads must not be empty".into());
        }
        if options.input.single_end && options.mode != SampleMode::Ancient {
            return invalid("input.single_end is only supported in ancient mode".into());
        }
        if let Some(control) = &options.input.control {
            if control.trim().is_empty() {
                return invalid("input.control must not be empty when set".into());
            }
        }
        if options.input.phred != 33 && options.input.phred != 64 {
            return invalid(format!(
                "input.phred must be 33 or 64, got {}",
                options.input.phred
            ));
        }

        options.output.outdir = absolute("output.outdir", &options.output.outdir)?;
        let dbs = &mut options.databases;
        for (name, path) in [
            (Database::HumanIndex, &mut dbs.human_index),
            (Database::Kraken2Db, &mut dbs.kraken2_db),
            (Database::CentrifugeDb, &mut dbs.centrifuge_db),
        ] {
            if let Some(path) = path {
                *path = absolute(name.option_name(), path)?;
            }
        }

        let config = Self { options };
        for db in [Database::HumanIndex, config.aligner().database()] {
            if config.database(db).is_none() {
                return invalid(format!(
                    "{} must be set (required by aligner '{}')",
                    db.option_name(),
                    config.aligner()
                ));
            }
        }

        let kraken = &config.options.classifier.kraken2;
        if !(0.0..=1.0).contains(&kraken.confidence) {
            return invalid("classifier.kraken2.confidence must be within 0.0-1.0".into());
        }
        if config.options.resources.max_cpus == 0 {
            return invalid("resources.max_cpus must be > 0".into());
        }
        if config.options.resources.workers == 0 {
            return invalid("resources.workers must be > 0".into());
        }
        if config.options.resources.worker_threads == Some(0) {
            return invalid("resources.worker_threads must be > 0".into());
        }
        if let Some((stage, _)) = config.options.resources.cpus.iter().find(|(_, n)| **n == 0) {
            return invalid(format!("resources.cpus.{stage} must be > 0"));
        }

        Ok(config)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn mode(&self) -> SampleMode {
        self.options.mode
    }

    pub fn is_ancient(&self) -> bool {
        self.options.mode == SampleMode::Ancient
    }

    pub fn aligner(&self) -> Aligner {
        self.options.aligner
    }

    pub fn has_control(&self) -> bool {
        self.options.input.control.is_some()
    }

    pub fn single_end(&self) -> bool {
        self.options.input.single_end
    }

    /// Number of files each sample group must contain.
    pub fn files_per_sample(&self) -> usize {
        if self.single_end() {
            1
        } else {
            2
        }
    }

    pub fn phred(&self) -> u8 {
        self.options.input.phred
    }

    pub fn outdir(&self) -> &Path {
        &self.options.output.outdir
    }

    pub fn resume(&self) -> bool {
        self.options.output.resume
    }

    pub fn database(&self, db: Database) -> Option<&Path> {
        let dbs = &self.options.databases;
        match db {
            Database::HumanIndex => dbs.human_index.as_deref(),
            Database::Kraken2Db => dbs.kraken2_db.as_deref(),
            Database::CentrifugeDb => dbs.centrifuge_db.as_deref(),
        }
    }

    /// CPU request for a stage: the configured override or the stage default.
    pub fn cpus_for(&self, stage_id: &str, default: usize) -> usize {
        self.options
            .resources
            .cpus
            .get(stage_id)
            .copied()
            .unwrap_or(default)
    }
}

fn absolute(option: &str, path: &Path) -> Result<PathBuf, PipelineError> {
    std::path::absolute(path).map_err(|e| {
        PipelineError::ConfigValidation(format!("{option}: cannot resolve {}: {e}", path.display()))
    })
}

// Default value functions for serde
fn default_phred() -> u8 { 33 }
fn default_minimum_hit_groups() -> u32 { 2 }
fn default_min_hitlen() -> u32 { 22 }
fn default_max_assignments() -> u32 { 5 }
fn default_min_length() -> u32 { 30 }
fn default_min_quality() -> u32 { 20 }
fn default_workers() -> usize { 4 }
fn default_outdir() -> PathBuf { PathBuf::from("results") }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 30 }

fn default_max_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
