//! Declarative stage catalog.
//!
//! Each [`StageDef`] describes one logical processing step: when it is
//! active, which channel roles it reads and writes, how many CPU tokens it
//! needs, which databases it touches, and how its command line is built.
//! Branch selection is expressed entirely through activation predicates and
//! port predicates over the [`Config`], so one definition covers every
//! configuration combination.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::{Aligner, Config, Database};
use crate::pipeline::SampleKey;
use crate::topology::commands::{self, CommandContext};

/// Activation or port predicate. Pure function of the configuration.
pub type Predicate = fn(&Config) -> bool;

/// Builds the shell command for one stage instance.
pub type CommandTemplate = fn(&CommandContext<'_>) -> String;

/// Typed artifact roles connecting stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    RawReads,
    ControlReads,
    ControlIndex,
    TrimmedReads,
    HumanAlignment,
    HostUnmapped,
    CleanReads,
    ClassifierHits,
    FastqcReport,
    TrimReport,
    AlignmentMetrics,
    DamageProfile,
    Taxonomy,
    QcReport,
    TaxonomyReport,
}

impl ChannelRole {
    /// Whether items of this role are routed point-to-point or collected
    /// across samples for an aggregator.
    pub fn kind(self) -> ChannelKind {
        match self {
            ChannelRole::FastqcReport
            | ChannelRole::TrimReport
            | ChannelRole::AlignmentMetrics
            | ChannelRole::DamageProfile
            | ChannelRole::Taxonomy => ChannelKind::Collecting,
            _ => ChannelKind::Routed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelRole::RawReads => "raw_reads",
            ChannelRole::ControlReads => "control_reads",
            ChannelRole::ControlIndex => "control_index",
            ChannelRole::TrimmedReads => "trimmed_reads",
            ChannelRole::HumanAlignment => "human_alignment",
            ChannelRole::HostUnmapped => "host_unmapped",
            ChannelRole::CleanReads => "clean_reads",
            ChannelRole::ClassifierHits => "classifier_hits",
            ChannelRole::FastqcReport => "fastqc_report",
            ChannelRole::TrimReport => "trim_report",
            ChannelRole::AlignmentMetrics => "alignment_metrics",
            ChannelRole::DamageProfile => "damage_profile",
            ChannelRole::Taxonomy => "taxonomy",
            ChannelRole::QcReport => "qc_report",
            ChannelRole::TaxonomyReport => "taxonomy_report",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Routed,
    Collecting,
}

/// How many instances a stage has per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One instance per discovered sample
    PerSample,
    /// One instance per run (`*global*`)
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Materialized from discovered inputs, never dispatched
    Source,
    /// Runs an external command
    Process,
}

#[derive(Clone, Copy)]
pub struct InputPort {
    pub role: ChannelRole,
    pub when: Predicate,
}

#[derive(Clone, Copy)]
pub struct OutputPort {
    pub role: ChannelRole,
    /// Glob relative to the stage working directory. `{sample}` is replaced
    /// by the instance's sample name.
    pub pattern: &'static str,
    pub when: Predicate,
}

impl OutputPort {
    /// Concrete glob for one instance.
    pub fn glob_for(&self, sample: &SampleKey) -> String {
        self.pattern
            .replace("{sample}", &glob::Pattern::escape(sample.as_str()))
    }
}

impl fmt::Debug for InputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputPort({})", self.role)
    }
}

impl fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputPort({} <- {})", self.role, self.pattern)
    }
}

/// One logical processing step.
#[derive(Clone)]
pub struct StageDef {
    pub id: &'static str,
    pub scope: Scope,
    pub kind: StageKind,
    pub activation: Predicate,
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
    pub cpus: usize,
    pub databases: Vec<Database>,
    pub command: Option<CommandTemplate>,
}

impl StageDef {
    /// A stage that runs an external command.
    pub fn process(id: &'static str, scope: Scope) -> Self {
        Self {
            id,
            scope,
            kind: StageKind::Process,
            activation: always,
            inputs: Vec::new(),
            outputs: Vec::new(),
            cpus: 1,
            databases: Vec::new(),
            command: None,
        }
    }

    /// A stage that publishes discovered input files under `role`.
    pub fn source(id: &'static str, scope: Scope, role: ChannelRole) -> Self {
        Self {
            kind: StageKind::Source,
            outputs: vec![OutputPort {
                role,
                pattern: "",
                when: always,
            }],
            ..Self::process(id, scope)
        }
    }

    pub fn when(mut self, activation: Predicate) -> Self {
        self.activation = activation;
        self
    }

    pub fn input(self, role: ChannelRole) -> Self {
        self.input_when(role, always)
    }

    /// Input that is only wired when `when` holds.
    pub fn input_when(mut self, role: ChannelRole, when: Predicate) -> Self {
        self.inputs.push(InputPort { role, when });
        self
    }

    pub fn output(self, role: ChannelRole, pattern: &'static str) -> Self {
        self.output_when(role, pattern, always)
    }

    /// Output that is only published when `when` holds.
    pub fn output_when(mut self, role: ChannelRole, pattern: &'static str, when: Predicate) -> Self {
        self.outputs.push(OutputPort { role, pattern, when });
        self
    }

    pub fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn requires(mut self, db: Database) -> Self {
        self.databases.push(db);
        self
    }

    pub fn command(mut self, template: CommandTemplate) -> Self {
        self.command = Some(template);
        self
    }

    pub fn is_active(&self, config: &Config) -> bool {
        (self.activation)(config)
    }

    pub fn active_inputs<'a>(&'a self, config: &'a Config) -> impl Iterator<Item = &'a InputPort> + 'a {
        self.inputs.iter().filter(move |p| (p.when)(config))
    }

    pub fn active_outputs<'a>(&'a self, config: &'a Config) -> impl Iterator<Item = &'a OutputPort> + 'a {
        self.outputs.iter().filter(move |p| (p.when)(config))
    }

    /// Global stage fed by at least one collecting channel.
    pub fn is_aggregator(&self) -> bool {
        self.scope == Scope::Global
            && self
                .inputs
                .iter()
                .any(|p| p.role.kind() == ChannelKind::Collecting)
    }
}

impl fmt::Debug for StageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDef")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("cpus", &self.cpus)
            .field("databases", &self.databases)
            .finish()
    }
}

// Activation predicates
pub fn always(_: &Config) -> bool { true }
pub fn ancient(config: &Config) -> bool { config.is_ancient() }
pub fn with_control(config: &Config) -> bool { config.has_control() }
pub fn without_control(config: &Config) -> bool { !config.has_control() }
pub fn kraken2_branch(config: &Config) -> bool { config.aligner() == Aligner::Kraken2 }
pub fn centrifuge_branch(config: &Config) -> bool { config.aligner() == Aligner::Centrifuge }

/// Ordered catalog of stage definitions.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: Vec<Arc<StageDef>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: StageDef) -> &mut Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stages(&self) -> &[Arc<StageDef>] {
        &self.stages
    }

    pub fn get(&self, id: &str) -> Option<&Arc<StageDef>> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// The screening pipeline: QC, trimming, host removal, optional
    /// control subtraction and damage profiling, one of two taxonomic
    /// classifier branches, and two run-level reports.
    pub fn standard() -> Self {
        use ChannelRole::*;
        use Scope::*;

        let mut registry = Self::new();
        registry
            .register(StageDef::source("reads", PerSample, RawReads))
            .register(StageDef::source("control_reads", Global, ControlReads).when(with_control))
            .register(
                StageDef::process("fastqc", PerSample)
                    .input(RawReads)
                    .output(FastqcReport, "{sample}_[12]_fastqc.zip")
                    .cpus(2)
                    .command(commands::fastqc),
            )
            .register(
                StageDef::process("trim", PerSample)
                    .input(RawReads)
                    .output(TrimmedReads, "{sample}.trimmed.fastq.gz")
                    .output(TrimReport, "{sample}.settings")
                    .cpus(4)
                    .command(commands::trim),
            )
            .register(
                StageDef::process("align_human", PerSample)
                    .input(TrimmedReads)
                    .output(HumanAlignment, "{sample}.human.bam")
                    .output(AlignmentMetrics, "{sample}.human.flagstat")
                    .output_when(HostUnmapped, "{sample}.unmapped.fastq.gz", with_control)
                    .output_when(CleanReads, "{sample}.unmapped.fastq.gz", without_control)
                    .cpus(8)
                    .requires(Database::HumanIndex)
                    .command(commands::align_human),
            )
            .register(
                StageDef::process("damage_profile", PerSample)
                    .when(ancient)
                    .input(HumanAlignment)
                    .output(DamageProfile, "{sample}.damage/5pCtoT_freq.txt")
                    .cpus(1)
                    .command(commands::damage_profile),
            )
            .register(
                StageDef::process("index_control", Global)
                    .when(with_control)
                    .input(ControlReads)
                    .output(ControlIndex, "control_index.*.bt2")
                    .cpus(4)
                    .command(commands::index_control),
            )
            .register(
                StageDef::process("align_control", PerSample)
                    .when(with_control)
                    .input(HostUnmapped)
                    .input(ControlIndex)
                    .output(CleanReads, "{sample}.clean.fastq.gz")
                    .output(AlignmentMetrics, "{sample}.control.flagstat")
                    .cpus(4)
                    .command(commands::align_control),
            )
            .register(
                StageDef::process("kraken2", PerSample)
                    .when(kraken2_branch)
                    .input(CleanReads)
                    .output(ClassifierHits, "{sample}.kraken2.out")
                    .cpus(8)
                    .requires(Database::Kraken2Db)
                    .command(commands::kraken2),
            )
            .register(
                StageDef::process("kraken2_filter", PerSample)
                    .when(kraken2_branch)
                    .input(ClassifierHits)
                    .output(Taxonomy, "{sample}.kraken2.krk")
                    .command(commands::kraken2_filter),
            )
            .register(
                StageDef::process("centrifuge", PerSample)
                    .when(centrifuge_branch)
                    .input(CleanReads)
                    .output(ClassifierHits, "{sample}.centrifuge.out")
                    .cpus(8)
                    .requires(Database::CentrifugeDb)
                    .command(commands::centrifuge),
            )
            .register(
                StageDef::process("centrifuge_filter", PerSample)
                    .when(centrifuge_branch)
                    .input(ClassifierHits)
                    .output(Taxonomy, "{sample}.centrifuge.cfg")
                    .command(commands::centrifuge_filter),
            )
            .register(
                StageDef::process("multiqc", Global)
                    .input(FastqcReport)
                    .input(TrimReport)
                    .input(AlignmentMetrics)
                    .input_when(DamageProfile, ancient)
                    .output(QcReport, "multiqc_report.html")
                    .command(commands::multiqc),
            )
            .register(
                StageDef::process("taxonomy_report", Global)
                    .input(Taxonomy)
                    .output(TaxonomyReport, "taxonomy.rcf.html")
                    .cpus(2)
                    .command(commands::taxonomy_report),
            );
        registry
    }
}
