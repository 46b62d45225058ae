//! Command templates for the standard registry.
//!
//! Each template renders one shell command line from the configuration and
//! the instance's bound inputs. Commands run with the stage working
//! directory as cwd, so outputs are written with bare relative names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{Aligner, Config, Database};
use crate::pipeline::SampleKey;
use crate::topology::ChannelRole;

/// Everything a template may read.
pub struct CommandContext<'a> {
    pub config: &'a Config,
    pub sample: &'a SampleKey,
    pub inputs: &'a BTreeMap<ChannelRole, Vec<PathBuf>>,
    pub cpus: usize,
}

impl<'a> CommandContext<'a> {
    pub fn name(&self) -> &str {
        self.sample.as_str()
    }

    pub fn input(&self, role: ChannelRole) -> &[PathBuf] {
        self.inputs.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All files bound to `role`, quoted and space separated.
    pub fn files(&self, role: ChannelRole) -> String {
        self.input(role)
            .iter()
            .map(|p| quote_path(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// First file bound to `role`, quoted.
    pub fn file(&self, role: ChannelRole) -> String {
        self.input(role).first().map(|p| quote_path(p)).unwrap_or_default()
    }

    pub fn database(&self, db: Database) -> String {
        self.config.database(db).map(quote_path).unwrap_or_default()
    }
}

/// Single-quote a string for `sh -c`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Symlink raw reads under sample-derived names so tool outputs follow
/// `{sample}_{n}` naming regardless of the original file names.
fn stage_reads(ctx: &CommandContext<'_>, role: ChannelRole) -> (String, Vec<String>) {
    let mut links = Vec::new();
    let mut names = Vec::new();
    for (idx, path) in ctx.input(role).iter().enumerate() {
        let ext = if path.to_string_lossy().ends_with(".gz") {
            "fastq.gz"
        } else {
            "fastq"
        };
        let name = shell_quote(&format!("{}_{}.{}", ctx.name(), idx + 1, ext));
        links.push(format!("ln -sf {} {}", quote_path(path), name));
        names.push(name);
    }
    (links.join(" && "), names)
}

pub fn fastqc(ctx: &CommandContext<'_>) -> String {
    let (links, names) = stage_reads(ctx, ChannelRole::RawReads);
    format!(
        "{links} && fastqc --quiet --threads {} --outdir . {}",
        ctx.cpus,
        names.join(" ")
    )
}

pub fn trim(ctx: &CommandContext<'_>) -> String {
    let config = ctx.config;
    let reads = ctx.input(ChannelRole::RawReads);
    let name = shell_quote(ctx.name());
    let trimming = &config.options().trimming;

    let mut cmd = format!(
        "AdapterRemoval --file1 {}",
        reads.first().map(|p| quote_path(p)).unwrap_or_default()
    );
    if let Some(r2) = reads.get(1) {
        cmd.push_str(&format!(" --file2 {}", quote_path(r2)));
    }
    cmd.push_str(&format!(
        " --basename {name} --threads {} --qualitybase {} --minlength {} --minquality {} --trimns --trimqualities --gzip",
        ctx.cpus,
        config.phred(),
        trimming.min_length,
        trimming.min_quality,
    ));

    let finish = match (config.is_ancient(), reads.len()) {
        // Merge overlapping pairs; downstream sees one read per molecule.
        (true, 2) => format!(
            " --collapse && cat {name}.collapsed.gz {name}.collapsed.truncated.gz > {name}.trimmed.fastq.gz"
        ),
        (_, 2) => format!(
            " --interleaved-output && mv {name}.paired.truncated.gz {name}.trimmed.fastq.gz"
        ),
        _ => format!(" && mv {name}.truncated.gz {name}.trimmed.fastq.gz"),
    };
    cmd.push_str(&finish);
    cmd
}

pub fn align_human(ctx: &CommandContext<'_>) -> String {
    let config = ctx.config;
    let name = shell_quote(ctx.name());
    let reads_flag = if !config.is_ancient() && !config.single_end() {
        "--interleaved"
    } else {
        "-U"
    };
    let sensitivity = if config.is_ancient() {
        "--very-sensitive -N 1 -L 20"
    } else {
        "--sensitive"
    };
    format!(
        "bowtie2 -p {cpus} {sensitivity} -x {index} {reads_flag} {reads} \
         | samtools sort -@ {cpus} -o {name}.human.bam - \
         && samtools index {name}.human.bam \
         && samtools flagstat {name}.human.bam > {name}.human.flagstat \
         && samtools fastq -f 4 {name}.human.bam | gzip > {name}.unmapped.fastq.gz",
        cpus = ctx.cpus,
        index = ctx.database(Database::HumanIndex),
        reads = ctx.file(ChannelRole::TrimmedReads),
    )
}

pub fn damage_profile(ctx: &CommandContext<'_>) -> String {
    let name = shell_quote(ctx.name());
    format!(
        "damageprofiler -i {} -o {name}.damage -title {name} && \
         for f in {name}.damage/*/5pCtoT_freq.txt; do [ -e \"$f\" ] && mv \"$f\" {name}.damage/; done; \
         test -e {name}.damage/5pCtoT_freq.txt",
        ctx.file(ChannelRole::HumanAlignment)
    )
}

pub fn index_control(ctx: &CommandContext<'_>) -> String {
    format!(
        "gzip -dcf {} | awk 'NR % 4 == 1 {{ print \">\" substr($0, 2) }} NR % 4 == 2 {{ print }}' > control.fa \
         && bowtie2-build --threads {} control.fa control_index",
        ctx.files(ChannelRole::ControlReads),
        ctx.cpus
    )
}

pub fn align_control(ctx: &CommandContext<'_>) -> String {
    let name = shell_quote(ctx.name());
    let index = ctx
        .input(ChannelRole::ControlIndex)
        .iter()
        .find_map(|p| {
            p.to_string_lossy()
                .strip_suffix(".1.bt2")
                .map(|prefix| shell_quote(prefix))
        })
        .unwrap_or_default();
    format!(
        "bowtie2 -p {cpus} -x {index} -U {reads} | samtools view -b -o {name}.control.bam - \
         && samtools flagstat {name}.control.bam > {name}.control.flagstat \
         && samtools fastq -f 4 {name}.control.bam | gzip > {name}.clean.fastq.gz",
        cpus = ctx.cpus,
        reads = ctx.file(ChannelRole::HostUnmapped),
    )
}

pub fn kraken2(ctx: &CommandContext<'_>) -> String {
    let params = &ctx.config.options().classifier.kraken2;
    let name = shell_quote(ctx.name());
    format!(
        "kraken2 --db {} --threads {} --confidence {} --minimum-hit-groups {} --gzip-compressed \
         --output {name}.kraken2.out --report {name}.kraken2.report {}",
        ctx.database(Database::Kraken2Db),
        ctx.cpus,
        params.confidence,
        params.minimum_hit_groups,
        ctx.file(ChannelRole::CleanReads),
    )
}

pub fn kraken2_filter(ctx: &CommandContext<'_>) -> String {
    format!(
        "awk -F '\\t' '$1 == \"C\"' {} > {}.kraken2.krk",
        ctx.file(ChannelRole::ClassifierHits),
        shell_quote(ctx.name())
    )
}

pub fn centrifuge(ctx: &CommandContext<'_>) -> String {
    let params = &ctx.config.options().classifier.centrifuge;
    let name = shell_quote(ctx.name());
    format!(
        "centrifuge -p {} -x {} --min-hitlen {} -k {} -U {} -S {name}.centrifuge.out --report-file {name}.centrifuge.tsv",
        ctx.cpus,
        ctx.database(Database::CentrifugeDb),
        params.min_hitlen,
        params.max_assignments,
        ctx.file(ChannelRole::CleanReads),
    )
}

pub fn centrifuge_filter(ctx: &CommandContext<'_>) -> String {
    format!(
        "awk -F '\\t' 'NR == 1 || $3 != \"0\"' {} > {}.centrifuge.cfg",
        ctx.file(ChannelRole::ClassifierHits),
        shell_quote(ctx.name())
    )
}

pub fn multiqc(ctx: &CommandContext<'_>) -> String {
    let mut files = vec![
        ctx.files(ChannelRole::FastqcReport),
        ctx.files(ChannelRole::TrimReport),
        ctx.files(ChannelRole::AlignmentMetrics),
    ];
    if ctx.config.is_ancient() {
        files.push(ctx.files(ChannelRole::DamageProfile));
    }
    files.retain(|f| !f.is_empty());
    format!(
        "multiqc --force --filename multiqc_report.html {}",
        files.join(" ")
    )
}

pub fn taxonomy_report(ctx: &CommandContext<'_>) -> String {
    let flag = match ctx.config.aligner() {
        Aligner::Kraken2 => "-k",
        Aligner::Centrifuge => "-f",
    };
    let inputs = ctx
        .input(ChannelRole::Taxonomy)
        .iter()
        .map(|p| format!("{flag} {}", quote_path(p)))
        .collect::<Vec<_>>()
        .join(" ");
    let mut cmd = format!("rcf {inputs} -o taxonomy.rcf.html");
    if let Some(score) = ctx.config.options().classifier.min_score {
        cmd.push_str(&format!(" -y {score}"));
    }
    cmd
}
