//! External process contract.
//!
//! A [`Job`] is one dispatched stage instance: a rendered shell command, a
//! working directory and the output globs it must produce. A [`StageRunner`]
//! executes the command; [`execute`] wraps the runner and judges the result
//! by exit status and declared outputs alone.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{Config, Database};
use crate::error::{PipelineError, StageFailure};
use crate::pipeline::SampleKey;
use crate::topology::ChannelRole;

/// Lines of stderr attached to a failure report.
const STDERR_TAIL_LINES: usize = 20;

/// One dispatched stage instance.
#[derive(Debug, Clone)]
pub struct Job {
    pub stage_id: &'static str,
    pub sample: SampleKey,
    pub workdir: PathBuf,
    pub command: String,
    /// CPU tokens granted (already clamped to the budget)
    pub cpus: usize,
    /// Declared outputs as `(role, glob relative to workdir)`
    pub outputs: Vec<(ChannelRole, String)>,
}

impl Job {
    /// File name of the combined stdout/stderr log inside the workdir.
    pub fn log_name(&self) -> String {
        let sample = match &self.sample {
            SampleKey::Sample(name) => name.as_str(),
            SampleKey::Global => "global",
        };
        format!(".{}.{}.log", self.stage_id, sample)
    }
}

/// Raw result of running a job's command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a job's command. Implementations must not check outputs.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<ProcessOutput, StageFailure>;
}

/// Runs commands with `sh -c` in the job's working directory.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl StageRunner for ShellRunner {
    async fn run(&self, job: &Job) -> Result<ProcessOutput, StageFailure> {
        tracing::debug!("[{}/{}] $ {}", job.stage_id, job.sample, job.command);

        let log_path = job.workdir.join(job.log_name());
        let log = std::fs::File::create(&log_path)
            .map_err(|e| StageFailure::Launch(format!("{}: {e}", log_path.display())))?;

        // stdout streams straight to the log; only stderr is buffered for the tail
        let output = Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StageFailure::Launch(format!("sh -c: {e}")))?;

        if let Err(e) = append_log(&log_path, &output.stderr).await {
            tracing::warn!("Failed to write log for {}/{}: {}", job.stage_id, job.sample, e);
        }

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stderr: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

async fn append_log(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Outcome of [`execute`].
#[derive(Debug)]
pub struct Execution {
    pub result: Result<BTreeMap<ChannelRole, Vec<PathBuf>>, StageFailure>,
    pub elapsed: Duration,
}

/// Run `job` and verify its declared outputs.
pub async fn execute(runner: &dyn StageRunner, job: &Job) -> Execution {
    let start = Instant::now();
    let result = async {
        tokio::fs::create_dir_all(&job.workdir)
            .await
            .map_err(|e| StageFailure::Launch(format!("{}: {e}", job.workdir.display())))?;

        let output = runner.run(job).await?;
        if !output.is_success() {
            return Err(StageFailure::ExternalTool {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        resolve_outputs(&job.workdir, &job.outputs)
    }
    .await;

    Execution {
        result,
        elapsed: start.elapsed(),
    }
}

/// Match every declared output glob in `workdir`. Each port must match at
/// least one file; matches are returned sorted.
pub fn resolve_outputs(
    workdir: &Path,
    outputs: &[(ChannelRole, String)],
) -> Result<BTreeMap<ChannelRole, Vec<PathBuf>>, StageFailure> {
    let base = glob::Pattern::escape(&workdir.to_string_lossy());
    let mut resolved: BTreeMap<ChannelRole, Vec<PathBuf>> = BTreeMap::new();

    for (role, pattern) in outputs {
        let full = format!("{base}/{pattern}");
        let mut files: Vec<PathBuf> = glob::glob(&full)
            .map_err(|e| StageFailure::Launch(format!("bad output pattern '{pattern}': {e}")))?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();
        if files.is_empty() {
            return Err(StageFailure::MissingDeclaredOutput {
                pattern: pattern.clone(),
            });
        }
        files.sort();
        resolved.entry(*role).or_default().extend(files);
    }

    Ok(resolved)
}

/// Check that a configured database exists. Index prefixes (e.g. a bowtie2
/// basename) count as present when any file starts with the prefix.
pub fn check_database(config: &Config, db: Database) -> Result<(), PipelineError> {
    let Some(path) = config.database(db) else {
        return Err(PipelineError::ConfigValidation(format!(
            "{} is required",
            db.option_name()
        )));
    };
    if path.exists() {
        return Ok(());
    }

    let prefix = format!("{}*", glob::Pattern::escape(&path.to_string_lossy()));
    let found = glob::glob(&prefix)
        .map(|mut paths| paths.any(|p| p.is_ok()))
        .unwrap_or(false);
    if found {
        Ok(())
    } else {
        Err(PipelineError::ConfigValidation(format!(
            "{} does not exist: {}",
            db.option_name(),
            path.display()
        )))
    }
}
