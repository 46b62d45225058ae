//! Completion journal for resuming interrupted runs.
//!
//! Every succeeded instance writes one JSON record under
//! `{outdir}/.sampleflow/journal/`. A record is reusable when its
//! fingerprint (stage, sample, rendered command and input file identities)
//! still matches and every recorded output still exists.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::pipeline::executor::Job;
use crate::pipeline::SampleKey;
use crate::topology::ChannelRole;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub stage: String,
    pub sample: String,
    pub fingerprint: String,
    /// Output files keyed by role name
    pub outputs: BTreeMap<String, Vec<PathBuf>>,
}

#[derive(Debug, Clone)]
pub struct CompletionJournal {
    dir: PathBuf,
}

impl CompletionJournal {
    pub fn new(outdir: &Path) -> Self {
        Self {
            dir: outdir.join(".sampleflow").join("journal"),
        }
    }

    fn record_path(&self, stage: &str, sample: &SampleKey) -> PathBuf {
        let sample = match sample {
            SampleKey::Sample(name) => name.as_str(),
            SampleKey::Global => "_global",
        };
        self.dir.join(format!("{stage}--{sample}.json"))
    }

    /// Fingerprint of a job and the identity of its inputs.
    pub fn fingerprint(job: &Job, inputs: &[PathBuf]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(job.stage_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(job.sample.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(job.command.as_bytes());
        for path in inputs {
            hasher.update([0u8]);
            hasher.update(path.to_string_lossy().as_bytes());
            if let Ok(meta) = std::fs::metadata(path) {
                hasher.update(meta.len().to_le_bytes());
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                hasher.update(mtime.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Outputs of a previous identical run of `job`, if still valid.
    pub fn lookup(&self, job: &Job, fingerprint: &str) -> Option<BTreeMap<ChannelRole, Vec<PathBuf>>> {
        let contents = std::fs::read_to_string(self.record_path(job.stage_id, &job.sample)).ok()?;
        let record: JournalRecord = match serde_json::from_str(&contents) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("Ignoring unreadable journal record for {}/{}: {}", job.stage_id, job.sample, e);
                return None;
            }
        };
        if record.fingerprint != fingerprint {
            return None;
        }

        let mut outputs = BTreeMap::new();
        for (role, _) in &job.outputs {
            let files = record.outputs.get(role.as_str())?;
            if files.is_empty() || !files.iter().all(|f| f.is_file()) {
                return None;
            }
            outputs.insert(*role, files.clone());
        }
        Some(outputs)
    }

    /// Record a successful completion.
    pub fn record(
        &self,
        job: &Job,
        fingerprint: &str,
        outputs: &BTreeMap<ChannelRole, Vec<PathBuf>>,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let record = JournalRecord {
            stage: job.stage_id.to_string(),
            sample: job.sample.as_str().to_string(),
            fingerprint: fingerprint.to_string(),
            outputs: outputs
                .iter()
                .map(|(role, files)| (role.as_str().to_string(), files.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(self.record_path(job.stage_id, &job.sample), json)
    }
}
