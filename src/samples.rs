//! Sample discovery: resolve read file patterns into named samples.
//!
//! Patterns are ordinary glob patterns with at most one `{a,b}` alternative
//! group in the file name, e.g. `data/*_R{1,2}.fastq.gz`. Files are grouped
//! by the name stem that precedes the alternative group, so `s1_R1.fastq.gz`
//! and `s1_R2.fastq.gz` become sample `s1` with files in alternative order.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::DiscoveryError;

/// One named unit of input data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub name: String,
    pub files: Vec<PathBuf>,
}

/// A pattern split around its alternative group.
#[derive(Debug)]
struct PairPattern {
    /// Directory part of the pattern (may itself contain wildcards)
    dir: String,
    /// File-name part before the `{...}` group
    head: String,
    /// Alternatives inside the group (a single empty string if none)
    alternatives: Vec<String>,
    /// File-name part after the group
    tail: String,
}

impl PairPattern {
    fn parse(pattern: &str) -> Result<Self, DiscoveryError> {
        let invalid = |reason: &str| DiscoveryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let (dir, file) = match pattern.rfind('/') {
            Some(idx) => (&pattern[..=idx], &pattern[idx + 1..]),
            None => ("", pattern),
        };
        if dir.contains('{') {
            return Err(invalid("alternative groups are only supported in the file name"));
        }

        let Some(open) = file.find('{') else {
            return Ok(Self {
                dir: dir.to_string(),
                head: file.to_string(),
                alternatives: vec![String::new()],
                tail: String::new(),
            });
        };
        let close = file[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| invalid("unterminated '{'"))?;
        let tail = &file[close + 1..];
        if tail.contains('{') {
            return Err(invalid("only one alternative group is supported"));
        }

        let alternatives: Vec<String> = file[open + 1..close]
            .split(',')
            .map(str::to_string)
            .collect();
        if alternatives.iter().any(String::is_empty) {
            return Err(invalid("empty alternative"));
        }

        Ok(Self {
            dir: dir.to_string(),
            head: file[..open].to_string(),
            alternatives,
            tail: tail.to_string(),
        })
    }

    /// Literal text between the last wildcard of `head` and the group.
    fn head_literal_suffix(&self) -> &str {
        match self.head.rfind(['*', '?', ']']) {
            Some(idx) => &self.head[idx + 1..],
            None => &self.head,
        }
    }

    /// Literal text before the first wildcard of `head`.
    fn head_literal_prefix(&self) -> &str {
        match self.head.find(WILDCARDS) {
            Some(idx) => &self.head[..idx],
            None => "",
        }
    }

    /// Literal text after the last wildcard of `tail`.
    fn tail_literal_suffix(&self) -> &str {
        match self.tail.rfind(['*', '?', ']']) {
            Some(idx) => &self.tail[idx + 1..],
            None => &self.tail,
        }
    }

    /// Derive the sample name from a matched file name.
    fn sample_name(&self, file_name: &str, alternative: &str) -> Option<String> {
        if !self.head.contains(WILDCARDS) {
            return literal_stem(&self.head, alternative.is_empty());
        }

        let marker = if alternative.is_empty() {
            // No group: strip the literal extension after the last wildcard.
            self.tail_or_head_extension().to_string()
        } else {
            format!("{}{}", self.head_literal_suffix(), alternative)
        };

        let end = if marker.is_empty() {
            file_name.len()
        } else {
            file_name.rfind(&marker)?
        };
        let stem = &file_name[..end];
        let stem = stem.strip_prefix(self.head_literal_prefix()).unwrap_or(stem);
        if stem.is_empty() {
            None
        } else {
            Some(stem.to_string())
        }
    }

    fn tail_or_head_extension(&self) -> &str {
        if self.tail.is_empty() {
            self.head_literal_suffix()
        } else {
            self.tail_literal_suffix()
        }
    }
}

const WILDCARDS: [char; 3] = ['*', '?', '['];
const SEPARATORS: [char; 3] = ['_', '.', '-'];

/// Sample name for a file-name head without wildcards, such as
/// `blank_R` in `blank_R{1,2}.fq` or `blank.fq` without a group.
fn literal_stem(head: &str, whole_name: bool) -> Option<String> {
    let stem = if whole_name {
        head.split('.').next().unwrap_or(head)
    } else {
        let trimmed = head.trim_end_matches(SEPARATORS);
        match trimmed.strip_suffix(['R', 'r']) {
            Some(rest) if rest.ends_with(SEPARATORS) => rest.trim_end_matches(SEPARATORS),
            _ => trimmed,
        }
    };
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Resolve a pattern into samples, each with exactly `expected_files` files.
pub fn discover(pattern: &str, expected_files: usize) -> Result<Vec<Sample>, DiscoveryError> {
    let parsed = PairPattern::parse(pattern)?;

    let mut groups: BTreeMap<String, Vec<(usize, PathBuf)>> = BTreeMap::new();
    for (alt_idx, alternative) in parsed.alternatives.iter().enumerate() {
        let concrete = format!("{}{}{}{}", parsed.dir, parsed.head, alternative, parsed.tail);
        let paths = glob::glob(&concrete).map_err(|e| DiscoveryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping unreadable input {}: {}", e.path().display(), e);
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            let name = parsed.sample_name(file_name, alternative);
            // Stage commands run in their own working directories.
            let path = match std::path::absolute(&path) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping input {}: {}", path.display(), e);
                    continue;
                }
            };
            match name {
                Some(name) => groups.entry(name).or_default().push((alt_idx, path)),
                None => tracing::debug!("Cannot derive sample name from {}", path.display()),
            }
        }
    }

    if groups.is_empty() {
        return Err(DiscoveryError::EmptyInput {
            pattern: pattern.to_string(),
        });
    }

    let mut samples = Vec::with_capacity(groups.len());
    for (name, mut files) in groups {
        files.sort();
        files.dedup_by(|a, b| a.1 == b.1);
        if files.len() != expected_files {
            return Err(DiscoveryError::MalformedGroup {
                name,
                expected: expected_files,
                found: files.len(),
                files: files.into_iter().map(|(_, p)| p).collect(),
            });
        }
        samples.push(Sample {
            name,
            files: files.into_iter().map(|(_, p)| p).collect(),
        });
    }

    tracing::debug!("Pattern '{}' resolved to {} sample(s)", pattern, samples.len());
    Ok(samples)
}
