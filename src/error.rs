//! Error types for pipeline construction and execution.

use std::path::PathBuf;
use thiserror::Error;

use crate::topology::ChannelRole;

/// Errors that abort a run before (or instead of) dispatching stage instances.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("unresolved channel {role} for stage '{stage}': {reason}")]
    UnresolvedChannel {
        stage: String,
        role: ChannelRole,
        reason: String,
    },

    #[error("stage '{stage}' is registered more than once")]
    DuplicateStage { stage: String },

    #[error("topology contains a cycle through stages: {}", .stages.join(", "))]
    TopologyCycle { stages: Vec<String> },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether this error was raised before any stage could be dispatched.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            PipelineError::ConfigValidation(_)
                | PipelineError::Discovery(_)
                | PipelineError::UnresolvedChannel { .. }
                | PipelineError::DuplicateStage { .. }
                | PipelineError::TopologyCycle { .. }
        )
    }
}

/// Errors from resolving input patterns into samples.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no input files match pattern '{pattern}'")]
    EmptyInput { pattern: String },

    #[error("sample '{name}' has {found} file(s), expected {expected}: {files:?}")]
    MalformedGroup {
        name: String,
        expected: usize,
        found: usize,
        files: Vec<PathBuf>,
    },

    #[error("invalid input pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Channel protocol violations. These indicate a scheduler or registry defect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {role}/{key} already holds an item")]
    AlreadyPublished { role: ChannelRole, key: String },

    #[error("collecting channel {role} is sealed; rejected write from {stage}/{key}")]
    Sealed {
        role: ChannelRole,
        stage: String,
        key: String,
    },

    #[error("collecting channel {role} already has an item from {stage}/{key}")]
    DuplicateContribution {
        role: ChannelRole,
        stage: String,
        key: String,
    },

    #[error("stage '{stage}' is not a declared consumer of {role}")]
    UndeclaredConsumer { role: ChannelRole, stage: String },

    #[error("channel {role}/{key} was already delivered to {stage}")]
    AlreadyDelivered {
        role: ChannelRole,
        key: String,
        stage: String,
    },

    #[error("channel {role}/{key} is not ready")]
    NotReady { role: ChannelRole, key: String },

    #[error("no channel for role {role}")]
    UnknownChannel { role: ChannelRole },
}

/// Why a single stage instance failed. Never fatal to the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageFailure {
    #[error("external tool exited with {}: {stderr}", exit_code.map_or("signal".to_string(), |c| format!("code {c}")))]
    ExternalTool {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("declared output '{pattern}' was not produced")]
    MissingDeclaredOutput { pattern: String },

    #[error("failed to launch stage: {0}")]
    Launch(String),
}
