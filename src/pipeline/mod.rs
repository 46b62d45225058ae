//! Pipeline runtime: channel routing, scheduling and process execution.

mod budget;
mod channels;
mod executor;
mod journal;
mod metrics;
mod scheduler;

#[cfg(test)]
mod scheduler_integration_tests;

pub use budget::{CpuBudget, CpuReservation};
pub use channels::{Artifact, ChannelRouter, CollectState, CollectingChannel, SampleKey};
pub use executor::{
    check_database, execute, resolve_outputs, Execution, Job, ProcessOutput, ShellRunner,
    StageRunner,
};
pub use journal::{CompletionJournal, JournalRecord};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use scheduler::{
    InstanceReport, InstanceStatus, RunSummary, Scheduler, SchedulerConfig, SkipReason,
};
