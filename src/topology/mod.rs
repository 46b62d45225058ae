//! Stage registry and topology resolution.

mod builder;
pub mod commands;
mod registry;

pub use builder::{ActiveStage, Edge, Topology};
pub use commands::CommandContext;
pub use registry::{
    always, ancient, centrifuge_branch, kraken2_branch, with_control, without_control,
    ChannelKind, ChannelRole, CommandTemplate, InputPort, OutputPort, Predicate, Scope,
    StageDef, StageKind, StageRegistry,
};
