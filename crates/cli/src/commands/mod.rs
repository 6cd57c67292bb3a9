//! CLI command implementations

pub mod checkpoint;
pub mod run;

pub use checkpoint::CheckpointCommand;
pub use run::RunCommand;
