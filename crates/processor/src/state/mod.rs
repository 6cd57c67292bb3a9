//! Durable engine state
//!
//! The engine keeps its working state in memory and persists it once per
//! trigger through the [`CheckpointCoordinator`]. A checkpoint has one part
//! per namespace:
//!
//! - `engine`: source position, watermark tracker state and trigger id
//! - one namespace per aggregator, holding its open windows
//!
//! Parts are written first; the manifest that names them is replaced last
//! and is the single commit point. Restoring always yields the state of one
//! trigger, never a mix of two.
//!
//! ## Example
//!
//! ```rust,no_run
//! use processor::state::{Checkpoint, CheckpointCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = CheckpointCoordinator::new("/tmp/engine_checkpoints", 5)
//!         .with_namespace("global_kpi", "/tmp/time_kpi_checkpoints");
//!
//!     match coordinator.latest_manifest().await? {
//!         Some(manifest) => println!("last commit: trigger {}", manifest.trigger_id),
//!         None => println!("no checkpoint yet"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;

pub use checkpoint::{
    Checkpoint, CheckpointCoordinator, CheckpointManifest, CheckpointStats, EngineCheckpoint,
    ManifestEntry, ENGINE_NAMESPACE, MANIFEST_FILE,
};
