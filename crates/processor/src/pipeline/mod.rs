//! Tick execution and scheduling
//!
//! [`StreamEngine`] owns the live state and runs one micro-batch per call to
//! [`StreamEngine::run_tick`]. [`TriggerScheduler`] calls it on a fixed
//! interval until asked to stop.
//!
//! # Example
//!
//! ```rust,no_run
//! use processor::config::ProcessorConfig;
//! use processor::metrics::{EngineMetrics, MetricsRegistry};
//! use processor::pipeline::{StreamEngine, TriggerScheduler};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProcessorConfig::load(None)?;
//! let metrics = EngineMetrics::new(&MetricsRegistry::new());
//! let interval = config.trigger.interval();
//!
//! let engine = StreamEngine::from_config(config, metrics).await?;
//! let mut scheduler = TriggerScheduler::new(engine, interval);
//! let handle = scheduler.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     handle.shutdown();
//! });
//! scheduler.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod scheduler;

pub use engine::{
    checkpoint_coordinator, sink_router, EngineState, LateCounts, StreamEngine, TickOutcome,
    TickStats, CONSOLE, COUNTRY_KPI, GLOBAL_KPI,
};
pub use scheduler::{RunSummary, SchedulerState, ShutdownHandle, TriggerScheduler};
