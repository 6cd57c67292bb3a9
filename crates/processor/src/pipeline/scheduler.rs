//! Fixed-interval trigger loop
//!
//! ```text
//! Idle -> Running(tick N) -> Idle -> ... -> Stopping -> Stopped
//! ```
//!
//! Shutdown is observed only between ticks: a tick that has started always
//! commits or aborts before the loop stops.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use super::engine::{StreamEngine, TickOutcome};
use crate::error::Result;

/// Lifecycle of a [`TriggerScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running { trigger_id: u64 },
    Stopping,
    Stopped,
}

/// Tick counts of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: u64,
    pub aborted: u64,
    pub noop: u64,
    /// Last committed trigger id when the loop stopped
    pub last_trigger_id: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Committed(_) => self.committed += 1,
            TickOutcome::Aborted { .. } => self.aborted += 1,
            TickOutcome::NoOp => self.noop += 1,
        }
    }
}

/// Requests a graceful stop; cheap to clone and usable from any task
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    state: Arc<RwLock<SchedulerState>>,
}

impl ShutdownHandle {
    /// Ask the scheduler to stop after the in-flight tick
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.tx.send_replace(true);
    }

    /// Current scheduler state
    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }
}

/// Drives [`StreamEngine`] ticks on a fixed interval
pub struct TriggerScheduler {
    engine: StreamEngine,
    interval: Duration,
    state: Arc<RwLock<SchedulerState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    summary: RunSummary,
}

impl TriggerScheduler {
    pub fn new(engine: StreamEngine, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        let summary = RunSummary {
            last_trigger_id: engine.state().last_committed_trigger_id,
            ..Default::default()
        };
        Self {
            engine,
            interval,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
            summary,
        }
    }

    /// Handle for stopping the loop from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
            state: Arc::clone(&self.state),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn into_engine(self) -> StreamEngine {
        self.engine
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(?state, "Scheduler state change");
        *self.state.write() = state;
    }

    /// Run a single tick
    pub async fn run_once(&mut self) -> Result<TickOutcome> {
        self.set_state(SchedulerState::Running {
            trigger_id: self.engine.next_trigger_id(),
        });
        let result = self.engine.run_tick().await;
        match &result {
            Ok(outcome) => {
                self.summary.record(outcome);
                self.summary.last_trigger_id = self.engine.state().last_committed_trigger_id;
                self.set_state(SchedulerState::Idle);
            }
            Err(_) => self.set_state(SchedulerState::Stopped),
        }
        result
    }

    /// Tick until shutdown is requested or a fatal error occurs
    ///
    /// The first tick fires immediately. A tick that overruns the interval
    /// delays the next one instead of bursting to catch up.
    pub async fn run(&mut self) -> Result<RunSummary> {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting trigger scheduler");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    continue;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "Trigger scheduler stopped by fatal error");
                        return Err(err);
                    }
                }
            }
        }

        self.set_state(SchedulerState::Stopping);
        info!(
            committed = self.summary.committed,
            aborted = self.summary.aborted,
            noop = self.summary.noop,
            last_trigger_id = self.summary.last_trigger_id,
            "Trigger scheduler stopping"
        );
        self.set_state(SchedulerState::Stopped);
        Ok(self.summary.clone())
    }
}
