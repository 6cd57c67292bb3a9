//! Run command - drive the streaming engine
//!
//! Opens the engine from configuration, restores the last checkpoint and
//! ticks until SIGINT or SIGTERM. With `--once` a single tick runs instead.

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use processor::config::ProcessorConfig;
use processor::metrics::{EngineMetrics, MetricsRegistry};
use processor::pipeline::{RunSummary, StreamEngine, TickOutcome, TriggerScheduler};
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// Run a single tick and exit
    #[arg(long)]
    pub once: bool,
}

impl RunCommand {
    pub async fn execute(&self, config: ProcessorConfig) -> anyhow::Result<()> {
        let registry = MetricsRegistry::new();
        let metrics = EngineMetrics::new(&registry);
        let metrics_file = config.metrics_file.clone();
        let interval = config.trigger.interval();

        let engine = StreamEngine::from_config(config, metrics)
            .await
            .context("failed to open the engine")?;
        let mut scheduler = TriggerScheduler::new(engine, interval);

        let result = if self.once {
            scheduler.run_once().await.map(|outcome| print_outcome(&outcome))
        } else {
            let handle = scheduler.shutdown_handle();
            tokio::spawn(async move {
                wait_for_signal().await;
                handle.shutdown();
            });
            scheduler.run().await.map(|summary| print_summary(&summary))
        };

        if let Some(path) = metrics_file {
            match registry.write_to_file(&path) {
                Ok(()) => info!(path = %path.display(), "Metrics written"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics"),
            }
        }

        result.context("engine stopped with a fatal error")
    }
}

/// Resolve on SIGINT, or SIGTERM on unix
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn print_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Committed(stats) => {
            println!(
                "{} trigger {} ({} records, {} decode errors)",
                "Committed".green().bold(),
                stats.trigger_id,
                stats.records_read,
                stats.decode_errors
            );
            println!(
                "  late events dropped: {} global, {} per country",
                stats.global_late.dropped, stats.country_late.dropped
            );
            println!(
                "  windows finalized: {} global, {} per country",
                stats.global_windows, stats.country_windows
            );
            println!("  watermark: {}", stats.watermark_after);
        }
        TickOutcome::NoOp => println!("{}", "No new input".dimmed()),
        TickOutcome::Aborted { trigger_id, reason } => {
            println!(
                "{} trigger {}: {}",
                "Aborted".yellow().bold(),
                trigger_id,
                reason
            );
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("{}", "Summary:".bold().cyan());
    println!("  Committed:  {}", summary.committed.to_string().green());
    println!("  No-op:      {}", summary.noop);
    if summary.aborted > 0 {
        println!("  Aborted:    {}", summary.aborted.to_string().yellow());
    }
    println!("  Last trigger: {}", summary.last_trigger_id);
}
