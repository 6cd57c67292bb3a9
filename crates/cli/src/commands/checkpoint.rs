//! Checkpoint inspection

use anyhow::Context;
use clap::Subcommand;
use colored::Colorize;
use processor::config::ProcessorConfig;
use processor::pipeline::checkpoint_coordinator;

#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointCommand {
    /// Show the last committed checkpoint without modifying it
    #[command(name = "show")]
    Show,
}

impl CheckpointCommand {
    pub async fn execute(&self, config: &ProcessorConfig) -> anyhow::Result<()> {
        match self {
            CheckpointCommand::Show => show(config).await,
        }
    }
}

async fn show(config: &ProcessorConfig) -> anyhow::Result<()> {
    let coordinator = checkpoint_coordinator(config);
    let Some(checkpoint) = coordinator
        .load()
        .await
        .context("failed to load the checkpoint")?
    else {
        println!(
            "{} in {}",
            "No checkpoint".yellow(),
            config.checkpoint.path.display()
        );
        return Ok(());
    };

    println!("{}", "Checkpoint:".bold().cyan());
    println!("  Trigger:    {}", checkpoint.trigger_id.to_string().green());
    println!("  Created:    {}", checkpoint.created_at.to_rfc3339());
    println!("  Position:   {}", checkpoint.source_position);
    println!("  Watermark:  {}", checkpoint.watermark.watermark);

    println!();
    println!("{}", "Aggregators:".bold().cyan());
    for (namespace, snapshot) in &checkpoint.aggregators {
        println!(
            "  {} [{}]",
            namespace.bold(),
            snapshot.group_by.to_string().dimmed()
        );
        println!("    open windows:   {}", snapshot.windows.len());
        println!("    events folded:  {}", snapshot.stats.events_folded);
        println!("    late dropped:   {}", snapshot.stats.dropped_late);
        println!("    finalized:      {}", snapshot.stats.windows_finalized);
    }
    Ok(())
}
