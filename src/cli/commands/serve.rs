//! Orchestrator daemon command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

use crate::application::Engine;
use crate::infrastructure::logging::LoggerImpl;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Override the lease owner name of this instance
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Override the scheduling poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

pub async fn execute(args: ServeArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let mut config = crate::cli::load_config(config_path)?;
    if let Some(poll) = args.poll_interval_ms {
        config.orchestrator.poll_interval_ms = poll;
    }
    if let Some(instance_id) = args.instance_id {
        config.orchestrator.instance_id = Some(instance_id);
    }

    let _logger = LoggerImpl::init(&config.logging).context("Failed to initialize logging")?;
    let engine = Engine::open(config).await?;

    engine.daemon.start().await;
    if !json_mode {
        println!(
            "Orchestrator {} running. Press Ctrl-C to stop.",
            engine.daemon.instance_id()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let drained = engine.daemon.stop().await;
    let status = engine.daemon.status().await;
    let audit = engine.audit.stats().await;

    if json_mode {
        let body = serde_json::json!({ "drained": drained, "status": status, "audit": audit });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!(
            "Stopped after {} ticks ({} runs completed, {} failed).",
            status.total_ticks, status.runs_completed, status.runs_failed
        );
        println!("{} audit entries recorded, {} denials.", audit.total_entries, audit.denials);
        if !drained {
            println!("Some steps were still executing; their leases will expire and be recovered.");
        }
    }

    engine.pool.close().await;
    Ok(())
}
