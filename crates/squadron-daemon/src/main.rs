//! Squadron Daemon
//!
//! Hosts the orchestration engine: fires cleanup deadlines on a fixed tick,
//! follows resource pressure and periodically logs a health snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use squadron_core::config::load_config;
use squadron_daemon::orchestration::{Orchestrator, OrchestratorEvent, UuidAgentFactory};

#[derive(Parser, Debug)]
#[command(name = "squadron-daemon")]
#[command(version, about = "Squadron daemon - sub-agent orchestration control plane")]
struct Args {
    /// Path to the JSON configuration file (defaults apply if it is missing)
    #[arg(long, default_value = "squadron.json", env = "SQUADRON_CONFIG")]
    config: PathBuf,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "SQUADRON_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SQUADRON_LOG_JSON")]
    log_json: bool,

    /// Seconds between health snapshots in the log.
    #[arg(long, default_value_t = 60, env = "SQUADRON_HEALTH_INTERVAL")]
    health_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("squadron_daemon={}", args.log_level);
    squadron_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config = load_config(&args.config)?;
    let tick_interval = config.cleanup.tick_interval();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        max_concurrent = config.concurrency.max_concurrent,
        policy = ?config.cleanup.policy,
        "Starting squadron-daemon"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(config, Arc::new(UuidAgentFactory), Some(events_tx));

    let event_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                OrchestratorEvent::Admitted(grant) => info!(
                    commander_id = %grant.commander_id,
                    task_index = grant.task_index,
                    model = %grant.model,
                    "Subtask admitted"
                ),
                OrchestratorEvent::EmergencyCleanup(ids) => {
                    warn!(destroyed = ids.len(), "Emergency cleanup ran");
                }
            }
        }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();
    tokio::pin!(sigterm_future);

    let mut tick = tokio::time::interval(tick_interval);
    let mut health = tokio::time::interval(Duration::from_secs(args.health_interval.max(1)));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let fired = orchestrator.tick(Instant::now());
                if !fired.is_empty() {
                    debug!(fired = fired.len(), "Cleanup deadlines handled");
                }
                orchestrator.refresh_pressure();
            }
            _ = health.tick() => {
                match serde_json::to_string(&orchestrator.health()) {
                    Ok(snapshot) => info!(%snapshot, "Health"),
                    Err(e) => warn!(error = %e, "Failed to serialize health snapshot"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = &mut sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
        }
    }

    orchestrator.shutdown();
    // Dropping the orchestrator closes the event channel.
    drop(orchestrator);
    let _ = event_task.await;

    info!("Daemon stopped");
    Ok(())
}
