use std::sync::Arc;
use std::time::Duration;

use cadence_core::CadenceConfig;
use cadence_scheduler::{SchedulerEngine, Task};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

mod app;
mod tasks;

#[derive(Parser, Debug)]
#[command(name = "cadenced", version, about = "Recurring booking scheduler daemon")]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler in the foreground until Ctrl-C (default).
    Run,
    /// Reconcile transition tasks with upcoming occurrences, print the summary and exit.
    Recover,
    /// Expire spent quotas once and exit.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // explicit flag > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let loaded = CadenceConfig::load(config_path.as_deref());

    let default_filter = match &loaded {
        Ok(config) => config.logging.filter.clone(),
        Err(_) => CadenceConfig::default().logging.filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = loaded.unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        CadenceConfig::default()
    });
    let app = Arc::new(app::App::open(config)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(app).await,
        Command::Recover => {
            let summary = app.service.recover_schedule()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Sweep => {
            let expired = app.service.sweep_expired_quotas()?;
            println!("{expired} quota(s) expired");
            Ok(())
        }
    }
}

async fn run(app: Arc<app::App>) -> anyhow::Result<()> {
    let summary = app.service.recover_schedule()?;
    for error in &summary.errors {
        warn!("recovery error: {error}");
    }

    // Fired-task channel: SchedulerEngine → router task
    let (fired_tx, fired_rx) =
        tokio::sync::mpsc::channel::<Task>(app.config.scheduler.channel_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let engine = SchedulerEngine::new(
        app.tasks.clone(),
        fired_tx,
        Duration::from_millis(app.config.scheduler.poll_interval_ms.max(1)),
    );
    let engine_handle = if app.config.scheduler.enabled {
        let shutdown_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { engine.run(shutdown_rx).await }))
    } else {
        info!("scheduler disabled, no transitions will fire");
        drop(engine);
        None
    };

    let router_handle = tasks::spawn_fired_router(Arc::clone(&app), fired_rx);
    let sweep_handle = tasks::spawn_quota_sweep(
        Arc::clone(&app),
        Duration::from_secs(app.config.quota.sweep_interval_secs.max(1)),
        shutdown_rx,
    );

    info!("cadenced running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // signal the background loops to stop
    let _ = shutdown_tx.send(true);
    if let Some(handle) = engine_handle {
        handle.await?;
    }
    // The engine dropped its sender, so the router drains and exits.
    router_handle.await?;
    sweep_handle.await?;
    Ok(())
}
