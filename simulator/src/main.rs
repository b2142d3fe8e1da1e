//! CashBridge Simulator
//!
//! Drives escrows and transfers through in-memory ledgers so integrators can
//! watch the release, refund and dispute paths end to end.

use std::sync::Arc;

use anyhow::Context;
use cashbridge_coordinator::{CoordinatorConfig, InMemoryRecordStore, PgRecordStore, RecordStore};
use cashbridge_routing::RoutingConfig;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod agents;
mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// CashBridge Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "CashBridge escrow and routing simulation environment")]
struct Args {
    /// Number of simulated cash agents
    #[arg(short, long, default_value = "4")]
    agents: usize,

    /// Scenario to run ("all" runs every built-in scenario)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Simulation speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let (json, plain) = if args.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();

    info!("Starting CashBridge Simulator");
    info!("Agents: {}", args.agents);
    info!("Speed: {}x", args.speed);

    let coordinator_config = CoordinatorConfig::from_env();
    coordinator_config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid coordinator configuration")?;
    let routing_config = RoutingConfig::from_env();

    let store: Arc<dyn RecordStore> = match &coordinator_config.database_url {
        Some(url) => {
            let store = PgRecordStore::connect(url).await?;
            store.migrate().await?;
            info!("Using PostgreSQL record store");
            Arc::new(store)
        }
        None => Arc::new(InMemoryRecordStore::new()),
    };

    let mut controller = SimulationController::new(
        args.agents,
        args.speed,
        args.seed,
        store,
        coordinator_config,
        routing_config,
    )?;

    match args.scenario.as_deref() {
        Some("all") => {
            for scenario in Scenario::all() {
                controller.run_scenario(&scenario).await?;
            }
        }
        Some(name) => {
            info!("Running scenario: {}", name);
            let scenario = Scenario::load(name)?;
            controller.run_scenario(&scenario).await?;
        }
        None => {
            info!("Running in continuous mode");
            info!("Press Ctrl+C to stop");

            let duration = if args.duration > 0 {
                Some(std::time::Duration::from_secs(args.duration))
            } else {
                None
            };

            controller.run(duration).await?;
        }
    }

    let metrics = controller.metrics();
    info!("Simulation complete");
    info!("Escrows opened: {}", metrics.escrows_opened);
    info!("Completed: {}", metrics.escrows_completed);
    info!("Refunded: {}", metrics.escrows_refunded);
    info!("Expired: {}", metrics.escrows_expired);
    info!("Disputed: {}", metrics.escrows_disputed);
    info!("Stranded deposits: {}", metrics.stranded_deposits);
    info!("Conflicts: {}", metrics.conflicts);
    info!(
        "Transfers: {} instant, {} direct, {} failed",
        metrics.instant_transfers, metrics.direct_transfers, metrics.failed_transfers
    );
    info!(
        "Release latency: avg {}ms, p50 {}ms, p99 {}ms",
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms()
    );
    info!("Completion rate: {:.1}%", metrics.completion_rate() * 100.0);

    println!("{}", controller.coordinator().metrics().to_prometheus());

    Ok(())
}
