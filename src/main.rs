use otc_settlement::{bootstrap, config::Config, settlement::ReconciliationScheduler};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,otc_settlement=debug,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting OTC settlement service");

    let config = Config::from_env()?;
    let state = bootstrap::initialize_app_state(&config).await?;
    bootstrap::check_custody(&state, &config).await;

    let scheduler =
        ReconciliationScheduler::new(config.reconcile_interval(), state.reconciler.clone()).start();

    info!("🌐 Settlement service running");

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received");

    scheduler.shutdown().await;
    info!("✓ Settlement service stopped");

    Ok(())
}
