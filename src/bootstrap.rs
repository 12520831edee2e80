use std::{str::FromStr, sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};
use crate::{
    config::{Config, LedgerBackend},
    error::{AppError, AppResult},
    gateway::{CoboEnv, CoboGateway, CoboSigner, SettlementGateway},
    ledger::{InMemoryLedger, LedgerRepository, LedgerStore},
    orderbook::OrderBook,
    settlement::Reconciler,
};

/// Long-lived components, built once at startup
pub struct AppState {
    pub order_book: Arc<OrderBook>,
    pub reconciler: Arc<Reconciler>,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let ledger: Arc<dyn LedgerStore> = match config.ledger_backend {
        LedgerBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| AppError::Config("DATABASE_URL must be set".to_string()))?;
            let pool = initialize_database(database_url, config.db_max_connections).await?;
            info!("✅ Postgres ledger initialized");
            Arc::new(LedgerRepository::new(pool))
        }
        LedgerBackend::Memory => {
            warn!("⚠️  In-memory ledger selected - order state will not survive a restart");
            Arc::new(InMemoryLedger::new())
        }
    };

    let gateway: Arc<dyn SettlementGateway> = Arc::new(initialize_gateway(config)?);

    let order_book = Arc::new(OrderBook::new(
        config.order_book_config(),
        ledger.clone(),
        gateway.clone(),
    ));
    info!("✅ Order book initialized");

    let reconciler = Arc::new(Reconciler::new(
        config.reconciler_config(),
        ledger.clone(),
        order_book.clone(),
    ));
    info!("✅ Reconciler initialized");

    Ok(AppState {
        order_book,
        reconciler,
    })
}

fn initialize_gateway(config: &Config) -> AppResult<CoboGateway> {
    let env = CoboEnv::from_str(&config.cobo_env).map_err(AppError::Config)?;
    let signer = CoboSigner::from_hex(&config.cobo_api_secret)?;
    info!("🔑 Custodial API key: {}", signer.api_key());

    let gateway = CoboGateway::new(env, signer, config.gateway_timeout())?;
    let gateway = match &config.cobo_base_url {
        Some(url) => gateway.with_base_url(url.clone()),
        None => gateway,
    };

    info!("✅ Settlement gateway initialized ({:?})", env);
    Ok(gateway)
}

/// Startup custody check: the payout wallet is reachable and every configured
/// deposit chain has an address. Failures are logged, not fatal.
pub async fn check_custody(state: &AppState, config: &Config) {
    info!("⚙️  Checking custodial wallet {}...", config.custodial_wallet_id);

    match state.order_book.custody_balances().await {
        Ok(balances) => {
            info!("📋 Custodial balances:");
            for balance in balances {
                info!(
                    "   {}: available {} (pending {})",
                    balance.token_id, balance.available, balance.pending
                );
            }
        }
        Err(e) => warn!("⚠️  Could not read custodial balances: {}", e),
    }

    for chain in &config.deposit_chains {
        match state.order_book.ensure_deposit_address(chain).await {
            Ok(address) => info!("✅ Deposit address on {}: {}", chain, address.address),
            Err(e) => warn!("⚠️  No deposit address on {}: {}", chain, e),
        }
    }
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
