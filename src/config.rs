use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::orderbook::OrderBookConfig;
use crate::settlement::ReconcilerConfig;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Postgres,
    /// Process-local; state is lost on restart
    Memory,
}

/// Service configuration, read from the environment (after `.env`).
/// Every key is the lowercased variable name, e.g. `GATEWAY_TIMEOUT_MS`.
#[derive(Deserialize, Clone)]
pub struct Config {
    pub ledger_backend: LedgerBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,

    pub cobo_env: String,
    /// Overrides the environment's API base url
    pub cobo_base_url: Option<String>,
    /// Hex Ed25519 API secret
    pub cobo_api_secret: String,
    pub custodial_wallet_id: String,
    pub fee_rate: String,
    pub gateway_timeout_ms: u64,

    pub reservation_timeout_secs: u64,
    pub resume_grace_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_batch_size: i64,
    pub reconcile_concurrency: usize,

    pub max_conflict_retries: u32,
    pub verify_deposits: bool,
    pub check_max_transferable: bool,
    /// Chains that must have a custodial deposit address at startup
    pub deposit_chains: Vec<String>,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Self::load(config::Environment::default())
    }

    fn load(environment: config::Environment) -> AppResult<Self> {
        let settings = config::Config::builder()
            .set_default("ledger_backend", "postgres")?
            .set_default("db_max_connections", 20)?
            .set_default("cobo_env", "dev")?
            .set_default("fee_rate", "0")?
            .set_default("gateway_timeout_ms", 10_000)?
            .set_default("reservation_timeout_secs", 3600)?
            .set_default("resume_grace_secs", 60)?
            .set_default("reconcile_interval_secs", 30)?
            .set_default("reconcile_batch_size", 200)?
            .set_default("reconcile_concurrency", 8)?
            .set_default("max_conflict_retries", 5)?
            .set_default("verify_deposits", true)?
            .set_default("check_max_transferable", true)?
            .set_default("deposit_chains", Vec::<String>::new())?
            .add_source(
                environment
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("deposit_chains"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.ledger_backend == LedgerBackend::Postgres && self.database_url.is_none() {
            return Err(AppError::Config(
                "DATABASE_URL must be set for the postgres ledger".to_string(),
            ));
        }
        if self.custodial_wallet_id.trim().is_empty() {
            return Err(AppError::Config("CUSTODIAL_WALLET_ID must be set".to_string()));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(AppError::Config(
                "RECONCILE_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn order_book_config(&self) -> OrderBookConfig {
        OrderBookConfig {
            custodial_wallet_id: self.custodial_wallet_id.clone(),
            fee_rate: self.fee_rate.clone(),
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
            max_conflict_retries: self.max_conflict_retries,
            verify_deposits: self.verify_deposits,
            check_max_transferable: self.check_max_transferable,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            reservation_timeout: Duration::from_secs(self.reservation_timeout_secs),
            resume_grace: Duration::from_secs(self.resume_grace_secs),
            batch_size: self.reconcile_batch_size,
            concurrency: self.reconcile_concurrency,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }
}
