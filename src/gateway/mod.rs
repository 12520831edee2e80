// Settlement gateway - custodial wallet transfer execution and inquiry
pub mod cobo;
#[cfg(test)]
pub mod mock;
pub mod signer;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::GatewayError;

pub use cobo::{CoboEnv, CoboGateway};
pub use signer::CoboSigner;

/// Outbound custodial transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Idempotency key: repeating a request id never creates a second transfer
    pub request_id: String,
    pub source_wallet_id: String,
    pub token: String,
    pub amount: Decimal,
    pub destination_address: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Submitted, awaiting signature, broadcasting or confirming
    Pending,
    Confirmed,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub tx_hash: Option<String>,
    pub chain_id: Option<String>,
}

/// A transaction as reported by the gateway's transaction search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub status: TransferStatus,
    pub chain_id: String,
    pub token_id: Option<String>,
    pub tx_hash: Option<String>,
    pub source_addresses: Vec<String>,
    pub destination_address: Option<String>,
    pub amount: Decimal,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token_id: String,
    pub total: Decimal,
    pub available: Decimal,
    pub pending: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: String,
    pub chain_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedChain {
    pub chain_id: String,
    pub symbol: Option<String>,
}

/// SettlementGateway trait - implemented by each custodial provider
///
/// INVARIANTS:
/// - `transfer` must be idempotent on `request_id`
/// - Transport failures are `Unavailable`/`Timeout` (outcome unknown); only an
///   explicit refusal by the provider is `Rejected`
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Execute a custodial transfer, returning the provider's transfer id
    async fn transfer(&self, request: &TransferRequest) -> Result<String, GatewayError>;

    async fn get_transfer(&self, transfer_id: &str) -> Result<TransferInfo, GatewayError>;

    /// The transfer submitted under `request_id`, if the provider knows one
    async fn find_transfer_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<TransferInfo>, GatewayError>;

    /// Largest amount transferable from the wallet net of fees
    async fn get_max_transferable(
        &self,
        wallet_id: &str,
        token: &str,
        fee_rate: &str,
        from_addr: &str,
        to_addr: &str,
    ) -> Result<Decimal, GatewayError>;

    /// Transactions matching an on-chain hash on a chain
    async fn list_transactions(
        &self,
        tx_hash: &str,
        chain_id: &str,
    ) -> Result<Vec<TransactionRecord>, GatewayError>;

    async fn list_token_balances(&self, wallet_id: &str) -> Result<Vec<TokenBalance>, GatewayError>;

    async fn list_wallet_addresses(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletAddress>, GatewayError>;

    async fn create_wallet_address(
        &self,
        wallet_id: &str,
        chain_id: &str,
    ) -> Result<Vec<WalletAddress>, GatewayError>;

    async fn list_supported_chains(&self) -> Result<Vec<SupportedChain>, GatewayError>;
}

/// Bound a gateway call. Elapsing is an unknown outcome, never a failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, GatewayError>(1)
        };
        let result = with_timeout(Duration::from_millis(20), slow).await;
        assert_eq!(result, Err(GatewayError::Timeout(20)));

        let fast = async { Ok::<_, GatewayError>(7) };
        assert_eq!(with_timeout(Duration::from_millis(20), fast).await, Ok(7));
    }
}
