use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{header::CONTENT_TYPE, Client, Method, StatusCode, Url};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use super::{
    SettlementGateway, SupportedChain, TokenBalance, TransactionRecord, TransferInfo,
    TransferRequest, TransferStatus, WalletAddress,
};
use crate::error::GatewayError;
use crate::gateway::signer::CoboSigner;

/// Cobo WaaS2 environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoboEnv {
    Dev,
    Prod,
}

impl CoboEnv {
    pub fn base_url(&self) -> &'static str {
        match self {
            CoboEnv::Dev => "https://api.dev.cobo.com/v2",
            CoboEnv::Prod => "https://api.cobo.com/v2",
        }
    }
}

impl FromStr for CoboEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" | "sandbox" => Ok(CoboEnv::Dev),
            "prod" | "production" => Ok(CoboEnv::Prod),
            other => Err(format!("unknown Cobo environment: {}", other)),
        }
    }
}

/// Custodial wallet gateway backed by the Cobo WaaS2 REST API.
///
/// Built once with its credential; every request is signed with the same key.
pub struct CoboGateway {
    client: Client,
    base_url: String,
    signer: CoboSigner,
    api_key: String,
    timeout: Duration,
    last_nonce: Mutex<i64>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CreateTransferResponse {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct CoboTransaction {
    transaction_id: String,
    status: String,
    chain_id: Option<String>,
    token_id: Option<String>,
    transaction_hash: Option<String>,
    source: Option<CoboSource>,
    destination: Option<CoboDestination>,
}

#[derive(Debug, Deserialize)]
struct CoboSource {
    #[serde(default)]
    addresses: Vec<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoboDestination {
    address: Option<String>,
    amount: Option<String>,
    memo: Option<String>,
    account_output: Option<CoboAccountOutput>,
}

#[derive(Debug, Deserialize)]
struct CoboAccountOutput {
    address: String,
    amount: String,
    memo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MaxTransferableValue {
    max_transferable_value: String,
}

#[derive(Debug, Deserialize)]
struct CoboTokenBalance {
    token_id: String,
    balance: CoboBalance,
}

#[derive(Debug, Deserialize)]
struct CoboBalance {
    total: String,
    available: Option<String>,
    pending: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoboAddress {
    address: String,
    chain_id: String,
}

#[derive(Debug, Deserialize)]
struct CoboChain {
    chain_id: String,
    symbol: Option<String>,
}

fn parse_amount(value: &str) -> Result<Decimal, GatewayError> {
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|_| GatewayError::Decode(format!("invalid amount: {}", value)))
}

fn map_status(status: &str) -> TransferStatus {
    match status {
        "Completed" => TransferStatus::Confirmed,
        "Failed" => TransferStatus::Failed,
        "Rejected" => TransferStatus::Rejected,
        // Submitted, PendingScreening, PendingAuthorization, PendingSignature,
        // Broadcasting, Confirming, Pending
        _ => TransferStatus::Pending,
    }
}

impl From<CoboTransaction> for TransferInfo {
    fn from(tx: CoboTransaction) -> Self {
        TransferInfo {
            transfer_id: tx.transaction_id,
            status: map_status(&tx.status),
            tx_hash: tx.transaction_hash,
            chain_id: tx.chain_id,
        }
    }
}

impl TryFrom<CoboTransaction> for TransactionRecord {
    type Error = GatewayError;

    fn try_from(tx: CoboTransaction) -> Result<Self, GatewayError> {
        let (destination_address, amount, memo) = match tx.destination {
            Some(CoboDestination {
                account_output: Some(output),
                ..
            }) => (Some(output.address), parse_amount(&output.amount)?, output.memo),
            Some(dest) => (
                dest.address,
                dest.amount.as_deref().map(parse_amount).transpose()?.unwrap_or_default(),
                dest.memo,
            ),
            None => (None, Decimal::ZERO, None),
        };

        let source_addresses = match tx.source {
            Some(mut source) => {
                if let Some(address) = source.address.take() {
                    source.addresses.push(address);
                }
                source.addresses
            }
            None => Vec::new(),
        };

        Ok(TransactionRecord {
            transaction_id: tx.transaction_id,
            status: map_status(&tx.status),
            chain_id: tx.chain_id.unwrap_or_default(),
            token_id: tx.token_id,
            tx_hash: tx.transaction_hash,
            source_addresses,
            destination_address,
            amount,
            memo,
        })
    }
}

impl CoboGateway {
    pub fn new(env: CoboEnv, signer: CoboSigner, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("HTTP client init failed: {:?}", e)))?;
        let api_key = signer.api_key();

        Ok(Self {
            client,
            base_url: env.base_url().to_string(),
            signer,
            api_key,
            timeout,
            last_nonce: Mutex::new(0),
        })
    }

    /// Point at a different API host (staging proxies, local mocks)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Millisecond nonce, strictly increasing across concurrent requests
    fn next_nonce(&self) -> i64 {
        let mut last = self.last_nonce.lock();
        let nonce = Utc::now().timestamp_millis().max(*last + 1);
        *last = nonce;
        nonce
    }

    fn transport_error(&self, error: reqwest::Error) -> GatewayError {
        if error.is_timeout() {
            GatewayError::Timeout(self.timeout.as_millis() as u64)
        } else {
            error.into()
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<T, GatewayError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| GatewayError::Unavailable(format!("invalid gateway URL: {}", e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }

        let query_string = url.query().unwrap_or_default().to_string();
        let body_string = body.map(|b| b.to_string()).unwrap_or_default();
        let nonce = self.next_nonce();
        let signature =
            self.signer
                .sign(method.as_str(), url.path(), nonce, &query_string, &body_string);

        debug!("Cobo {} {}", method, url.path());

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header("BIZ-API-KEY", &self.api_key)
            .header("BIZ-API-NONCE", nonce.to_string())
            .header("BIZ-API-SIGNATURE", signature);
        if !body_string.is_empty() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body_string);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();

        if status.is_success() {
            return response.json::<T>().await.map_err(|e| self.transport_error(e));
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            warn!("Cobo {} {} unavailable ({}): {}", method, url.path(), status, message);
            Err(GatewayError::Unavailable(format!("{}: {}", status, message)))
        } else {
            error!("Cobo {} {} rejected ({}): {}", method, url.path(), status, message);
            Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn find_transaction_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<CoboTransaction>, GatewayError> {
        let page: Page<CoboTransaction> = self
            .send(Method::GET, "/transactions", &[("request_id", request_id)], None)
            .await?;
        Ok(page.data.into_iter().next())
    }
}

#[async_trait]
impl SettlementGateway for CoboGateway {
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn transfer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        let mut body = serde_json::json!({
            "request_id": request.request_id,
            "source": {
                "source_type": "Asset",
                "wallet_id": request.source_wallet_id,
            },
            "token_id": request.token,
            "destination": {
                "destination_type": "Address",
                "account_output": {
                    "address": request.destination_address,
                    "amount": request.amount.normalize().to_string(),
                },
            },
        });
        if let Some(description) = &request.description {
            body["description"] = serde_json::Value::String(description.clone());
        }

        match self
            .send::<CreateTransferResponse>(Method::POST, "/transactions/transfer", &[], Some(body))
            .await
        {
            Ok(created) => Ok(created.transaction_id),
            Err(GatewayError::Rejected { status, message }) => {
                // A reused request id is refused; surface the original transfer instead
                match self.find_transaction_by_request_id(&request.request_id).await? {
                    Some(existing) => {
                        debug!(
                            "Request {} already executed as {}",
                            request.request_id, existing.transaction_id
                        );
                        Ok(existing.transaction_id)
                    }
                    None => Err(GatewayError::Rejected { status, message }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<TransferInfo, GatewayError> {
        let tx: CoboTransaction = self
            .send(Method::GET, &format!("/transactions/{}", transfer_id), &[], None)
            .await?;
        Ok(tx.into())
    }

    async fn find_transfer_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<TransferInfo>, GatewayError> {
        Ok(self
            .find_transaction_by_request_id(request_id)
            .await?
            .map(TransferInfo::from))
    }

    async fn get_max_transferable(
        &self,
        wallet_id: &str,
        token: &str,
        fee_rate: &str,
        from_addr: &str,
        to_addr: &str,
    ) -> Result<Decimal, GatewayError> {
        let value: MaxTransferableValue = self
            .send(
                Method::GET,
                &format!("/wallets/{}/max_transferable_value", wallet_id),
                &[
                    ("token_id", token),
                    ("fee_rate", fee_rate),
                    ("from_address", from_addr),
                    ("to_address", to_addr),
                ],
                None,
            )
            .await?;

        parse_amount(&value.max_transferable_value)
    }

    async fn list_transactions(
        &self,
        tx_hash: &str,
        chain_id: &str,
    ) -> Result<Vec<TransactionRecord>, GatewayError> {
        let page: Page<CoboTransaction> = self
            .send(
                Method::GET,
                "/transactions",
                &[("transaction_hashes", tx_hash), ("chain_ids", chain_id)],
                None,
            )
            .await?;

        page.data.into_iter().map(TransactionRecord::try_from).collect()
    }

    async fn list_token_balances(&self, wallet_id: &str) -> Result<Vec<TokenBalance>, GatewayError> {
        let page: Page<CoboTokenBalance> = self
            .send(Method::GET, &format!("/wallets/{}/tokens", wallet_id), &[], None)
            .await?;

        page.data
            .into_iter()
            .map(|entry| {
                let total = parse_amount(&entry.balance.total)?;
                Ok(TokenBalance {
                    token_id: entry.token_id,
                    total,
                    available: entry
                        .balance
                        .available
                        .as_deref()
                        .map(parse_amount)
                        .transpose()?
                        .unwrap_or(total),
                    pending: entry
                        .balance
                        .pending
                        .as_deref()
                        .map(parse_amount)
                        .transpose()?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn list_wallet_addresses(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletAddress>, GatewayError> {
        let page: Page<CoboAddress> = self
            .send(Method::GET, &format!("/wallets/{}/addresses", wallet_id), &[], None)
            .await?;

        Ok(page
            .data
            .into_iter()
            .map(|a| WalletAddress {
                address: a.address,
                chain_id: a.chain_id,
            })
            .collect())
    }

    async fn create_wallet_address(
        &self,
        wallet_id: &str,
        chain_id: &str,
    ) -> Result<Vec<WalletAddress>, GatewayError> {
        let created: Vec<CoboAddress> = self
            .send(
                Method::POST,
                &format!("/wallets/{}/addresses", wallet_id),
                &[],
                Some(serde_json::json!({ "chain_id": chain_id, "count": 1 })),
            )
            .await?;

        Ok(created
            .into_iter()
            .map(|a| WalletAddress {
                address: a.address,
                chain_id: a.chain_id,
            })
            .collect())
    }

    async fn list_supported_chains(&self) -> Result<Vec<SupportedChain>, GatewayError> {
        let page: Page<CoboChain> = self
            .send(
                Method::GET,
                "/wallets/chains",
                &[("wallet_type", "Custodial"), ("wallet_subtype", "Asset"), ("limit", "50")],
                None,
            )
            .await?;

        Ok(page
            .data
            .into_iter()
            .map(|c| SupportedChain {
                chain_id: c.chain_id,
                symbol: c.symbol,
            })
            .collect())
    }
}
