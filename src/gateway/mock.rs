// Scripted gateway used by order book and reconciliation tests
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Accept,
    Reject,
    Unavailable,
    /// Never answers within any sane timeout
    Hang,
}

struct MockState {
    transfer_mode: TransferMode,
    /// request_id -> transfer_id
    transfers: HashMap<String, String>,
    created: usize,
    transfer_calls: Vec<TransferRequest>,
    statuses: HashMap<String, TransferInfo>,
    /// Errors returned by lookups by transfer id only
    lookup_errors: HashMap<String, GatewayError>,
    deposits: Vec<TransactionRecord>,
    max_transferable: Decimal,
    addresses: Vec<WalletAddress>,
    chains: Vec<SupportedChain>,
}

impl MockState {
    fn status_of(&self, transfer_id: &str) -> TransferInfo {
        self.statuses.get(transfer_id).cloned().unwrap_or_else(|| TransferInfo {
            transfer_id: transfer_id.to_string(),
            status: TransferStatus::Pending,
            tx_hash: None,
            chain_id: None,
        })
    }
}

pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                transfer_mode: TransferMode::Accept,
                transfers: HashMap::new(),
                created: 0,
                transfer_calls: Vec::new(),
                statuses: HashMap::new(),
                lookup_errors: HashMap::new(),
                deposits: Vec::new(),
                max_transferable: Decimal::MAX,
                addresses: Vec::new(),
                chains: vec![
                    SupportedChain {
                        chain_id: "XTN".to_string(),
                        symbol: Some("XTN".to_string()),
                    },
                    SupportedChain {
                        chain_id: "SETH".to_string(),
                        symbol: Some("SETH".to_string()),
                    },
                ],
            }),
        }
    }

    pub fn set_transfer_mode(&self, mode: TransferMode) {
        self.state.lock().transfer_mode = mode;
    }

    pub fn set_max_transferable(&self, max: Decimal) {
        self.state.lock().max_transferable = max;
    }

    pub fn set_transfer_status(&self, transfer_id: &str, status: TransferStatus) {
        self.state.lock().statuses.insert(
            transfer_id.to_string(),
            TransferInfo {
                transfer_id: transfer_id.to_string(),
                status,
                tx_hash: Some(format!("0xsettled-{}", transfer_id)),
                chain_id: None,
            },
        );
    }

    pub fn set_transfer_error(&self, transfer_id: &str, error: GatewayError) {
        self.state
            .lock()
            .lookup_errors
            .insert(transfer_id.to_string(), error);
    }

    /// Drop the request id index, as if the provider lost the transfer
    pub fn forget_request(&self, request_id: &str) {
        self.state.lock().transfers.remove(request_id);
    }

    pub fn add_deposit(&self, record: TransactionRecord) {
        self.state.lock().deposits.push(record);
    }

    pub fn transfer_calls(&self) -> Vec<TransferRequest> {
        self.state.lock().transfer_calls.clone()
    }

    /// Distinct transfers created, one per request id
    pub fn transfer_count(&self) -> usize {
        self.state.lock().created
    }

    pub fn transfer_id_for(&self, request_id: &str) -> Option<String> {
        self.state.lock().transfers.get(request_id).cloned()
    }
}

#[async_trait]
impl SettlementGateway for MockGateway {
    async fn transfer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        let mode = {
            let mut state = self.state.lock();
            state.transfer_calls.push(request.clone());
            state.transfer_mode
        };

        match mode {
            TransferMode::Accept => {
                let mut state = self.state.lock();
                if let Some(id) = state.transfers.get(&request.request_id) {
                    return Ok(id.clone());
                }
                state.created += 1;
                let id = format!("transfer-{}", state.created);
                state.transfers.insert(request.request_id.clone(), id.clone());
                Ok(id)
            }
            TransferMode::Reject => Err(GatewayError::Rejected {
                status: 422,
                message: "insufficient balance".to_string(),
            }),
            TransferMode::Unavailable => {
                Err(GatewayError::Unavailable("connection reset".to_string()))
            }
            TransferMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::Unavailable("hung".to_string()))
            }
        }
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<TransferInfo, GatewayError> {
        let state = self.state.lock();
        if let Some(error) = state.lookup_errors.get(transfer_id) {
            return Err(error.clone());
        }
        Ok(state.status_of(transfer_id))
    }

    async fn find_transfer_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<TransferInfo>, GatewayError> {
        let state = self.state.lock();
        Ok(state
            .transfers
            .get(request_id)
            .map(|transfer_id| state.status_of(transfer_id)))
    }

    async fn get_max_transferable(
        &self,
        _wallet_id: &str,
        _token: &str,
        _fee_rate: &str,
        _from_addr: &str,
        _to_addr: &str,
    ) -> Result<Decimal, GatewayError> {
        Ok(self.state.lock().max_transferable)
    }

    async fn list_transactions(
        &self,
        tx_hash: &str,
        chain_id: &str,
    ) -> Result<Vec<TransactionRecord>, GatewayError> {
        Ok(self
            .state
            .lock()
            .deposits
            .iter()
            .filter(|r| r.tx_hash.as_deref() == Some(tx_hash) && r.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn list_token_balances(&self, _wallet_id: &str) -> Result<Vec<TokenBalance>, GatewayError> {
        Ok(vec![TokenBalance {
            token_id: "SETH".to_string(),
            total: Decimal::new(10, 0),
            available: Decimal::new(10, 0),
            pending: Decimal::ZERO,
        }])
    }

    async fn list_wallet_addresses(
        &self,
        _wallet_id: &str,
    ) -> Result<Vec<WalletAddress>, GatewayError> {
        Ok(self.state.lock().addresses.clone())
    }

    async fn create_wallet_address(
        &self,
        _wallet_id: &str,
        chain_id: &str,
    ) -> Result<Vec<WalletAddress>, GatewayError> {
        let address = WalletAddress {
            address: format!("0x{:040x}", self.state.lock().addresses.len() + 1),
            chain_id: chain_id.to_string(),
        };
        self.state.lock().addresses.push(address.clone());
        Ok(vec![address])
    }

    async fn list_supported_chains(&self) -> Result<Vec<SupportedChain>, GatewayError> {
        Ok(self.state.lock().chains.clone())
    }
}
