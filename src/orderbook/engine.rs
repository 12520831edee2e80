use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult, GatewayError, OrderBookError};
use crate::gateway::{
    with_timeout, SettlementGateway, TokenBalance, TransferInfo, TransferRequest, TransferStatus,
    WalletAddress,
};
use crate::ledger::models::*;
use crate::ledger::store::LedgerStore;
use crate::orderbook::address::validate_address;
use crate::orderbook::memo::DepositMemo;

/// Order book configuration
#[derive(Debug, Clone)]
pub struct OrderBookConfig {
    /// Custodial wallet paying out maker liquidity
    pub custodial_wallet_id: String,
    /// Fee rate passed to the max-transferable inquiry
    pub fee_rate: String,
    /// Upper bound for every gateway call
    pub gateway_timeout: Duration,
    /// Reservation attempts after an optimistic-concurrency conflict
    pub max_conflict_retries: u32,
    /// Confirm deposits against the gateway's transaction search
    pub verify_deposits: bool,
    /// Check payouts against the wallet's max transferable value
    pub check_max_transferable: bool,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            custodial_wallet_id: String::new(),
            fee_rate: "0".to_string(),
            gateway_timeout: Duration::from_secs(10),
            max_conflict_retries: 5,
            verify_deposits: true,
            check_max_transferable: true,
        }
    }
}

/// Order book core - maker liquidity, taker fills and reservation lifecycle
///
/// Holds no order state of its own: every operation re-reads through the
/// ledger store and mutates it with conditional, atomic updates.
pub struct OrderBook {
    config: OrderBookConfig,
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn SettlementGateway>,
}

fn backoff(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..25u64);
    Duration::from_millis(10 * 2u64.pow(attempt.min(6)) + jitter)
}

fn invalid(message: impl Into<String>) -> AppError {
    OrderBookError::InvalidOrderSpec(message.into()).into()
}

impl OrderBook {
    pub fn new(
        config: OrderBookConfig,
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn SettlementGateway>,
    ) -> Self {
        Self {
            config,
            ledger,
            gateway,
        }
    }

    pub fn config(&self) -> &OrderBookConfig {
        &self.config
    }

    // ========== MAKER ORDERS ==========

    /// Post maker liquidity with its full capacity unfulfilled
    #[instrument(skip(self, spec), fields(order_id = %spec.order_id))]
    pub async fn place_maker_order(&self, spec: NewMakerOrder) -> AppResult<MakerOrder> {
        spec.validate().map_err(|e| invalid(format!("Validation failed: {}", e)))?;

        if spec.amount <= Decimal::ZERO {
            return Err(invalid("amount must be positive"));
        }
        if spec.price <= Decimal::ZERO {
            return Err(invalid("price must be positive"));
        }
        if !fits_amount_column(spec.amount) || !fits_amount_column(spec.price) {
            return Err(invalid(format!(
                "amount and price allow at most {} decimal places and 12 integer digits",
                AMOUNT_SCALE
            )));
        }
        if spec.expired_at <= Utc::now() {
            return Err(invalid("expiry must be in the future"));
        }
        if spec.source_chain.eq_ignore_ascii_case(&spec.target_chain) {
            return Err(invalid("source and target chain must differ"));
        }
        validate_address(&spec.source_chain, &spec.maker_source_addr)?;
        validate_address(&spec.target_chain, &spec.maker_target_addr)?;

        let maker = self.ledger.create_maker_order(&spec).await?;
        info!(
            "✅ Maker order {} placed: {} {} on {} at {} (expires {})",
            maker.order_id, maker.amount, maker.token, maker.target_chain, maker.price, maker.expired_at
        );
        Ok(maker)
    }

    async fn load_maker(&self, order_id: &str) -> AppResult<MakerOrder> {
        self.ledger
            .get_maker_order(order_id)
            .await?
            .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()).into())
    }

    async fn load_taker(&self, order_id: &str) -> AppResult<TakerOrder> {
        self.ledger
            .get_taker_order(order_id)
            .await?
            .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()).into())
    }

    fn ensure_open(maker: &MakerOrder) -> AppResult<()> {
        if maker.is_expired() {
            return Err(OrderBookError::OrderExpired {
                order_id: maker.order_id.clone(),
                available: maker.available(),
            }
            .into());
        }
        Ok(())
    }

    fn ensure_capacity(maker: &MakerOrder, payout: Decimal) -> AppResult<()> {
        if payout > maker.available() {
            return Err(OrderBookError::InsufficientCapacity {
                required: payout,
                available: maker.available(),
            }
            .into());
        }
        Ok(())
    }

    // ========== TAKER FILLS ==========

    /// Fill against a maker order with an observed taker deposit.
    ///
    /// Returns the taker order in SETTLING once the payout transfer has been
    /// requested. A deposit hash that already has an order returns that order
    /// untouched, so duplicate detection events never pay twice.
    #[instrument(skip(self, deposit), fields(tx_hash = %deposit.tx_hash))]
    pub async fn submit_taker_fill(
        &self,
        maker_order_id: &str,
        deposit: TakerDeposit,
    ) -> AppResult<TakerOrder> {
        if deposit.tx_hash.trim().is_empty() {
            return Err(invalid("deposit tx hash is required"));
        }
        if deposit.amount <= Decimal::ZERO {
            return Err(invalid("deposit amount must be positive"));
        }
        if !fits_amount_column(deposit.amount) {
            return Err(invalid(format!(
                "deposit amount {} exceeds {} decimal places or 12 integer digits",
                deposit.amount, AMOUNT_SCALE
            )));
        }

        if let Some(existing) = self
            .ledger
            .find_taker_order_by_deposit_hash(&deposit.tx_hash)
            .await?
        {
            info!(
                "Deposit {} already filled as taker order {} ({})",
                deposit.tx_hash, existing.order_id, existing.status
            );
            return Ok(existing);
        }

        let mut maker = self.load_maker(maker_order_id).await?;
        Self::ensure_open(&maker)?;

        if !deposit.source_chain.eq_ignore_ascii_case(&maker.source_chain) {
            return Err(invalid(format!(
                "deposit on {} does not match maker source chain {}",
                deposit.source_chain, maker.source_chain
            )));
        }
        validate_address(&maker.source_chain, &deposit.taker_source_addr)?;
        let target_addr = Self::resolve_target_address(&maker, &deposit)?;

        let payout = maker
            .payout_for(deposit.amount)
            .ok_or_else(|| invalid("payout overflows"))?;
        if payout <= Decimal::ZERO {
            return Err(invalid("deposit too small to produce a payout"));
        }
        Self::ensure_capacity(&maker, payout)?;

        let taker_tx_id = if self.config.verify_deposits {
            self.verify_deposit(&maker, &deposit).await?
        } else {
            deposit.tx_id.clone().unwrap_or_else(|| deposit.tx_hash.clone())
        };

        if self.config.check_max_transferable {
            self.check_transferable(&maker, &target_addr, payout).await?;
        }

        let new_order = NewTakerOrder {
            order_id: Uuid::new_v4().to_string(),
            maker_order_id: maker.order_id.clone(),
            taker_tx_id,
            request_id: Uuid::new_v4().to_string(),
            taker_source_addr: deposit.taker_source_addr.clone(),
            taker_target_addr: target_addr,
            token: deposit.token.clone(),
            taker_tx_hash: deposit.tx_hash.clone(),
            amount: deposit.amount,
            payout,
            status: TakerOrderStatus::Reserved,
        };

        let mut attempt = 0;
        let reserved = loop {
            match self.ledger.reserve_fill(maker.version, new_order.clone()).await {
                Ok(ReserveOutcome::Reserved { taker, maker }) => {
                    info!(
                        "📊 Reserved {} of maker {} for taker order {} (available now {})",
                        payout, maker.order_id, taker.order_id, maker.available()
                    );
                    break taker;
                }
                Ok(ReserveOutcome::Duplicate(existing)) => {
                    info!(
                        "Deposit {} raced to taker order {}",
                        deposit.tx_hash, existing.order_id
                    );
                    return Ok(existing);
                }
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!("Reservation conflict on {}, retry {}", maker.order_id, attempt);
                    tokio::time::sleep(backoff(attempt)).await;

                    maker = self.load_maker(maker_order_id).await?;
                    Self::ensure_open(&maker)?;
                    Self::ensure_capacity(&maker, payout)?;
                }
                Err(e) => return Err(e),
            }
        };

        self.start_settlement(reserved, &maker).await
    }

    fn resolve_target_address(maker: &MakerOrder, deposit: &TakerDeposit) -> AppResult<String> {
        let address = match (&deposit.target_addr, &deposit.memo) {
            (Some(address), _) => address.clone(),
            (None, Some(raw)) => {
                let memo = DepositMemo::decode(raw)?;
                if !memo.chain.eq_ignore_ascii_case(&maker.target_chain) {
                    return Err(invalid(format!(
                        "memo requests payout on {}, maker pays on {}",
                        memo.chain, maker.target_chain
                    )));
                }
                memo.address
            }
            (None, None) => return Err(invalid("deposit carries no payout address")),
        };

        validate_address(&maker.target_chain, &address)?;
        Ok(address)
    }

    /// Confirm the deposit landed on the maker's source address.
    /// Returns the gateway transaction id.
    async fn verify_deposit(&self, maker: &MakerOrder, deposit: &TakerDeposit) -> AppResult<String> {
        let records = with_timeout(
            self.config.gateway_timeout,
            self.gateway.list_transactions(&deposit.tx_hash, &maker.source_chain),
        )
        .await
        .map_err(|e| {
            warn!("Deposit lookup for {} failed: {}", deposit.tx_hash, e);
            OrderBookError::from(e)
        })?;

        let record = records
            .into_iter()
            .find(|r| {
                r.destination_address
                    .as_deref()
                    .map(|a| a.eq_ignore_ascii_case(&maker.maker_source_addr))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                OrderBookError::DepositUnverified(format!(
                    "no transfer {} to {} on {}",
                    deposit.tx_hash, maker.maker_source_addr, maker.source_chain
                ))
            })?;

        let token_matches = record
            .token_id
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case(&deposit.token))
            .unwrap_or(false);
        if !token_matches {
            return Err(OrderBookError::DepositUnverified(format!(
                "deposit {} carried {}, claimed {}",
                deposit.tx_hash,
                record.token_id.as_deref().unwrap_or("unknown token"),
                deposit.token
            ))
            .into());
        }
        if record.status != TransferStatus::Confirmed {
            return Err(OrderBookError::DepositUnverified(format!(
                "deposit {} is {:?}",
                deposit.tx_hash, record.status
            ))
            .into());
        }
        if record.amount < deposit.amount {
            return Err(OrderBookError::DepositUnverified(format!(
                "deposit {} carried {}, claimed {}",
                deposit.tx_hash, record.amount, deposit.amount
            ))
            .into());
        }

        Ok(deposit.tx_id.clone().unwrap_or(record.transaction_id))
    }

    async fn check_transferable(
        &self,
        maker: &MakerOrder,
        target_addr: &str,
        payout: Decimal,
    ) -> AppResult<()> {
        let max = with_timeout(
            self.config.gateway_timeout,
            self.gateway.get_max_transferable(
                &self.config.custodial_wallet_id,
                &maker.token,
                &self.config.fee_rate,
                &maker.maker_target_addr,
                target_addr,
            ),
        )
        .await
        .map_err(OrderBookError::from)?;

        if payout > max {
            warn!(
                "⚠️  Payout {} {} exceeds transferable {} from wallet {}",
                payout, maker.token, max, self.config.custodial_wallet_id
            );
            return Err(OrderBookError::InsufficientCapacity {
                required: payout,
                available: max.min(maker.available()),
            }
            .into());
        }
        Ok(())
    }

    /// RESERVED → SETTLING, then request the payout
    async fn start_settlement(&self, taker: TakerOrder, maker: &MakerOrder) -> AppResult<TakerOrder> {
        let settling = match self
            .ledger
            .update_taker_order_status(
                &taker.order_id,
                TakerOrderStatus::Reserved,
                TakerOrderStatus::Settling,
                TakerOrderUpdate::default(),
            )
            .await
        {
            Ok(order) => order,
            Err(e) if e.is_conflict() => {
                // Another worker resumed or resolved it; it owns the transfer
                debug!("Taker order {} already moved past RESERVED", taker.order_id);
                return self.load_taker(&taker.order_id).await;
            }
            Err(e) => return Err(e),
        };

        self.issue_transfer(settling, maker).await
    }

    /// Request the payout for a SETTLING order using its persisted request id.
    ///
    /// Rejection releases the reservation. An unreachable gateway leaves the
    /// order SETTLING for reconciliation.
    async fn issue_transfer(&self, taker: TakerOrder, maker: &MakerOrder) -> AppResult<TakerOrder> {
        let request = TransferRequest {
            request_id: taker.request_id.clone(),
            source_wallet_id: self.config.custodial_wallet_id.clone(),
            token: maker.token.clone(),
            amount: taker.payout,
            destination_address: taker.taker_target_addr.clone(),
            description: Some(format!(
                "OTC fill {} against maker order {}",
                taker.order_id, maker.order_id
            )),
        };

        match with_timeout(self.config.gateway_timeout, self.gateway.transfer(&request)).await {
            Ok(transfer_id) => {
                match self.ledger.attach_transfer_id(&taker.order_id, &transfer_id).await {
                    Ok(order) => {
                        info!(
                            "🔄 Payout {} {} for taker order {} submitted as {}",
                            taker.payout, maker.token, taker.order_id, transfer_id
                        );
                        Ok(order)
                    }
                    Err(e) if e.is_conflict() => self.load_taker(&taker.order_id).await,
                    Err(e) => Err(e),
                }
            }
            Err(GatewayError::Rejected { status, message }) => {
                warn!(
                    "❌ Payout for taker order {} rejected ({}): {}",
                    taker.order_id, status, message
                );
                self.resolve(
                    &taker.order_id,
                    &[TakerOrderStatus::Settling],
                    TakerOrderStatus::Failed,
                    TakerOrderUpdate::failed(format!("transfer rejected: {}", message)),
                )
                .await?;
                Err(OrderBookError::GatewayRejected(format!("{}: {}", status, message)).into())
            }
            Err(e) => {
                warn!(
                    "⚠️  Payout for taker order {} has unknown outcome ({}), deferring to reconciliation",
                    taker.order_id, e
                );
                Ok(taker)
            }
        }
    }

    // ========== RESERVATION LIFECYCLE ==========

    /// Move a taker order in one of the `from` states to a terminal state,
    /// releasing its reservation.
    ///
    /// Returns the order and whether this call applied the transition. Orders
    /// in any other state are returned untouched.
    async fn resolve(
        &self,
        taker_order_id: &str,
        from: &[TakerOrderStatus],
        to: TakerOrderStatus,
        update: TakerOrderUpdate,
    ) -> AppResult<(TakerOrder, bool)> {
        let mut attempt = 0;
        loop {
            let current = self.load_taker(taker_order_id).await?;
            if current.status.is_terminal() || !from.contains(&current.status) {
                return Ok((current, false));
            }
            TakerOrderStatus::validate_transition(current.status, to)?;

            let result = if current.status.holds_reservation() {
                self.ledger
                    .resolve_reservation(taker_order_id, current.status, to, update.clone())
                    .await
                    .map(|(taker, maker)| {
                        info!(
                            "Taker order {} {} -> {}; maker {} pending {} fulfilled {}",
                            taker_order_id, current.status, to, maker.order_id,
                            maker.pending_fulfill, maker.fulfilled
                        );
                        taker
                    })
            } else {
                self.ledger
                    .update_taker_order_status(taker_order_id, current.status, to, update.clone())
                    .await
            };

            match result {
                Ok(order) => return Ok((order, true)),
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Give back a taker order's reserved capacity and mark it FAILED.
    /// A no-op for orders that are already FULFILLED, FAILED or EXPIRED.
    #[instrument(skip(self))]
    pub async fn release_reservation(&self, taker_order_id: &str) -> AppResult<TakerOrder> {
        let (order, _) = self
            .release_with_reason(taker_order_id, "reservation released")
            .await?;
        Ok(order)
    }

    /// Release with a recorded reason. The flag is false when the order was
    /// already terminal.
    pub async fn release_with_reason(
        &self,
        taker_order_id: &str,
        reason: &str,
    ) -> AppResult<(TakerOrder, bool)> {
        let (order, applied) = self
            .resolve(
                taker_order_id,
                &[
                    TakerOrderStatus::Pending,
                    TakerOrderStatus::Reserved,
                    TakerOrderStatus::Settling,
                ],
                TakerOrderStatus::Failed,
                TakerOrderUpdate::failed(reason),
            )
            .await?;
        if !applied {
            debug!(
                "Release of {} skipped, already {}",
                taker_order_id, order.status
            );
        }
        Ok((order, applied))
    }

    /// Expire a reservation whose maker window elapsed before settlement began
    pub async fn expire_reservation(&self, taker_order_id: &str) -> AppResult<TakerOrder> {
        let (order, _) = self
            .resolve(
                taker_order_id,
                &[TakerOrderStatus::Reserved, TakerOrderStatus::Settling],
                TakerOrderStatus::Expired,
                TakerOrderUpdate::failed("maker order expired"),
            )
            .await?;
        Ok(order)
    }

    /// Expire only if no payout was ever requested (still RESERVED)
    pub async fn expire_unsettled(&self, taker_order_id: &str) -> AppResult<(TakerOrder, bool)> {
        self.resolve(
            taker_order_id,
            &[TakerOrderStatus::Reserved],
            TakerOrderStatus::Expired,
            TakerOrderUpdate::failed("maker order expired before settlement"),
        )
        .await
    }

    /// Record a confirmed payout: pending capacity becomes fulfilled
    pub async fn confirm_settlement(
        &self,
        taker_order_id: &str,
        settlement_tx_hash: Option<String>,
    ) -> AppResult<(TakerOrder, bool)> {
        self.resolve(
            taker_order_id,
            &[TakerOrderStatus::Settling],
            TakerOrderStatus::Fulfilled,
            TakerOrderUpdate::settled(settlement_tx_hash),
        )
        .await
    }

    /// Pick up a RESERVED order whose payout was never requested
    pub async fn resume_reservation(&self, taker_order_id: &str) -> AppResult<TakerOrder> {
        let taker = self.load_taker(taker_order_id).await?;
        if taker.status != TakerOrderStatus::Reserved {
            return Ok(taker);
        }
        let maker = self.load_maker(&taker.maker_order_id).await?;
        info!("Resuming settlement of taker order {}", taker.order_id);
        self.start_settlement(taker, &maker).await
    }

    /// Re-send the payout of a SETTLING order that has no transfer id yet
    pub async fn retry_transfer(&self, taker_order_id: &str) -> AppResult<TakerOrder> {
        let taker = self.load_taker(taker_order_id).await?;
        if taker.status != TakerOrderStatus::Settling || taker.cobo_id.is_some() {
            return Ok(taker);
        }
        let maker = self.load_maker(&taker.maker_order_id).await?;
        self.issue_transfer(taker, &maker).await
    }

    /// Query the gateway for a payout transfer, bounded by the gateway timeout
    pub async fn lookup_transfer(&self, transfer_id: &str) -> Result<TransferInfo, GatewayError> {
        with_timeout(
            self.config.gateway_timeout,
            self.gateway.get_transfer(transfer_id),
        )
        .await
    }

    /// Query the gateway for a payout by the request id it was submitted with
    pub async fn lookup_transfer_by_request(
        &self,
        request_id: &str,
    ) -> Result<Option<TransferInfo>, GatewayError> {
        with_timeout(
            self.config.gateway_timeout,
            self.gateway.find_transfer_by_request_id(request_id),
        )
        .await
    }

    // ========== INQUIRY ==========

    pub async fn get_order_status(&self, taker_order_id: &str) -> AppResult<OrderStatusView> {
        let taker = self.load_taker(taker_order_id).await?;
        let maker = self.load_maker(&taker.maker_order_id).await?;

        Ok(OrderStatusView {
            maker_order_id: maker.order_id.clone(),
            maker_available: maker.available(),
            maker_pending_fulfill: maker.pending_fulfill,
            maker_fulfilled: maker.fulfilled,
            maker_expired: maker.is_expired(),
            taker_order: taker,
        })
    }

    pub async fn get_maker_order(&self, order_id: &str) -> AppResult<MakerOrder> {
        self.load_maker(order_id).await
    }

    /// Balances held by the custodial payout wallet
    pub async fn custody_balances(&self) -> AppResult<Vec<TokenBalance>> {
        let balances = with_timeout(
            self.config.gateway_timeout,
            self.gateway.list_token_balances(&self.config.custodial_wallet_id),
        )
        .await?;
        Ok(balances)
    }

    /// A custodial deposit address on `chain_id`, created when none exists
    pub async fn ensure_deposit_address(&self, chain_id: &str) -> AppResult<WalletAddress> {
        let wallet_id = &self.config.custodial_wallet_id;
        let existing = with_timeout(
            self.config.gateway_timeout,
            self.gateway.list_wallet_addresses(wallet_id),
        )
        .await?;
        if let Some(address) = existing
            .into_iter()
            .find(|a| a.chain_id.eq_ignore_ascii_case(chain_id))
        {
            return Ok(address);
        }

        let supported = with_timeout(
            self.config.gateway_timeout,
            self.gateway.list_supported_chains(),
        )
        .await?;
        if !supported.iter().any(|c| c.chain_id.eq_ignore_ascii_case(chain_id)) {
            return Err(invalid(format!("chain {} not supported by custodian", chain_id)));
        }

        let created = with_timeout(
            self.config.gateway_timeout,
            self.gateway.create_wallet_address(wallet_id, chain_id),
        )
        .await?;
        let address = created.into_iter().next().ok_or_else(|| {
            AppError::from(OrderBookError::GatewayUnavailable(format!(
                "custodian returned no address for {}",
                chain_id
            )))
        })?;
        info!("✅ Created deposit address {} on {}", address.address, chain_id);
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockGateway, TransferMode};
    use crate::gateway::TransactionRecord;
    use crate::ledger::InMemoryLedger;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    const MAKER_SOURCE: &str = "tb1ptv20dlft894l08d749lyyq8wsh8vykdxqj9eqgu98vptrj46julqy77clx";
    const MAKER_TARGET: &str = "0xb4fc7496883cee8d9c785d06953b4873d58066f2";
    const TAKER_SOURCE: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
    const TAKER_TARGET: &str = "0x2e4b14254ce56d195922cf1f4c7e97745ee90005";

    struct Harness {
        book: Arc<OrderBook>,
        ledger: Arc<InMemoryLedger>,
        gateway: Arc<MockGateway>,
    }

    fn harness_with(config: OrderBookConfig) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(MockGateway::new());
        let book = Arc::new(OrderBook::new(config, ledger.clone(), gateway.clone()));
        Harness {
            book,
            ledger,
            gateway,
        }
    }

    fn harness() -> Harness {
        harness_with(OrderBookConfig {
            custodial_wallet_id: "wallet-1".to_string(),
            verify_deposits: false,
            max_conflict_retries: 50,
            ..Default::default()
        })
    }

    fn maker_spec(order_id: &str, amount: Decimal) -> NewMakerOrder {
        NewMakerOrder {
            order_id: order_id.to_string(),
            cobo_id: None,
            source_chain: "XTN".to_string(),
            maker_source_addr: MAKER_SOURCE.to_string(),
            target_chain: "SETH".to_string(),
            maker_target_addr: MAKER_TARGET.to_string(),
            token: "SETH".to_string(),
            price: dec!(1),
            maker_tx_hash: format!("0xmaker-{}", order_id),
            amount,
            expired_at: Utc::now() + ChronoDuration::hours(1),
        }
    }

    fn deposit(tx_hash: &str, amount: Decimal) -> TakerDeposit {
        TakerDeposit {
            source_chain: "XTN".to_string(),
            taker_source_addr: TAKER_SOURCE.to_string(),
            token: "XTN".to_string(),
            amount,
            tx_hash: tx_hash.to_string(),
            tx_id: None,
            target_addr: Some(TAKER_TARGET.to_string()),
            memo: None,
        }
    }

    fn book_error(result: AppResult<impl std::fmt::Debug>) -> OrderBookError {
        result
            .unwrap_err()
            .order_book()
            .cloned()
            .expect("order book error")
    }

    async fn maker(h: &Harness, amount: Decimal) -> MakerOrder {
        h.book.place_maker_order(maker_spec("m-1", amount)).await.unwrap()
    }

    #[tokio::test]
    async fn test_fill_reserves_and_requests_payout() {
        let h = harness();
        maker(&h, dec!(10)).await;

        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();
        assert_eq!(order.status, TakerOrderStatus::Settling);
        assert_eq!(order.payout, dec!(4));
        assert!(order.cobo_id.is_some());

        let calls = h.gateway.transfer_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].amount, dec!(4));
        assert_eq!(calls[0].destination_address, TAKER_TARGET);
        assert_eq!(calls[0].request_id, order.request_id);

        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, dec!(4));
        assert_eq!(maker.available(), dec!(6));
    }

    #[tokio::test]
    async fn test_payout_uses_price() {
        let h = harness();
        let mut spec = maker_spec("m-1", dec!(10));
        spec.price = dec!(2.5);
        h.book.place_maker_order(spec).await.unwrap();

        let order = h
            .book
            .submit_taker_fill("m-1", deposit("0xd1", dec!(0.123456789)))
            .await
            .unwrap();
        // Truncated to 8 places
        assert_eq!(order.payout, dec!(0.30864197));
    }

    #[tokio::test]
    async fn test_duplicate_deposit_is_idempotent() {
        let h = harness();
        maker(&h, dec!(10)).await;

        let first = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();
        let second = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(h.gateway.transfer_count(), 1);
        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, dec!(4));
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_deposits_pay_once() {
        let h = harness();
        maker(&h, dec!(10)).await;

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let book = h.book.clone();
                tokio::spawn(async move { book.submit_taker_fill("m-1", deposit("0xd1", dec!(3))).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().order_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, dec!(3));
    }

    #[tokio::test]
    async fn test_fill_beyond_capacity_rejected() {
        let h = harness();
        maker(&h, dec!(10)).await;

        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(11))).await);
        assert_eq!(
            err,
            OrderBookError::InsufficientCapacity {
                required: dec!(11),
                available: dec!(10)
            }
        );
        assert!(h.ledger.find_taker_order_by_deposit_hash("0xd1").await.unwrap().is_none());
        assert!(h.gateway.transfer_calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fills_never_oversubscribe() {
        let h = harness();
        maker(&h, dec!(10)).await;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let book = h.book.clone();
                tokio::spawn(async move {
                    book.submit_taker_fill("m-1", deposit(&format!("0xd{}", i), dec!(2))).await
                })
            })
            .collect();

        let mut filled = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(order) => {
                    assert_eq!(order.status, TakerOrderStatus::Settling);
                    filled += 1;
                }
                Err(e) => {
                    assert_eq!(e.code(), "INSUFFICIENT_CAPACITY");
                    refused += 1;
                }
            }
        }

        assert_eq!(filled, 5);
        assert_eq!(refused, 3);
        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, dec!(10));
        assert!(maker.holds_invariants());
    }

    #[tokio::test]
    async fn test_expired_maker_reports_remaining_capacity() {
        let h = harness();
        let mut spec = maker_spec("m-1", dec!(10));
        spec.expired_at = Utc::now() - ChronoDuration::seconds(1);
        h.ledger.create_maker_order(&spec).await.unwrap();

        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(1))).await);
        assert_eq!(
            err,
            OrderBookError::OrderExpired {
                order_id: "m-1".to_string(),
                available: dec!(10)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_maker() {
        let h = harness();
        let err = book_error(h.book.submit_taker_fill("nope", deposit("0xd1", dec!(1))).await);
        assert_eq!(err, OrderBookError::OrderNotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_transfer_releases_reservation() {
        let h = harness();
        maker(&h, dec!(10)).await;
        h.gateway.set_transfer_mode(TransferMode::Reject);

        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await);
        assert_eq!(err.code(), "GATEWAY_REJECTED");

        let order = h
            .ledger
            .find_taker_order_by_deposit_hash("0xd1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, TakerOrderStatus::Failed);
        assert!(order.failure_reason.is_some());

        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, Decimal::ZERO);
        assert_eq!(maker.available(), dec!(10));
    }

    #[tokio::test]
    async fn test_unavailable_gateway_keeps_reservation() {
        let h = harness();
        maker(&h, dec!(10)).await;
        h.gateway.set_transfer_mode(TransferMode::Unavailable);

        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();
        assert_eq!(order.status, TakerOrderStatus::Settling);
        assert!(order.cobo_id.is_none());
        assert_eq!(h.book.get_maker_order("m-1").await.unwrap().pending_fulfill, dec!(4));

        h.gateway.set_transfer_mode(TransferMode::Accept);
        let retried = h.book.retry_transfer(&order.order_id).await.unwrap();
        assert!(retried.cobo_id.is_some());

        let calls = h.gateway.transfer_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].request_id, calls[1].request_id);
    }

    #[tokio::test]
    async fn test_transfer_timeout_is_unknown_outcome() {
        let h = harness_with(OrderBookConfig {
            custodial_wallet_id: "wallet-1".to_string(),
            verify_deposits: false,
            gateway_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        maker(&h, dec!(10)).await;
        h.gateway.set_transfer_mode(TransferMode::Hang);

        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();
        assert_eq!(order.status, TakerOrderStatus::Settling);
        assert!(order.cobo_id.is_none());
    }

    #[tokio::test]
    async fn test_confirm_then_release_is_noop() {
        let h = harness();
        maker(&h, dec!(10)).await;
        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();

        let (settled, applied) = h
            .book
            .confirm_settlement(&order.order_id, Some("0xpaid".to_string()))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(settled.status, TakerOrderStatus::Fulfilled);
        assert_eq!(settled.settlement_tx_hash.as_deref(), Some("0xpaid"));

        let released = h.book.release_reservation(&order.order_id).await.unwrap();
        assert_eq!(released.status, TakerOrderStatus::Fulfilled);

        let (_, applied) = h.book.confirm_settlement(&order.order_id, None).await.unwrap();
        assert!(!applied);

        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, Decimal::ZERO);
        assert_eq!(maker.fulfilled, dec!(4));
    }

    async fn reserve_directly(h: &Harness, tx_hash: &str, payout: Decimal) -> TakerOrder {
        let maker = h.book.get_maker_order("m-1").await.unwrap();
        let outcome = h
            .ledger
            .reserve_fill(
                maker.version,
                NewTakerOrder {
                    order_id: format!("t-{}", tx_hash),
                    maker_order_id: "m-1".to_string(),
                    taker_tx_id: tx_hash.to_string(),
                    request_id: format!("req-{}", tx_hash),
                    taker_source_addr: TAKER_SOURCE.to_string(),
                    taker_target_addr: TAKER_TARGET.to_string(),
                    token: "XTN".to_string(),
                    taker_tx_hash: tx_hash.to_string(),
                    amount: payout,
                    payout,
                    status: TakerOrderStatus::Reserved,
                },
            )
            .await
            .unwrap();
        match outcome {
            ReserveOutcome::Reserved { taker, .. } => taker,
            ReserveOutcome::Duplicate(_) => panic!("unexpected duplicate"),
        }
    }

    #[tokio::test]
    async fn test_expire_and_release_reserved() {
        let h = harness();
        maker(&h, dec!(10)).await;
        let a = reserve_directly(&h, "0xa", dec!(3)).await;
        let b = reserve_directly(&h, "0xb", dec!(2)).await;
        assert_eq!(h.book.get_maker_order("m-1").await.unwrap().pending_fulfill, dec!(5));

        let expired = h.book.expire_reservation(&a.order_id).await.unwrap();
        assert_eq!(expired.status, TakerOrderStatus::Expired);

        let released = h.book.release_reservation(&b.order_id).await.unwrap();
        assert_eq!(released.status, TakerOrderStatus::Failed);

        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.pending_fulfill, Decimal::ZERO);
        assert_eq!(maker.fulfilled, Decimal::ZERO);

        // Releasing twice changes nothing
        let again = h.book.release_reservation(&b.order_id).await.unwrap();
        assert_eq!(again.status, TakerOrderStatus::Failed);
        assert_eq!(h.book.get_maker_order("m-1").await.unwrap().available(), dec!(10));
    }

    #[tokio::test]
    async fn test_expire_unsettled_leaves_settling_alone() {
        let h = harness();
        maker(&h, dec!(10)).await;
        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();

        let (current, applied) = h.book.expire_unsettled(&order.order_id).await.unwrap();
        assert!(!applied);
        assert_eq!(current.status, TakerOrderStatus::Settling);
        assert_eq!(h.book.get_maker_order("m-1").await.unwrap().pending_fulfill, dec!(4));
    }

    #[tokio::test]
    async fn test_resume_reserved_order() {
        let h = harness();
        maker(&h, dec!(10)).await;
        let reserved = reserve_directly(&h, "0xa", dec!(3)).await;

        let resumed = h.book.resume_reservation(&reserved.order_id).await.unwrap();
        assert_eq!(resumed.status, TakerOrderStatus::Settling);
        assert_eq!(
            resumed.cobo_id,
            h.gateway.transfer_id_for(&reserved.request_id)
        );

        // Already settling: nothing re-sent
        h.book.resume_reservation(&reserved.order_id).await.unwrap();
        assert_eq!(h.gateway.transfer_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_payout_address_from_memo() {
        let h = harness();
        maker(&h, dec!(10)).await;

        let mut from_memo = deposit("0xd1", dec!(1));
        from_memo.target_addr = None;
        from_memo.memo = Some(format!(":SETH.SETH:{}", TAKER_TARGET));
        let order = h.book.submit_taker_fill("m-1", from_memo).await.unwrap();
        assert_eq!(order.taker_target_addr, TAKER_TARGET);

        let mut wrong_chain = deposit("0xd2", dec!(1));
        wrong_chain.target_addr = None;
        wrong_chain.memo = Some(format!(":ETH.ETH:{}", TAKER_TARGET));
        let err = book_error(h.book.submit_taker_fill("m-1", wrong_chain).await);
        assert_eq!(err.code(), "INVALID_ORDER_SPEC");

        let mut no_address = deposit("0xd3", dec!(1));
        no_address.target_addr = None;
        let err = book_error(h.book.submit_taker_fill("m-1", no_address).await);
        assert_eq!(err.code(), "INVALID_ORDER_SPEC");
    }

    #[tokio::test]
    async fn test_deposit_verification() {
        let h = harness_with(OrderBookConfig {
            custodial_wallet_id: "wallet-1".to_string(),
            verify_deposits: true,
            ..Default::default()
        });
        maker(&h, dec!(10)).await;

        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(2))).await);
        assert_eq!(err.code(), "DEPOSIT_UNVERIFIED");

        h.gateway.add_deposit(TransactionRecord {
            transaction_id: "tx-77".to_string(),
            status: TransferStatus::Confirmed,
            chain_id: "XTN".to_string(),
            token_id: Some("XTN".to_string()),
            tx_hash: Some("0xd1".to_string()),
            source_addresses: vec![TAKER_SOURCE.to_string()],
            destination_address: Some(MAKER_SOURCE.to_string()),
            amount: dec!(2),
            memo: None,
        });
        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(2))).await.unwrap();
        assert_eq!(order.taker_tx_id, "tx-77");

        // Claiming more than arrived
        h.gateway.add_deposit(TransactionRecord {
            transaction_id: "tx-78".to_string(),
            status: TransferStatus::Confirmed,
            chain_id: "XTN".to_string(),
            token_id: Some("XTN".to_string()),
            tx_hash: Some("0xd2".to_string()),
            source_addresses: vec![],
            destination_address: Some(MAKER_SOURCE.to_string()),
            amount: dec!(1),
            memo: None,
        });
        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd2", dec!(2))).await);
        assert_eq!(err.code(), "DEPOSIT_UNVERIFIED");

        // Right address and amount, different token
        h.gateway.add_deposit(TransactionRecord {
            transaction_id: "tx-79".to_string(),
            status: TransferStatus::Confirmed,
            chain_id: "XTN".to_string(),
            token_id: Some("XTN_USDT".to_string()),
            tx_hash: Some("0xd3".to_string()),
            source_addresses: vec![TAKER_SOURCE.to_string()],
            destination_address: Some(MAKER_SOURCE.to_string()),
            amount: dec!(2),
            memo: None,
        });
        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd3", dec!(2))).await);
        assert_eq!(err.code(), "DEPOSIT_UNVERIFIED");
        assert!(h
            .ledger
            .find_taker_order_by_deposit_hash("0xd3")
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.book.get_maker_order("m-1").await.unwrap().pending_fulfill, dec!(2));
    }

    #[tokio::test]
    async fn test_deposit_amount_must_fit_ledger_columns() {
        let h = harness_with(OrderBookConfig {
            custodial_wallet_id: "wallet-1".to_string(),
            verify_deposits: true,
            ..Default::default()
        });
        h.book
            .place_maker_order(NewMakerOrder {
                price: dec!(2),
                ..maker_spec("m-1", dec!(10))
            })
            .await
            .unwrap();

        for amount in [Decimal::MAX, dec!(1000000000000), dec!(1.000000001)] {
            let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd1", amount)).await);
            assert_eq!(err.code(), "INVALID_ORDER_SPEC");
        }

        let maker = h.book.get_maker_order("m-1").await.unwrap();
        assert_eq!(maker.available(), dec!(10));
        assert_eq!(h.gateway.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_payout_bounded_by_transferable_balance() {
        let h = harness();
        maker(&h, dec!(10)).await;
        h.gateway.set_max_transferable(dec!(3));

        let err = book_error(h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await);
        assert_eq!(
            err,
            OrderBookError::InsufficientCapacity {
                required: dec!(4),
                available: dec!(3)
            }
        );
        assert_eq!(h.book.get_maker_order("m-1").await.unwrap().pending_fulfill, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_place_maker_order_validation() {
        let h = harness();

        let mut zero_price = maker_spec("m-1", dec!(10));
        zero_price.price = Decimal::ZERO;
        let mut past = maker_spec("m-2", dec!(10));
        past.expired_at = Utc::now() - ChronoDuration::minutes(1);
        let mut same_chain = maker_spec("m-3", dec!(10));
        same_chain.target_chain = "XTN".to_string();
        let mut bad_address = maker_spec("m-4", dec!(10));
        bad_address.maker_target_addr = "0x123".to_string();
        let too_precise = maker_spec("m-5", dec!(0.000000001));
        let mut empty_token = maker_spec("m-6", dec!(10));
        empty_token.token = String::new();
        let too_large = maker_spec("m-8", dec!(1000000000000));
        let mut huge_price = maker_spec("m-9", dec!(10));
        huge_price.price = Decimal::MAX;

        for spec in [
            zero_price,
            past,
            same_chain,
            bad_address,
            too_precise,
            empty_token,
            too_large,
            huge_price,
        ] {
            let err = book_error(h.book.place_maker_order(spec).await);
            assert_eq!(err.code(), "INVALID_ORDER_SPEC");
        }

        let placed = h.book.place_maker_order(maker_spec("m-7", dec!(10))).await.unwrap();
        assert_eq!(placed.available(), dec!(10));
        assert_eq!(placed.pending_fulfill, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_order_status_view() {
        let h = harness();
        maker(&h, dec!(10)).await;
        let order = h.book.submit_taker_fill("m-1", deposit("0xd1", dec!(4))).await.unwrap();

        let view = h.book.get_order_status(&order.order_id).await.unwrap();
        assert_eq!(view.taker_order.status, TakerOrderStatus::Settling);
        assert_eq!(view.maker_order_id, "m-1");
        assert_eq!(view.maker_available, dec!(6));
        assert_eq!(view.maker_pending_fulfill, dec!(4));
        assert!(!view.maker_expired);

        let err = book_error(h.book.get_order_status("missing").await);
        assert_eq!(err.code(), "ORDER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_ensure_deposit_address() {
        let h = harness();
        let created = h.book.ensure_deposit_address("SETH").await.unwrap();
        let reused = h.book.ensure_deposit_address("SETH").await.unwrap();
        assert_eq!(created, reused);

        let err = book_error(h.book.ensure_deposit_address("DOGE").await);
        assert_eq!(err.code(), "INVALID_ORDER_SPEC");
        assert_eq!(h.book.custody_balances().await.unwrap().len(), 1);
    }
}
