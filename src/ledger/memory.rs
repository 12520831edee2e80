use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::{AppResult, OrderBookError};
use crate::ledger::models::*;
use crate::ledger::store::{resolution_deltas, LedgerStore};

#[derive(Default)]
struct LedgerState {
    makers: HashMap<String, MakerOrder>,
    takers: HashMap<String, TakerOrder>,
    takers_by_hash: HashMap<String, String>,
}

/// In-process ledger store. One lock covers both tables so every composite
/// operation is atomic with respect to concurrent callers.
pub struct InMemoryLedger {
    state: tokio::sync::RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(LedgerState::default()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn conflict(message: String) -> OrderBookError {
    OrderBookError::Conflict(message)
}

impl LedgerState {
    fn insert_taker(&mut self, order: NewTakerOrder) -> AppResult<TakerOrder> {
        if self.takers.contains_key(&order.order_id) {
            return Err(conflict(format!("taker order {} already exists", order.order_id)).into());
        }
        if self.takers_by_hash.contains_key(&order.taker_tx_hash) {
            return Err(conflict(format!(
                "deposit {} already recorded",
                order.taker_tx_hash
            ))
            .into());
        }

        let taker = order.into_order(Utc::now());
        self.takers_by_hash
            .insert(taker.taker_tx_hash.clone(), taker.order_id.clone());
        self.takers.insert(taker.order_id.clone(), taker.clone());
        Ok(taker)
    }

    fn existing_for_hash(&self, tx_hash: &str) -> Option<TakerOrder> {
        self.takers_by_hash
            .get(tx_hash)
            .and_then(|id| self.takers.get(id))
            .cloned()
    }

    fn apply_capacity(
        &mut self,
        order_id: &str,
        pending_delta: Decimal,
        fulfilled_delta: Decimal,
    ) -> AppResult<MakerOrder> {
        let maker = self
            .makers
            .get_mut(order_id)
            .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()))?;

        if !maker.accepts_delta(pending_delta, fulfilled_delta) {
            return Err(conflict(format!(
                "capacity delta ({}, {}) violates invariants of maker {}",
                pending_delta, fulfilled_delta, order_id
            ))
            .into());
        }

        maker.pending_fulfill += pending_delta;
        maker.fulfilled += fulfilled_delta;
        maker.version += 1;
        maker.updated_at = Utc::now();
        Ok(maker.clone())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_maker_order(&self, order: &NewMakerOrder) -> AppResult<MakerOrder> {
        let mut state = self.state.write().await;
        if state.makers.contains_key(&order.order_id) {
            return Err(OrderBookError::InvalidOrderSpec(format!(
                "maker order {} already exists",
                order.order_id
            ))
            .into());
        }
        if let Some(cobo_id) = &order.cobo_id {
            if state
                .makers
                .values()
                .any(|m| m.cobo_id.as_deref() == Some(cobo_id.as_str()))
            {
                return Err(OrderBookError::InvalidOrderSpec(format!(
                    "cobo id {} already used",
                    cobo_id
                ))
                .into());
            }
        }

        let now = Utc::now();
        let maker = MakerOrder {
            order_id: order.order_id.clone(),
            cobo_id: order.cobo_id.clone(),
            source_chain: order.source_chain.clone(),
            maker_source_addr: order.maker_source_addr.clone(),
            target_chain: order.target_chain.clone(),
            maker_target_addr: order.maker_target_addr.clone(),
            token: order.token.clone(),
            price: order.price,
            maker_tx_hash: order.maker_tx_hash.clone(),
            amount: order.amount,
            pending_fulfill: Decimal::ZERO,
            fulfilled: Decimal::ZERO,
            version: 0,
            expired_at: order.expired_at,
            created_at: now,
            updated_at: now,
        };
        state.makers.insert(maker.order_id.clone(), maker.clone());
        Ok(maker)
    }

    async fn create_taker_order(&self, order: NewTakerOrder) -> AppResult<TakerOrder> {
        let mut state = self.state.write().await;
        state.insert_taker(order)
    }

    async fn get_maker_order(&self, order_id: &str) -> AppResult<Option<MakerOrder>> {
        let state = self.state.read().await;
        Ok(state.makers.get(order_id).cloned())
    }

    async fn get_taker_order(&self, order_id: &str) -> AppResult<Option<TakerOrder>> {
        let state = self.state.read().await;
        Ok(state.takers.get(order_id).cloned())
    }

    async fn find_taker_order_by_deposit_hash(
        &self,
        tx_hash: &str,
    ) -> AppResult<Option<TakerOrder>> {
        let state = self.state.read().await;
        Ok(state.existing_for_hash(tx_hash))
    }

    async fn adjust_maker_capacity(
        &self,
        order_id: &str,
        pending_delta: Decimal,
        fulfilled_delta: Decimal,
        expected_version: i64,
    ) -> AppResult<MakerOrder> {
        let mut state = self.state.write().await;
        let current = state
            .makers
            .get(order_id)
            .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()))?
            .version;
        if current != expected_version {
            return Err(conflict(format!(
                "maker {} at version {}, expected {}",
                order_id, current, expected_version
            ))
            .into());
        }
        state.apply_capacity(order_id, pending_delta, fulfilled_delta)
    }

    async fn update_taker_order_status(
        &self,
        order_id: &str,
        from: TakerOrderStatus,
        to: TakerOrderStatus,
        update: TakerOrderUpdate,
    ) -> AppResult<TakerOrder> {
        TakerOrderStatus::validate_transition(from, to)?;

        let mut state = self.state.write().await;
        let taker = state
            .takers
            .get_mut(order_id)
            .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()))?;
        if taker.status != from {
            return Err(conflict(format!(
                "taker {} is {}, expected {}",
                order_id, taker.status, from
            ))
            .into());
        }

        taker.status = to;
        update.apply(taker);
        taker.updated_at = Utc::now();
        Ok(taker.clone())
    }

    async fn reserve_fill(
        &self,
        expected_version: i64,
        order: NewTakerOrder,
    ) -> AppResult<ReserveOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.existing_for_hash(&order.taker_tx_hash) {
            return Ok(ReserveOutcome::Duplicate(existing));
        }

        let maker = state
            .makers
            .get(&order.maker_order_id)
            .ok_or_else(|| OrderBookError::OrderNotFound(order.maker_order_id.clone()))?;
        if maker.version != expected_version {
            return Err(conflict(format!(
                "maker {} at version {}, expected {}",
                maker.order_id, maker.version, expected_version
            ))
            .into());
        }
        if !maker.accepts_delta(order.payout, Decimal::ZERO) {
            return Err(OrderBookError::InsufficientCapacity {
                required: order.payout,
                available: maker.available(),
            }
            .into());
        }

        let maker_id = order.maker_order_id.clone();
        let payout = order.payout;
        let taker = state.insert_taker(order)?;
        let maker = state.apply_capacity(&maker_id, payout, Decimal::ZERO)?;
        Ok(ReserveOutcome::Reserved { taker, maker })
    }

    async fn resolve_reservation(
        &self,
        taker_order_id: &str,
        from: TakerOrderStatus,
        to: TakerOrderStatus,
        update: TakerOrderUpdate,
    ) -> AppResult<(TakerOrder, MakerOrder)> {
        TakerOrderStatus::validate_transition(from, to)?;
        if !from.holds_reservation() {
            return Err(conflict(format!("{} holds no reservation", from)).into());
        }

        let mut state = self.state.write().await;
        let taker = state
            .takers
            .get(taker_order_id)
            .ok_or_else(|| OrderBookError::OrderNotFound(taker_order_id.to_string()))?
            .clone();
        if taker.status != from {
            return Err(conflict(format!(
                "taker {} is {}, expected {}",
                taker_order_id, taker.status, from
            ))
            .into());
        }

        // Capacity first: if it fails nothing has been written yet
        let (pending_delta, fulfilled_delta) = resolution_deltas(taker.payout, to);
        let maker = state.apply_capacity(&taker.maker_order_id, pending_delta, fulfilled_delta)?;

        let taker = match state.takers.get_mut(taker_order_id) {
            Some(row) => {
                row.status = to;
                update.apply(row);
                row.updated_at = Utc::now();
                row.clone()
            }
            None => return Err(OrderBookError::OrderNotFound(taker_order_id.to_string()).into()),
        };
        Ok((taker, maker))
    }

    async fn attach_transfer_id(
        &self,
        taker_order_id: &str,
        cobo_id: &str,
    ) -> AppResult<TakerOrder> {
        let mut state = self.state.write().await;
        let taker = state
            .takers
            .get_mut(taker_order_id)
            .ok_or_else(|| OrderBookError::OrderNotFound(taker_order_id.to_string()))?;

        if taker.status != TakerOrderStatus::Settling {
            return Err(conflict(format!(
                "taker {} is {}, expected SETTLING",
                taker_order_id, taker.status
            ))
            .into());
        }
        match taker.cobo_id.as_deref() {
            None => {
                taker.cobo_id = Some(cobo_id.to_string());
                taker.updated_at = Utc::now();
            }
            Some(existing) if existing == cobo_id => {}
            Some(existing) => {
                return Err(conflict(format!(
                    "taker {} already bound to transfer {}",
                    taker_order_id, existing
                ))
                .into())
            }
        }
        Ok(taker.clone())
    }

    async fn touch_taker_order(&self, order_id: &str, status: TakerOrderStatus) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(taker) = state.takers.get_mut(order_id) {
            if taker.status == status {
                taker.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn list_taker_orders_by_status(
        &self,
        status: TakerOrderStatus,
        limit: i64,
    ) -> AppResult<Vec<TakerOrder>> {
        let state = self.state.read().await;
        let mut orders: Vec<TakerOrder> = state
            .takers
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        orders.sort_by_key(|t| (t.updated_at, t.created_at));
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }
}
