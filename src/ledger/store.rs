use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::AppResult;
use crate::ledger::models::*;

/// Ledger store - THE source of truth for maker and taker orders
///
/// INVARIANTS:
/// - Conditional operations either fully commit or leave prior state untouched
/// - A failed precondition (version, status) is reported as `OrderBookError::Conflict`
/// - Maker capacity never violates `fulfilled + pending_fulfill <= amount`
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a new maker order with zero pending and fulfilled capacity
    async fn create_maker_order(&self, order: &NewMakerOrder) -> AppResult<MakerOrder>;

    /// Insert a taker order row as-is (no capacity side effects)
    async fn create_taker_order(&self, order: NewTakerOrder) -> AppResult<TakerOrder>;

    async fn get_maker_order(&self, order_id: &str) -> AppResult<Option<MakerOrder>>;

    async fn get_taker_order(&self, order_id: &str) -> AppResult<Option<TakerOrder>>;

    async fn find_taker_order_by_deposit_hash(&self, tx_hash: &str)
        -> AppResult<Option<TakerOrder>>;

    /// Apply capacity deltas if the maker is still at `expected_version`
    async fn adjust_maker_capacity(
        &self,
        order_id: &str,
        pending_delta: Decimal,
        fulfilled_delta: Decimal,
        expected_version: i64,
    ) -> AppResult<MakerOrder>;

    /// Compare-and-swap the taker status, writing `update` fields with it
    async fn update_taker_order_status(
        &self,
        order_id: &str,
        from: TakerOrderStatus,
        to: TakerOrderStatus,
        update: TakerOrderUpdate,
    ) -> AppResult<TakerOrder>;

    /// Check capacity, bump `pending_fulfill` by the payout and insert the taker
    /// order in one atomic step. An existing order for the same deposit hash wins
    /// and is returned as `ReserveOutcome::Duplicate` without touching capacity.
    async fn reserve_fill(
        &self,
        expected_version: i64,
        order: NewTakerOrder,
    ) -> AppResult<ReserveOutcome>;

    /// Move a reserved taker order to `to` and release its payout from
    /// `pending_fulfill` in the same atomic step. Moving to FULFILLED also adds
    /// the payout to `fulfilled`.
    async fn resolve_reservation(
        &self,
        taker_order_id: &str,
        from: TakerOrderStatus,
        to: TakerOrderStatus,
        update: TakerOrderUpdate,
    ) -> AppResult<(TakerOrder, MakerOrder)>;

    /// Record the gateway transfer id on a SETTLING order that has none yet
    async fn attach_transfer_id(&self, taker_order_id: &str, cobo_id: &str)
        -> AppResult<TakerOrder>;

    /// Bump `updated_at` of an order still in `status`, sending it to the back
    /// of `list_taker_orders_by_status`. A no-op once the order has moved on.
    async fn touch_taker_order(&self, order_id: &str, status: TakerOrderStatus) -> AppResult<()>;

    /// Least recently updated first
    async fn list_taker_orders_by_status(
        &self,
        status: TakerOrderStatus,
        limit: i64,
    ) -> AppResult<Vec<TakerOrder>>;
}

/// Capacity deltas (pending, fulfilled) released when a reservation resolves to `to`
pub fn resolution_deltas(payout: Decimal, to: TakerOrderStatus) -> (Decimal, Decimal) {
    if to == TakerOrderStatus::Fulfilled {
        (-payout, payout)
    } else {
        (-payout, Decimal::ZERO)
    }
}
