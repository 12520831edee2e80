use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use validator::Validate;

use crate::error::{AppResult, OrderBookError};

/// Scale of every persisted amount column (`decimal(20,8)`)
pub const AMOUNT_SCALE: u32 = 8;

/// Integer digits left in a `decimal(20,8)` column
const AMOUNT_INTEGER_DIGITS: u32 = 12;

/// Whether `value` is stored by a `decimal(20,8)` column without rounding or overflow
pub fn fits_amount_column(value: Decimal) -> bool {
    value.scale() <= AMOUNT_SCALE
        && value.abs() < Decimal::from(10i64.pow(AMOUNT_INTEGER_DIGITS))
}

/// Taker order status
///
/// PENDING → RESERVED → SETTLING → {FULFILLED | FAILED}, with RESERVED/SETTLING → EXPIRED
/// when the parent maker window elapses first. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "taker_order_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TakerOrderStatus {
    Pending,
    Reserved,
    Settling,
    Fulfilled,
    Failed,
    Expired,
}

impl fmt::Display for TakerOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TakerOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakerOrderStatus::Pending => "PENDING",
            TakerOrderStatus::Reserved => "RESERVED",
            TakerOrderStatus::Settling => "SETTLING",
            TakerOrderStatus::Fulfilled => "FULFILLED",
            TakerOrderStatus::Failed => "FAILED",
            TakerOrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TakerOrderStatus::Fulfilled | TakerOrderStatus::Failed | TakerOrderStatus::Expired
        )
    }

    /// Whether this order currently holds maker capacity in `pending_fulfill`
    pub fn holds_reservation(&self) -> bool {
        matches!(self, TakerOrderStatus::Reserved | TakerOrderStatus::Settling)
    }

    /// Validate the taker order state machine
    /// Valid transitions:
    /// - Pending → Reserved, Failed
    /// - Reserved → Settling, Failed, Expired
    /// - Settling → Fulfilled, Failed, Expired
    /// - Terminal states (Fulfilled, Failed, Expired) → NO TRANSITIONS ALLOWED
    pub fn validate_transition(from: TakerOrderStatus, to: TakerOrderStatus) -> AppResult<()> {
        let allowed: &[TakerOrderStatus] = match from {
            TakerOrderStatus::Pending => &[TakerOrderStatus::Reserved, TakerOrderStatus::Failed],
            TakerOrderStatus::Reserved => &[
                TakerOrderStatus::Settling,
                TakerOrderStatus::Failed,
                TakerOrderStatus::Expired,
            ],
            TakerOrderStatus::Settling => &[
                TakerOrderStatus::Fulfilled,
                TakerOrderStatus::Failed,
                TakerOrderStatus::Expired,
            ],
            TakerOrderStatus::Fulfilled | TakerOrderStatus::Failed | TakerOrderStatus::Expired => &[],
        };

        if !allowed.contains(&to) {
            return Err(OrderBookError::Conflict(format!(
                "illegal taker order transition {} -> {}",
                from, to
            ))
            .into());
        }

        Ok(())
    }
}

/// Maker order - a standing offer to deliver `amount` of `token` on `target_chain`
/// to whoever deposits the equivalent on `source_chain`.
///
/// INVARIANT: 0 <= fulfilled, 0 <= pending_fulfill, fulfilled + pending_fulfill <= amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerOrder {
    pub order_id: String,
    pub cobo_id: Option<String>,
    pub source_chain: String,
    pub maker_source_addr: String,
    pub target_chain: String,
    pub maker_target_addr: String,
    pub token: String,
    /// Target-per-source exchange rate
    pub price: Decimal,
    pub maker_tx_hash: String,
    pub amount: Decimal,
    pub pending_fulfill: Decimal,
    pub fulfilled: Decimal,
    /// Optimistic concurrency counter, bumped by every capacity change
    pub version: i64,
    pub expired_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MakerOrder {
    /// Capacity neither delivered nor reserved
    pub fn available(&self) -> Decimal {
        self.amount - self.fulfilled - self.pending_fulfill
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expired_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Target-chain payout owed for a source-chain deposit, `None` on overflow
    pub fn payout_for(&self, deposit_amount: Decimal) -> Option<Decimal> {
        deposit_amount
            .checked_mul(self.price)
            .map(|payout| payout.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero))
    }

    pub fn holds_invariants(&self) -> bool {
        self.fulfilled >= Decimal::ZERO
            && self.pending_fulfill >= Decimal::ZERO
            && self.fulfilled + self.pending_fulfill <= self.amount
    }

    /// Whether applying the deltas keeps the capacity invariants
    pub fn accepts_delta(&self, pending_delta: Decimal, fulfilled_delta: Decimal) -> bool {
        let pending = self.pending_fulfill + pending_delta;
        let fulfilled = self.fulfilled + fulfilled_delta;
        pending >= Decimal::ZERO && fulfilled >= Decimal::ZERO && pending + fulfilled <= self.amount
    }
}

/// Maker order placement request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewMakerOrder {
    #[validate(length(min = 1, max = 100))]
    pub order_id: String,
    #[validate(length(min = 1, max = 100))]
    pub cobo_id: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub source_chain: String,
    #[validate(length(min = 1, max = 100))]
    pub maker_source_addr: String,
    #[validate(length(min = 1, max = 100))]
    pub target_chain: String,
    #[validate(length(min = 1, max = 100))]
    pub maker_target_addr: String,
    #[validate(length(min = 1, max = 100))]
    pub token: String,
    pub price: Decimal,
    #[validate(length(min = 1, max = 100))]
    pub maker_tx_hash: String,
    pub amount: Decimal,
    pub expired_at: DateTime<Utc>,
}

/// Taker order - a single fill attempt against a maker order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakerOrder {
    pub order_id: String,
    pub maker_order_id: String,
    pub taker_tx_id: String,
    /// Payout transfer id assigned by the gateway
    pub cobo_id: Option<String>,
    /// Idempotency key sent with the payout transfer
    pub request_id: String,
    pub taker_source_addr: String,
    pub taker_target_addr: String,
    pub token: String,
    pub taker_tx_hash: String,
    /// Source-chain amount deposited
    pub amount: Decimal,
    /// Target-chain amount reserved against the maker order
    pub payout: Decimal,
    pub status: TakerOrderStatus,
    pub settlement_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TakerOrder {
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Insert payload for a taker order row
#[derive(Debug, Clone)]
pub struct NewTakerOrder {
    pub order_id: String,
    pub maker_order_id: String,
    pub taker_tx_id: String,
    pub request_id: String,
    pub taker_source_addr: String,
    pub taker_target_addr: String,
    pub token: String,
    pub taker_tx_hash: String,
    pub amount: Decimal,
    pub payout: Decimal,
    pub status: TakerOrderStatus,
}

impl NewTakerOrder {
    pub fn into_order(self, now: DateTime<Utc>) -> TakerOrder {
        TakerOrder {
            order_id: self.order_id,
            maker_order_id: self.maker_order_id,
            taker_tx_id: self.taker_tx_id,
            cobo_id: None,
            request_id: self.request_id,
            taker_source_addr: self.taker_source_addr,
            taker_target_addr: self.taker_target_addr,
            token: self.token,
            taker_tx_hash: self.taker_tx_hash,
            amount: self.amount,
            payout: self.payout,
            status: self.status,
            settlement_tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Optional fields written alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TakerOrderUpdate {
    pub cobo_id: Option<String>,
    pub settlement_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
}

impl TakerOrderUpdate {
    pub fn settled(tx_hash: Option<String>) -> Self {
        Self {
            settlement_tx_hash: tx_hash,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Apply to an in-memory row, keeping existing values where unset
    pub fn apply(&self, order: &mut TakerOrder) {
        if let Some(cobo_id) = &self.cobo_id {
            order.cobo_id = Some(cobo_id.clone());
        }
        if let Some(hash) = &self.settlement_tx_hash {
            order.settlement_tx_hash = Some(hash.clone());
        }
        if let Some(reason) = &self.failure_reason {
            order.failure_reason = Some(reason.clone());
        }
    }
}

/// Observed taker deposit, input to a fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakerDeposit {
    pub source_chain: String,
    pub taker_source_addr: String,
    pub token: String,
    pub amount: Decimal,
    pub tx_hash: String,
    /// Gateway-side transaction id of the detected deposit, when known
    pub tx_id: Option<String>,
    /// Explicit payout destination; falls back to the deposit memo
    pub target_addr: Option<String>,
    pub memo: Option<String>,
}

/// Result of a reservation attempt against the store
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved {
        taker: TakerOrder,
        maker: MakerOrder,
    },
    /// A taker order already exists for the deposit hash
    Duplicate(TakerOrder),
}

/// Taker order status together with its maker's remaining capacity
#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusView {
    pub taker_order: TakerOrder,
    pub maker_order_id: String,
    pub maker_available: Decimal,
    pub maker_pending_fulfill: Decimal,
    pub maker_fulfilled: Decimal,
    pub maker_expired: bool,
}
