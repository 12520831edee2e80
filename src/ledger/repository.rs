use super::models::*;
use super::store::{resolution_deltas, LedgerStore};
use crate::error::{AppError, AppResult, OrderBookError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::{debug, warn};

const MAKER_COLUMNS: &str = r#"
    order_id, cobo_id, source_chain, maker_source_addr, target_chain, maker_target_addr,
    token, price, maker_tx_hash, amount, pending_fulfill, fulfilled, version,
    expired_at, created_at, updated_at
"#;

const TAKER_COLUMNS: &str = r#"
    order_id, maker_order_id, taker_tx_id, cobo_id, request_id, taker_source_addr,
    taker_target_addr, token, taker_tx_hash, amount, payout, status,
    settlement_tx_hash, failure_reason, created_at, updated_at
"#;

fn to_big(value: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::Internal(format!("Decimal conversion error: {:?}", e)))
}

fn from_big(value: &BigDecimal) -> AppResult<Decimal> {
    let text = value.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(AppError::from)
}

#[derive(FromRow)]
struct MakerOrderRow {
    order_id: String,
    cobo_id: Option<String>,
    source_chain: String,
    maker_source_addr: String,
    target_chain: String,
    maker_target_addr: String,
    token: String,
    price: BigDecimal,
    maker_tx_hash: String,
    amount: BigDecimal,
    pending_fulfill: BigDecimal,
    fulfilled: BigDecimal,
    version: i64,
    expired_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MakerOrderRow> for MakerOrder {
    type Error = AppError;

    fn try_from(row: MakerOrderRow) -> AppResult<Self> {
        Ok(MakerOrder {
            price: from_big(&row.price)?,
            amount: from_big(&row.amount)?,
            pending_fulfill: from_big(&row.pending_fulfill)?,
            fulfilled: from_big(&row.fulfilled)?,
            order_id: row.order_id,
            cobo_id: row.cobo_id,
            source_chain: row.source_chain,
            maker_source_addr: row.maker_source_addr,
            target_chain: row.target_chain,
            maker_target_addr: row.maker_target_addr,
            token: row.token,
            maker_tx_hash: row.maker_tx_hash,
            version: row.version,
            expired_at: row.expired_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TakerOrderRow {
    order_id: String,
    maker_order_id: String,
    taker_tx_id: String,
    cobo_id: Option<String>,
    request_id: String,
    taker_source_addr: String,
    taker_target_addr: String,
    token: String,
    taker_tx_hash: String,
    amount: BigDecimal,
    payout: BigDecimal,
    status: TakerOrderStatus,
    settlement_tx_hash: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TakerOrderRow> for TakerOrder {
    type Error = AppError;

    fn try_from(row: TakerOrderRow) -> AppResult<Self> {
        Ok(TakerOrder {
            amount: from_big(&row.amount)?,
            payout: from_big(&row.payout)?,
            order_id: row.order_id,
            maker_order_id: row.maker_order_id,
            taker_tx_id: row.taker_tx_id,
            cobo_id: row.cobo_id,
            request_id: row.request_id,
            taker_source_addr: row.taker_source_addr,
            taker_target_addr: row.taker_target_addr,
            token: row.token,
            taker_tx_hash: row.taker_tx_hash,
            status: row.status,
            settlement_tx_hash: row.settlement_tx_hash,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Postgres-backed ledger store
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn lock_maker(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
    ) -> AppResult<MakerOrder> {
        let row = sqlx::query_as::<_, MakerOrderRow>(&format!(
            "SELECT {} FROM maker_order WHERE order_id = $1 FOR UPDATE",
            MAKER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()))?;

        row.try_into()
    }

    async fn lock_taker(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
    ) -> AppResult<TakerOrder> {
        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            "SELECT {} FROM taker_order WHERE order_id = $1 FOR UPDATE",
            TAKER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()))?;

        row.try_into()
    }

    /// Conditional capacity update; `None` when a guard failed
    async fn apply_capacity(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        pending_delta: Decimal,
        fulfilled_delta: Decimal,
        expected_version: Option<i64>,
    ) -> AppResult<Option<MakerOrder>> {
        let row = sqlx::query_as::<_, MakerOrderRow>(&format!(
            r#"
            UPDATE maker_order
            SET pending_fulfill = pending_fulfill + $2,
                fulfilled = fulfilled + $3,
                version = version + 1,
                updated_at = NOW()
            WHERE order_id = $1
              AND ($4::BIGINT IS NULL OR version = $4)
              AND pending_fulfill + $2 >= 0
              AND fulfilled + $3 >= 0
              AND pending_fulfill + $2 + fulfilled + $3 <= amount
            RETURNING {}
            "#,
            MAKER_COLUMNS
        ))
        .bind(order_id)
        .bind(to_big(pending_delta)?)
        .bind(to_big(fulfilled_delta)?)
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(MakerOrder::try_from).transpose()
    }

    async fn insert_taker(
        tx: &mut Transaction<'_, Postgres>,
        order: &NewTakerOrder,
    ) -> AppResult<Option<TakerOrder>> {
        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            r#"
            INSERT INTO taker_order (
                order_id, maker_order_id, taker_tx_id, request_id, taker_source_addr,
                taker_target_addr, token, taker_tx_hash, amount, payout, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (taker_tx_hash) DO NOTHING
            RETURNING {}
            "#,
            TAKER_COLUMNS
        ))
        .bind(&order.order_id)
        .bind(&order.maker_order_id)
        .bind(&order.taker_tx_id)
        .bind(&order.request_id)
        .bind(&order.taker_source_addr)
        .bind(&order.taker_target_addr)
        .bind(&order.token)
        .bind(&order.taker_tx_hash)
        .bind(to_big(order.amount)?)
        .bind(to_big(order.payout)?)
        .bind(order.status)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(TakerOrder::try_from).transpose()
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn create_maker_order(&self, order: &NewMakerOrder) -> AppResult<MakerOrder> {
        let result = sqlx::query_as::<_, MakerOrderRow>(&format!(
            r#"
            INSERT INTO maker_order (
                order_id, cobo_id, source_chain, maker_source_addr, target_chain,
                maker_target_addr, token, price, maker_tx_hash, amount, expired_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            MAKER_COLUMNS
        ))
        .bind(&order.order_id)
        .bind(&order.cobo_id)
        .bind(&order.source_chain)
        .bind(&order.maker_source_addr)
        .bind(&order.target_chain)
        .bind(&order.maker_target_addr)
        .bind(&order.token)
        .bind(to_big(order.price)?)
        .bind(&order.maker_tx_hash)
        .bind(to_big(order.amount)?)
        .bind(order.expired_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(e) if is_unique_violation(&e) => Err(OrderBookError::InvalidOrderSpec(format!(
                "maker order {} or its cobo id already exists",
                order.order_id
            ))
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_taker_order(&self, order: NewTakerOrder) -> AppResult<TakerOrder> {
        let mut tx = self.begin_tx().await?;
        let inserted = Self::insert_taker(&mut tx, &order).await;
        let inserted = match inserted {
            Err(AppError::Database(e)) if is_unique_violation(&e) => None,
            other => other?,
        };
        let Some(taker) = inserted else {
            return Err(OrderBookError::Conflict(format!(
                "deposit {} already recorded",
                order.taker_tx_hash
            ))
            .into());
        };
        tx.commit().await?;
        Ok(taker)
    }

    async fn get_maker_order(&self, order_id: &str) -> AppResult<Option<MakerOrder>> {
        let row = sqlx::query_as::<_, MakerOrderRow>(&format!(
            "SELECT {} FROM maker_order WHERE order_id = $1",
            MAKER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MakerOrder::try_from).transpose()
    }

    async fn get_taker_order(&self, order_id: &str) -> AppResult<Option<TakerOrder>> {
        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            "SELECT {} FROM taker_order WHERE order_id = $1",
            TAKER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TakerOrder::try_from).transpose()
    }

    async fn find_taker_order_by_deposit_hash(
        &self,
        tx_hash: &str,
    ) -> AppResult<Option<TakerOrder>> {
        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            "SELECT {} FROM taker_order WHERE taker_tx_hash = $1",
            TAKER_COLUMNS
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TakerOrder::try_from).transpose()
    }

    async fn adjust_maker_capacity(
        &self,
        order_id: &str,
        pending_delta: Decimal,
        fulfilled_delta: Decimal,
        expected_version: i64,
    ) -> AppResult<MakerOrder> {
        let mut tx = self.begin_tx().await?;
        let updated = Self::apply_capacity(
            &mut tx,
            order_id,
            pending_delta,
            fulfilled_delta,
            Some(expected_version),
        )
        .await?;

        let Some(maker) = updated else {
            return Err(OrderBookError::Conflict(format!(
                "maker {} changed or delta ({}, {}) violates capacity",
                order_id, pending_delta, fulfilled_delta
            ))
            .into());
        };
        tx.commit().await?;
        Ok(maker)
    }

    async fn update_taker_order_status(
        &self,
        order_id: &str,
        from: TakerOrderStatus,
        to: TakerOrderStatus,
        update: TakerOrderUpdate,
    ) -> AppResult<TakerOrder> {
        // SECURITY: Validate state machine transitions
        TakerOrderStatus::validate_transition(from, to)?;

        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            r#"
            UPDATE taker_order
            SET status = $3,
                cobo_id = COALESCE($4, cobo_id),
                settlement_tx_hash = COALESCE($5, settlement_tx_hash),
                failure_reason = COALESCE($6, failure_reason),
                updated_at = NOW()
            WHERE order_id = $1 AND status = $2
            RETURNING {}
            "#,
            TAKER_COLUMNS
        ))
        .bind(order_id)
        .bind(from)
        .bind(to)
        .bind(update.cobo_id)
        .bind(update.settlement_tx_hash)
        .bind(update.failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(OrderBookError::Conflict(format!(
                "taker {} is not {}",
                order_id, from
            ))
            .into()),
        }
    }

    async fn reserve_fill(
        &self,
        expected_version: i64,
        order: NewTakerOrder,
    ) -> AppResult<ReserveOutcome> {
        if let Some(existing) = self.find_taker_order_by_deposit_hash(&order.taker_tx_hash).await? {
            return Ok(ReserveOutcome::Duplicate(existing));
        }

        let mut tx = self.begin_tx().await?;

        // Get maker with FOR UPDATE lock to serialize concurrent fills
        let maker = Self::lock_maker(&mut tx, &order.maker_order_id).await?;
        if maker.version != expected_version {
            return Err(OrderBookError::Conflict(format!(
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

        let Some(taker) = Self::insert_taker(&mut tx, &order).await? else {
            // Lost a race on the deposit hash: the other insert owns the fill
            tx.rollback().await?;
            debug!("Deposit {} already reserved concurrently", order.taker_tx_hash);
            return match self.find_taker_order_by_deposit_hash(&order.taker_tx_hash).await? {
                Some(existing) => Ok(ReserveOutcome::Duplicate(existing)),
                None => Err(OrderBookError::Conflict(format!(
                    "deposit {} vanished during reservation",
                    order.taker_tx_hash
                ))
                .into()),
            };
        };

        let Some(maker) = Self::apply_capacity(
            &mut tx,
            &order.maker_order_id,
            order.payout,
            Decimal::ZERO,
            Some(expected_version),
        )
        .await?
        else {
            return Err(OrderBookError::Conflict(format!(
                "maker {} changed during reservation",
                order.maker_order_id
            ))
            .into());
        };

        tx.commit().await?;
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
            return Err(OrderBookError::Conflict(format!("{} holds no reservation", from)).into());
        }

        let mut tx = self.begin_tx().await?;

        let current = Self::lock_taker(&mut tx, taker_order_id).await?;
        if current.status != from {
            return Err(OrderBookError::Conflict(format!(
                "taker {} is {}, expected {}",
                taker_order_id, current.status, from
            ))
            .into());
        }

        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            r#"
            UPDATE taker_order
            SET status = $3,
                cobo_id = COALESCE($4, cobo_id),
                settlement_tx_hash = COALESCE($5, settlement_tx_hash),
                failure_reason = COALESCE($6, failure_reason),
                updated_at = NOW()
            WHERE order_id = $1 AND status = $2
            RETURNING {}
            "#,
            TAKER_COLUMNS
        ))
        .bind(taker_order_id)
        .bind(from)
        .bind(to)
        .bind(update.cobo_id)
        .bind(update.settlement_tx_hash)
        .bind(update.failure_reason)
        .fetch_one(&mut *tx)
        .await?;
        let taker = TakerOrder::try_from(row)?;

        let (pending_delta, fulfilled_delta) = resolution_deltas(taker.payout, to);
        let Some(maker) = Self::apply_capacity(
            &mut tx,
            &taker.maker_order_id,
            pending_delta,
            fulfilled_delta,
            None,
        )
        .await?
        else {
            warn!(
                "Capacity guard rejected resolution of taker {} on maker {}",
                taker_order_id, taker.maker_order_id
            );
            return Err(OrderBookError::Conflict(format!(
                "maker {} capacity would break on resolving {}",
                taker.maker_order_id, taker_order_id
            ))
            .into());
        };

        tx.commit().await?;
        Ok((taker, maker))
    }

    async fn attach_transfer_id(
        &self,
        taker_order_id: &str,
        cobo_id: &str,
    ) -> AppResult<TakerOrder> {
        let row = sqlx::query_as::<_, TakerOrderRow>(&format!(
            r#"
            UPDATE taker_order
            SET cobo_id = $2, updated_at = NOW()
            WHERE order_id = $1 AND status = $3 AND (cobo_id IS NULL OR cobo_id = $2)
            RETURNING {}
            "#,
            TAKER_COLUMNS
        ))
        .bind(taker_order_id)
        .bind(cobo_id)
        .bind(TakerOrderStatus::Settling)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(OrderBookError::Conflict(format!(
                "taker {} is not SETTLING or already bound to another transfer",
                taker_order_id
            ))
            .into()),
        }
    }

    async fn touch_taker_order(&self, order_id: &str, status: TakerOrderStatus) -> AppResult<()> {
        sqlx::query(
            "UPDATE taker_order SET updated_at = clock_timestamp() WHERE order_id = $1 AND status = $2",
        )
        .bind(order_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_taker_orders_by_status(
        &self,
        status: TakerOrderStatus,
        limit: i64,
    ) -> AppResult<Vec<TakerOrder>> {
        let rows = sqlx::query_as::<_, TakerOrderRow>(&format!(
            "SELECT {} FROM taker_order WHERE status = $1 ORDER BY updated_at ASC, created_at ASC LIMIT $2",
            TAKER_COLUMNS
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TakerOrder::try_from).collect()
    }
}
