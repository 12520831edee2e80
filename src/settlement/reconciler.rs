// Settlement reconciler - drives in-flight taker orders to a terminal state
//
// Per pass:
// 1. SETTLING orders: ask the gateway how the payout went
//    - confirmed → FULFILLED, failed/rejected → FAILED (capacity released)
//    - lookup refused → ask again by request id
//    - still pending, or unknown to the gateway, past the reservation
//      timeout → released; gateway unreachable → deferred
//    - no transfer id yet → re-send with the stored request id
// 2. RESERVED orders:
//    - maker expired → EXPIRED
//    - otherwise, once older than the resume grace, resume settlement
//
// Orders left in flight are touched so the next pass starts with others.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, GatewayError, OrderBookError};
use crate::gateway::TransferStatus;
use crate::ledger::models::{TakerOrder, TakerOrderStatus};
use crate::ledger::store::LedgerStore;
use crate::orderbook::OrderBook;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// SETTLING orders unresolved for longer than this are released
    pub reservation_timeout: Duration,
    /// RESERVED orders younger than this are left to the submitting call
    pub resume_grace: Duration,
    /// Orders examined per status per pass
    pub batch_size: i64,
    /// Orders processed concurrently
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reservation_timeout: Duration::from_secs(3600),
            resume_grace: Duration::from_secs(60),
            batch_size: 200,
            concurrency: 8,
        }
    }
}

/// What a pass did to one order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Fulfilled,
    Failed,
    Expired,
    /// Pending past the reservation timeout
    Released,
    /// RESERVED order moved on to settlement
    Resumed,
    /// Payout re-sent for a SETTLING order without transfer id
    Resubmitted,
    /// Outcome not known yet, revisit next pass
    Deferred,
    /// Nothing to do (raced, or inside the grace window)
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub fulfilled: usize,
    pub failed: usize,
    pub expired: usize,
    pub released: usize,
    pub resumed: usize,
    pub resubmitted: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ReconciliationReport {
    fn record(&mut self, outcome: &AppResult<ReconcileAction>) {
        self.examined += 1;
        match outcome {
            Ok(ReconcileAction::Fulfilled) => self.fulfilled += 1,
            Ok(ReconcileAction::Failed) => self.failed += 1,
            Ok(ReconcileAction::Expired) => self.expired += 1,
            Ok(ReconcileAction::Released) => self.released += 1,
            Ok(ReconcileAction::Resumed) => self.resumed += 1,
            Ok(ReconcileAction::Resubmitted) => self.resubmitted += 1,
            Ok(ReconcileAction::Deferred) => self.deferred += 1,
            Ok(ReconcileAction::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }

    /// Orders that reached a terminal state this pass
    pub fn resolved(&self) -> usize {
        self.fulfilled + self.failed + self.expired + self.released
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    ledger: Arc<dyn LedgerStore>,
    book: Arc<OrderBook>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, ledger: Arc<dyn LedgerStore>, book: Arc<OrderBook>) -> Self {
        Self {
            config,
            ledger,
            book,
        }
    }

    /// One reconciliation pass. A failure on one order never stops the others.
    pub async fn run_reconciliation(&self) -> AppResult<ReconciliationReport> {
        let settling = self
            .ledger
            .list_taker_orders_by_status(TakerOrderStatus::Settling, self.config.batch_size)
            .await?;
        let reserved = self
            .ledger
            .list_taker_orders_by_status(TakerOrderStatus::Reserved, self.config.batch_size)
            .await?;

        if settling.is_empty() && reserved.is_empty() {
            debug!("No in-flight taker orders");
            return Ok(ReconciliationReport::default());
        }
        info!(
            "🔄 Reconciling {} settling and {} reserved taker orders",
            settling.len(),
            reserved.len()
        );

        let concurrency = self.config.concurrency.max(1);
        let outcomes: Vec<(String, TakerOrderStatus, AppResult<ReconcileAction>)> = stream::iter(
            settling.into_iter().chain(reserved),
        )
        .map(|order| async move {
            let order_id = order.order_id.clone();
            let status = order.status;
            let outcome = match status {
                TakerOrderStatus::Settling => self.reconcile_settling(order).await,
                TakerOrderStatus::Reserved => self.reconcile_reserved(order).await,
                _ => Ok(ReconcileAction::Skipped),
            };
            (order_id, status, outcome)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

        let mut report = ReconciliationReport::default();
        for (order_id, status, outcome) in &outcomes {
            if let Err(e) = outcome {
                error!("❌ Reconciling taker order {} failed: {}", order_id, e);
            }
            if Self::still_in_flight(outcome) {
                if let Err(e) = self.ledger.touch_taker_order(order_id, *status).await {
                    warn!("Could not requeue taker order {}: {}", order_id, e);
                }
            }
            report.record(outcome);
        }

        info!("✓ Reconciliation pass complete: {:?}", report);
        Ok(report)
    }

    fn age(order: &TakerOrder) -> Duration {
        order.age_at(Utc::now()).to_std().unwrap_or_default()
    }

    fn still_in_flight(outcome: &AppResult<ReconcileAction>) -> bool {
        matches!(
            outcome,
            Ok(ReconcileAction::Deferred) | Ok(ReconcileAction::Skipped) | Err(_)
        )
    }

    /// Release an order whose payout could not be resolved within the
    /// reservation timeout, otherwise leave it for a later pass
    async fn release_if_timed_out(&self, order: &TakerOrder, reason: &str) -> AppResult<ReconcileAction> {
        if Self::age(order) <= self.config.reservation_timeout {
            return Ok(ReconcileAction::Deferred);
        }
        warn!(
            "⏰ Taker order {} unresolved after {:?} ({}), releasing",
            order.order_id, self.config.reservation_timeout, reason
        );
        let (_, applied) = self
            .book
            .release_with_reason(&order.order_id, &format!("settlement timed out: {}", reason))
            .await?;
        Ok(if applied {
            ReconcileAction::Released
        } else {
            ReconcileAction::Skipped
        })
    }

    async fn reconcile_settling(&self, order: TakerOrder) -> AppResult<ReconcileAction> {
        let Some(transfer_id) = order.cobo_id.clone() else {
            return self.resubmit(order).await;
        };

        let info = match self.book.lookup_transfer(&transfer_id).await {
            Ok(info) => info,
            Err(GatewayError::Rejected { status, message }) => {
                warn!(
                    "Transfer {} inquiry refused ({}): {}, looking up request {}",
                    transfer_id, status, message, order.request_id
                );
                match self.book.lookup_transfer_by_request(&order.request_id).await {
                    Ok(Some(info)) => info,
                    Ok(None) | Err(GatewayError::Rejected { .. }) => {
                        return self
                            .release_if_timed_out(
                                &order,
                                &format!("transfer {} unknown to gateway", transfer_id),
                            )
                            .await;
                    }
                    Err(e) => {
                        warn!("Request {} inquiry failed: {}", order.request_id, e);
                        return Ok(ReconcileAction::Deferred);
                    }
                }
            }
            Err(e) => {
                warn!("Transfer {} inquiry failed: {}", transfer_id, e);
                return Ok(ReconcileAction::Deferred);
            }
        };

        match info.status {
            TransferStatus::Confirmed => {
                let (settled, applied) = self
                    .book
                    .confirm_settlement(&order.order_id, info.tx_hash)
                    .await?;
                if !applied {
                    return Ok(ReconcileAction::Skipped);
                }
                info!(
                    "✅ Taker order {} fulfilled: {} paid to {}",
                    settled.order_id, settled.payout, settled.taker_target_addr
                );
                Ok(ReconcileAction::Fulfilled)
            }
            TransferStatus::Failed | TransferStatus::Rejected => {
                let (_, applied) = self
                    .book
                    .release_with_reason(
                        &order.order_id,
                        &format!("transfer {} {:?}", transfer_id, info.status),
                    )
                    .await?;
                if !applied {
                    return Ok(ReconcileAction::Skipped);
                }
                warn!(
                    "Taker order {} failed: transfer {} {:?}",
                    order.order_id, transfer_id, info.status
                );
                Ok(ReconcileAction::Failed)
            }
            TransferStatus::Pending => {
                self.release_if_timed_out(&order, &format!("transfer {} pending", transfer_id))
                    .await
            }
        }
    }

    async fn resubmit(&self, order: TakerOrder) -> AppResult<ReconcileAction> {
        match self.book.retry_transfer(&order.order_id).await {
            Ok(updated) if updated.cobo_id.is_some() => {
                info!("Payout for taker order {} re-sent", order.order_id);
                Ok(ReconcileAction::Resubmitted)
            }
            Ok(updated) if updated.status.is_terminal() => Ok(ReconcileAction::Skipped),
            Ok(_) => Ok(ReconcileAction::Deferred),
            Err(e) if matches!(e.order_book(), Some(OrderBookError::GatewayRejected(_))) => {
                Ok(ReconcileAction::Failed)
            }
            Err(e) => Err(e),
        }
    }

    async fn reconcile_reserved(&self, order: TakerOrder) -> AppResult<ReconcileAction> {
        // No transfer was ever requested, so an expired maker ends it outright
        let maker = self.book.get_maker_order(&order.maker_order_id).await?;
        if maker.is_expired() {
            let (_, applied) = self.book.expire_unsettled(&order.order_id).await?;
            if !applied {
                return Ok(ReconcileAction::Skipped);
            }
            info!(
                "⏭️ Taker order {} expired with maker {}",
                order.order_id, maker.order_id
            );
            return Ok(ReconcileAction::Expired);
        }

        if Self::age(&order) < self.config.resume_grace {
            return Ok(ReconcileAction::Skipped);
        }

        match self.book.resume_reservation(&order.order_id).await {
            Ok(resumed) if resumed.status == TakerOrderStatus::Settling => Ok(ReconcileAction::Resumed),
            Ok(_) => Ok(ReconcileAction::Skipped),
            Err(e) if matches!(e.order_book(), Some(OrderBookError::GatewayRejected(_))) => {
                Ok(ReconcileAction::Failed)
            }
            Err(e) => Err(e),
        }
    }
}
