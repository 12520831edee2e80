use rust_decimal::Decimal;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use tracing::{error, warn};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Order book error: {0}")]
    OrderBook(#[from] OrderBookError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures surfaced by the order book core.
///
/// `OrderNotFound`, `OrderExpired` and `InsufficientCapacity` are terminal for
/// the attempted fill. `Conflict` is an optimistic-concurrency collision and may
/// be retried with fresh state. `GatewayUnavailable` means the outcome of the
/// external call is unknown and must be reconciled later.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderBookError {
    #[error("Invalid order spec: {0}")]
    InvalidOrderSpec(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Maker order {order_id} expired (remaining capacity {available})")]
    OrderExpired { order_id: String, available: Decimal },

    #[error("Insufficient capacity: required {required}, available {available}")]
    InsufficientCapacity { required: Decimal, available: Decimal },

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Deposit could not be verified: {0}")]
    DepositUnverified(String),

    #[error("Settlement gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Settlement gateway rejected request: {0}")]
    GatewayRejected(String),
}

impl OrderBookError {
    pub fn code(&self) -> &'static str {
        match self {
            OrderBookError::InvalidOrderSpec(_) => "INVALID_ORDER_SPEC",
            OrderBookError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            OrderBookError::OrderExpired { .. } => "ORDER_EXPIRED",
            OrderBookError::InsufficientCapacity { .. } => "INSUFFICIENT_CAPACITY",
            OrderBookError::Conflict(_) => "CONFLICT",
            OrderBookError::DepositUnverified(_) => "DEPOSIT_UNVERIFIED",
            OrderBookError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            OrderBookError::GatewayRejected(_) => "GATEWAY_REJECTED",
        }
    }

    /// Remaining maker capacity, for failures that carry it
    pub fn remaining_capacity(&self) -> Option<Decimal> {
        match self {
            OrderBookError::OrderExpired { available, .. }
            | OrderBookError::InsufficientCapacity { available, .. } => Some(*available),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrderBookError::Conflict(_) | OrderBookError::GatewayUnavailable(_)
        )
    }
}

/// Errors reported by a settlement gateway adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway request timed out after {0}ms")]
    Timeout(u64),

    #[error("Gateway unreachable: {0}")]
    Unavailable(String),

    #[error("Gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed gateway response: {0}")]
    Decode(String),
}

impl From<GatewayError> for OrderBookError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Rejected { status, message } => {
                OrderBookError::GatewayRejected(format!("{}: {}", status, message))
            }
            other => OrderBookError::GatewayUnavailable(other.to_string()),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        AppError::OrderBook(error.into())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            GatewayError::Decode(error.to_string())
        } else {
            GatewayError::Unavailable(format!("HTTP request error: {:?}", error))
        }
    }
}

/// SQLSTATEs of transactions Postgres aborted in favour of a concurrent one
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Store errors at the core boundary: aborted transactions are `Conflict`
/// (retry with fresh state), an unreachable store is `GatewayUnavailable`
/// (outcome unknown). Everything else stays a `Database` error.
impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db)
                if matches!(
                    db.code().as_deref(),
                    Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
                ) =>
            {
                warn!("Ledger transaction aborted: {}", db.message());
                OrderBookError::Conflict(format!("ledger transaction aborted: {}", db.message()))
                    .into()
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                error!("❌ Ledger store unreachable: {}", error);
                OrderBookError::GatewayUnavailable(format!("ledger store unreachable: {}", error))
                    .into()
            }
            _ => AppError::Database(error),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Internal(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl AppError {
    /// Stable error code for callers
    pub fn code(&self) -> &'static str {
        match self {
            AppError::OrderBook(e) => e.code(),
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn order_book(&self) -> Option<&OrderBookError> {
        match self {
            AppError::OrderBook(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::OrderBook(OrderBookError::Conflict(_)))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::fmt;

    #[derive(Debug)]
    struct PgError {
        code: &'static str,
        unique: bool,
    }

    impl fmt::Display for PgError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "postgres error {}", self.code)
        }
    }

    impl std::error::Error for PgError {}

    impl DatabaseError for PgError {
        fn message(&self) -> &str {
            "could not complete transaction"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            if self.unique {
                ErrorKind::UniqueViolation
            } else {
                ErrorKind::Other
            }
        }
    }

    fn pg_error(code: &'static str, unique: bool) -> sqlx::Error {
        sqlx::Error::Database(Box::new(PgError { code, unique }))
    }

    #[test]
    fn test_store_error_mapping() {
        let serialization = AppError::from(pg_error("40001", false));
        assert!(serialization.is_conflict());
        let deadlock = AppError::from(pg_error("40P01", false));
        assert!(deadlock.is_conflict());

        let unreachable = AppError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(unreachable.code(), "GATEWAY_UNAVAILABLE");
        assert!(unreachable.order_book().is_some_and(|e| e.is_retryable()));

        // Unique violations stay visible to the repository's duplicate handling
        match AppError::from(pg_error("23505", true)) {
            AppError::Database(sqlx::Error::Database(db)) => assert!(db.is_unique_violation()),
            other => panic!("unexpected mapping {:?}", other),
        }
        assert_eq!(AppError::from(sqlx::Error::RowNotFound).code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_gateway_error_mapping() {
        let rejected: OrderBookError = GatewayError::Rejected {
            status: 400,
            message: "bad address".to_string(),
        }
        .into();
        assert_eq!(rejected.code(), "GATEWAY_REJECTED");

        let timeout: OrderBookError = GatewayError::Timeout(5000).into();
        assert_eq!(timeout.code(), "GATEWAY_UNAVAILABLE");
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_remaining_capacity_surfaced() {
        let err = OrderBookError::InsufficientCapacity {
            required: dec!(5),
            available: dec!(4),
        };
        assert_eq!(err.remaining_capacity(), Some(dec!(4)));
        assert_eq!(AppError::from(err).code(), "INSUFFICIENT_CAPACITY");
    }
}
