use thiserror::Error;

use crate::store::models::ReservationStatus;
use crate::types::ReservationId;

/// Unified error type for store operations that application code can handle.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Account does not exist
    #[error("Account not found")]
    AccountNotFound,

    /// Reservation does not exist
    #[error("Reservation not found")]
    ReservationNotFound,

    /// Asset does not exist
    #[error("Asset not found")]
    AssetNotFound,

    /// Catalog model does not exist
    #[error("Model not found")]
    ModelNotFound,

    /// Catalog filter does not exist
    #[error("Filter not found")]
    FilterNotFound,

    /// The account's available balance cannot cover the requested hold.
    /// No side effects were applied.
    #[error("Insufficient available credits: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    /// A commit or cancel was attempted against a reservation that is not
    /// PROCESSING. This is a race-condition guard: it should never fire in
    /// normal operation and callers log it as a defect. The ledger is
    /// guaranteed untouched.
    #[error("Reservation {id} is {actual:?}, expected PROCESSING")]
    InvalidReservationState {
        id: ReservationId,
        actual: ReservationStatus,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type alias for store operation results
pub type Result<T> = std::result::Result<T, StoreError>;
