//! Order book error types.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur during order book operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderBookError {
    /// Invalid price level (negative or zero price).
    #[error("invalid price: {0}")]
    InvalidPrice(Decimal),

    /// Invalid quantity (negative quantity).
    #[error("invalid quantity: {0}")]
    InvalidQuantity(Decimal),

    /// Order book not initialized with snapshot.
    #[error("order book not initialized - apply snapshot first")]
    NotInitialized,

    /// The book was closed and accepts no further changes.
    #[error("order book closed")]
    Closed,
}
