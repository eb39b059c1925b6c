//! Price level representation.

use rust_decimal::Decimal;

/// A single price level in the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    /// The price at this level.
    pub price: Decimal,
    /// The aggregate quantity resting at this price. Never zero while stored.
    pub quantity: Decimal,
}

impl PriceLevel {
    /// Creates a new price level.
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Notional value (price * quantity) at this level, `None` if it does
    /// not fit in a `Decimal`.
    pub fn notional(&self) -> Option<Decimal> {
        self.price.checked_mul(self.quantity)
    }
}

/// What applying a single level did to a book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    /// A new price was inserted.
    Inserted,
    /// An existing price had its quantity overwritten.
    Updated,
    /// An existing price was removed.
    Removed,
    /// Zero quantity for a price that is not in the book.
    Ignored,
}
