use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// One `[price, count, amount]` entry as carried by book frames.
///
/// The sign of `amount` encodes the side (positive for bids, negative or zero
/// for asks). A `count` of zero marks the level for removal whatever the
/// amount says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEntry {
    pub price: Decimal,
    pub count: Decimal,
    pub amount: Decimal,
}

impl BookEntry {
    pub fn new(price: Decimal, count: Decimal, amount: Decimal) -> Self {
        Self {
            price,
            count,
            amount,
        }
    }

    /// Side encoded by the sign of the amount.
    pub fn side(&self) -> Side {
        if self.amount.is_sign_positive() && !self.amount.is_zero() {
            Side::Bid
        } else {
            Side::Ask
        }
    }

    /// Quantity to store for this level. Always non-negative; zero means remove.
    pub fn quantity(&self) -> Decimal {
        if self.count.is_zero() {
            Decimal::ZERO
        } else {
            self.amount.abs()
        }
    }

    /// Returns `(side, price, quantity)` after applying the decoding rule.
    pub fn classify(&self) -> (Side, Decimal, Decimal) {
        (self.side(), self.price, self.quantity())
    }
}
