//! One sorted side of the book.

use model::Side;
use rust_decimal::Decimal;

use crate::level::{LevelChange, PriceLevel};

/// Sorted price levels for one side of the book.
///
/// Bids are kept strictly descending and asks strictly ascending, so the
/// first level is always the best price. Prices are unique and no stored
/// level has a zero quantity.
#[derive(Debug, Clone)]
pub struct BookSide {
    side: Side,
    levels: Vec<PriceLevel>,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: Vec::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Levels in priority order (best first).
    pub fn levels(&self) -> &[PriceLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn best(&self) -> Option<PriceLevel> {
        self.levels.first().copied()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Returns true if `a` has strictly higher priority than `b` on this side.
    fn is_better(side: Side, a: Decimal, b: Decimal) -> bool {
        match side {
            Side::Bid => a > b,
            Side::Ask => a < b,
        }
    }

    /// Applies one level: insert, overwrite, or remove when `quantity` is zero.
    ///
    /// Scans from the best price until it reaches the first level that is not
    /// strictly better than `price`. Removing a price that is not present is a
    /// no-op.
    pub fn apply(&mut self, price: Decimal, quantity: Decimal) -> LevelChange {
        let side = self.side;
        let position = self
            .levels
            .iter()
            .position(|level| !Self::is_better(side, level.price, price));

        match position {
            Some(index) if self.levels[index].price == price => {
                if quantity.is_zero() {
                    self.levels.remove(index);
                    LevelChange::Removed
                } else {
                    self.levels[index].quantity = quantity;
                    LevelChange::Updated
                }
            }
            Some(index) => {
                if quantity.is_zero() {
                    return LevelChange::Ignored;
                }
                self.levels.insert(index, PriceLevel::new(price, quantity));
                LevelChange::Inserted
            }
            None => {
                if quantity.is_zero() {
                    return LevelChange::Ignored;
                }
                self.levels.push(PriceLevel::new(price, quantity));
                LevelChange::Inserted
            }
        }
    }

    /// Smallest prefix whose cumulative notional strictly exceeds `target`.
    ///
    /// Returns the whole side when the total notional never exceeds it. A
    /// running total too large for a `Decimal` exceeds any target.
    pub fn levels_for_notional(&self, target: Decimal) -> &[PriceLevel] {
        let mut cumulative = Decimal::ZERO;
        for (index, level) in self.levels.iter().enumerate() {
            match level.notional().and_then(|n| cumulative.checked_add(n)) {
                Some(total) if total <= target => cumulative = total,
                _ => return &self.levels[..=index],
            }
        }
        &self.levels
    }

    /// Sum of quantities across all levels, `None` on overflow.
    pub fn total_quantity(&self) -> Option<Decimal> {
        self.levels
            .iter()
            .try_fold(Decimal::ZERO, |total, level| total.checked_add(level.quantity))
    }
}
