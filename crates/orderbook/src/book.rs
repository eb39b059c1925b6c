//! Concurrent order book with independently locked sides.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use model::{BookEntry, Side};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, trace};

use crate::error::OrderBookError;
use crate::level::{LevelChange, PriceLevel};
use crate::side::BookSide;

/// Outcome of a read against the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookRead<T> {
    /// No snapshot has been applied since the last reset.
    NotReady,
    /// The book claims readiness but the given side is empty.
    Stale(Side),
    /// Data observed under the side lock(s).
    Ready(T),
}

impl<T> BookRead<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, BookRead::Ready(_))
    }

    /// Returns the data, or `None` when not ready or stale.
    pub fn ready(self) -> Option<T> {
        match self {
            BookRead::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Local order book shared between one writer and many readers.
///
/// Bids and asks sit behind separate `RwLock`s so a reader of one side is
/// never blocked by writes to the other. A reader that fetches both sides
/// with two calls may see a bid change without the matching ask change;
/// [`OrderBook::both_sides`] holds both read locks when that matters.
///
/// `ready` and `closed` only change while both write locks are held (bids
/// first, then asks), so a reader holding either side lock sees them
/// consistently with that side's contents.
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    bids: RwLock<BookSide>,
    asks: RwLock<BookSide>,
    ready: AtomicBool,
    closed: AtomicBool,
    updated_at_ms: AtomicI64,
}

impl OrderBook {
    /// Creates a new empty order book for the given symbol.
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: RwLock::new(BookSide::new(Side::Bid)),
            asks: RwLock::new(BookSide::new(Side::Ask)),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            updated_at_ms: AtomicI64::new(0),
        }
    }

    /// Returns the symbol this order book tracks.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Returns whether a full snapshot has been applied since the last reset.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wall-clock milliseconds of the last applied change, 0 if none yet.
    pub fn updated_at_ms(&self) -> i64 {
        self.updated_at_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.updated_at_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn side_lock(&self, side: Side) -> &RwLock<BookSide> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Replaces both sides with the snapshot entries and marks the book ready.
    ///
    /// Each entry goes through the same level algorithm as incremental
    /// updates, so applying the same snapshot twice gives the same book.
    pub fn apply_snapshot(&self, entries: &[BookEntry]) -> Result<(), OrderBookError> {
        let mut bids = self.bids.write();
        let mut asks = self.asks.write();
        if self.is_closed() {
            return Err(OrderBookError::Closed);
        }

        bids.clear();
        asks.clear();
        for entry in entries {
            let (side, price, quantity) = entry.classify();
            if price <= Decimal::ZERO {
                debug!(symbol = %self.symbol, price = %price, "skipping snapshot level with invalid price");
                continue;
            }
            match side {
                Side::Bid => bids.apply(price, quantity),
                Side::Ask => asks.apply(price, quantity),
            };
        }

        self.ready.store(true, Ordering::Release);
        self.touch();
        debug!(
            symbol = %self.symbol,
            bids = bids.len(),
            asks = asks.len(),
            "snapshot applied"
        );
        Ok(())
    }

    /// Applies one incremental entry on top of a ready book.
    pub fn apply_update(&self, entry: &BookEntry) -> Result<LevelChange, OrderBookError> {
        let (side, price, quantity) = entry.classify();
        if !self.is_ready() {
            return Err(OrderBookError::NotInitialized);
        }
        self.apply_level(side, price, quantity)
    }

    /// Inserts, overwrites or removes (zero quantity) one level on a side.
    pub fn apply_level(
        &self,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<LevelChange, OrderBookError> {
        if price <= Decimal::ZERO {
            return Err(OrderBookError::InvalidPrice(price));
        }
        if quantity.is_sign_negative() && !quantity.is_zero() {
            return Err(OrderBookError::InvalidQuantity(quantity));
        }

        let mut levels = self.side_lock(side).write();
        if self.is_closed() {
            return Err(OrderBookError::Closed);
        }
        let change = levels.apply(price, quantity);
        drop(levels);

        if change != LevelChange::Ignored {
            self.touch();
        }
        trace!(symbol = %self.symbol, side = %side, price = %price, quantity = %quantity, change = ?change, "level applied");
        Ok(change)
    }

    /// Clears both sides and marks the book not ready.
    pub fn reset(&self) {
        let mut bids = self.bids.write();
        let mut asks = self.asks.write();
        self.ready.store(false, Ordering::Release);
        bids.clear();
        asks.clear();
    }

    /// Resets the book and refuses all further changes. Idempotent.
    pub fn close(&self) {
        let mut bids = self.bids.write();
        let mut asks = self.asks.write();
        self.closed.store(true, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        bids.clear();
        asks.clear();
    }

    fn read_side<T>(&self, side: Side, f: impl FnOnce(&BookSide) -> T) -> BookRead<T> {
        let levels = self.side_lock(side).read();
        if !self.is_ready() {
            return BookRead::NotReady;
        }
        if levels.is_empty() {
            return BookRead::Stale(side);
        }
        BookRead::Ready(f(&levels))
    }

    /// All bid levels, highest price first.
    pub fn bids(&self) -> BookRead<Vec<PriceLevel>> {
        self.read_side(Side::Bid, |levels| levels.levels().to_vec())
    }

    /// All ask levels, lowest price first.
    pub fn asks(&self) -> BookRead<Vec<PriceLevel>> {
        self.read_side(Side::Ask, |levels| levels.levels().to_vec())
    }

    /// Best bids whose cumulative notional strictly exceeds `value`.
    pub fn bids_for_notional(&self, value: Decimal) -> BookRead<Vec<PriceLevel>> {
        self.read_side(Side::Bid, |levels| levels.levels_for_notional(value).to_vec())
    }

    /// Best asks whose cumulative notional strictly exceeds `value`.
    pub fn asks_for_notional(&self, value: Decimal) -> BookRead<Vec<PriceLevel>> {
        self.read_side(Side::Ask, |levels| levels.levels_for_notional(value).to_vec())
    }

    /// Both sides observed under both read locks at once.
    pub fn both_sides(&self) -> BookRead<(Vec<PriceLevel>, Vec<PriceLevel>)> {
        let bids = self.bids.read();
        let asks = self.asks.read();
        if !self.is_ready() {
            return BookRead::NotReady;
        }
        if bids.is_empty() {
            return BookRead::Stale(Side::Bid);
        }
        if asks.is_empty() {
            return BookRead::Stale(Side::Ask);
        }
        BookRead::Ready((bids.levels().to_vec(), asks.levels().to_vec()))
    }

    /// Returns the best (highest) bid price level.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.read_side(Side::Bid, BookSide::best).ready().flatten()
    }

    /// Returns the best (lowest) ask price level.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.read_side(Side::Ask, BookSide::best).ready().flatten()
    }

    /// Returns the mid price (average of best bid and best ask).
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some(bid.price.checked_add(ask.price)? / Decimal::TWO)
    }

    /// Returns the spread (best ask - best bid).
    pub fn spread(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        ask.price.checked_sub(bid.price)
    }

    /// Returns the total number of bid levels.
    pub fn bid_levels(&self) -> usize {
        self.bids.read().len()
    }

    /// Returns the total number of ask levels.
    pub fn ask_levels(&self) -> usize {
        self.asks.read().len()
    }
}
