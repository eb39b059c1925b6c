//! Local order book for a single symbol, safe to share across threads.
//!
//! Each side is a sorted `Vec` of [`PriceLevel`]s behind its own
//! `parking_lot::RwLock`. All prices and quantities are `Decimal`, so level
//! matching is exact.
//!
//! # Example
//!
//! ```rust
//! use model::BookEntry;
//! use orderbook::OrderBook;
//! use rust_decimal_macros::dec;
//!
//! let book = OrderBook::new("ETH:USDT");
//!
//! // Positive amounts are bids, negative amounts are asks.
//! book.apply_snapshot(&[
//!     BookEntry::new(dec!(100.0), dec!(1), dec!(5)),
//!     BookEntry::new(dec!(100.5), dec!(2), dec!(-3)),
//! ])
//! .unwrap();
//!
//! println!("Best bid: {:?}", book.best_bid());
//! println!("Best ask: {:?}", book.best_ask());
//! println!("Mid price: {:?}", book.mid_price());
//! ```

mod book;
mod error;
mod level;
mod side;

pub use book::{BookRead, OrderBook};
pub use error::OrderBookError;
pub use level::{LevelChange, PriceLevel};
pub use side::BookSide;
