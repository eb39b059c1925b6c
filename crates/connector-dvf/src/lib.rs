//! DVF market data order book feed.
//!
//! [`LocalOrderBook`] is the entry point: it subscribes to the `book` channel
//! for one symbol and keeps a local copy of the order book current.

mod client;
mod local_book;
mod parser;
mod refresh;
mod status;

pub use client::run_feed;
pub use local_book::LocalOrderBook;
pub use parser::{FrameDecoder, ParsedFrame, SubscribeRequest};
pub use refresh::{RefreshOutcome, RefreshQueue};
pub use status::SyncStatus;
