use std::fmt;
use std::time::Duration;

use common::MarketDataEndpoint;
use model::{BookEntry, Side};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised while keeping a local book in sync.
///
/// Connection and protocol failures are recovered by resyncing. `Overloaded`
/// is terminal for the subscription. `Shutdown` and `ChannelClosed` mean the
/// subscription is being torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No frame received for {0:?}")]
    ReadTimeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Book side {0} empty while marked ready")]
    StaleBook(Side),

    #[error("Refresh requested: {0}")]
    RefreshRequested(String),

    #[error("Refresh queue saturated")]
    Overloaded,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Shutdown requested")]
    Shutdown,
}

impl ConnectorError {
    /// Whether this failure is handled by resyncing the book.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Overloaded | Self::Shutdown | Self::ChannelClosed
        )
    }
}

/// Malformed or unexpected frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("channel id mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: u64, actual: u64 },

    #[error("snapshot received after the book was initialized")]
    UnexpectedSnapshot,

    #[error("update received before the initial snapshot")]
    MissingSnapshot,

    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// Configuration for one order book subscription.
#[derive(Debug, Clone)]
pub struct BookConfig {
    /// Market symbol, `BASE:QUOTE`. Upper-cased on subscribe.
    pub symbol: String,
    /// Channel name sent in the subscribe request.
    pub channel: String,
    pub endpoint: MarketDataEndpoint,
    /// Idle window after which a connection is considered dead.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    /// Capacity of the decoded event channel between the two tasks.
    pub event_capacity: usize,
    /// Capacity of the refresh request queue.
    pub refresh_capacity: usize,
    /// Minimum spacing between accepted refresh requests.
    pub min_refresh_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Sessions shorter than this count as rapid failures.
    pub stable_connection_threshold: Duration,
    /// Consecutive rapid failures before giving up with `Overloaded`. 0 disables.
    pub max_rapid_failures: u32,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            symbol: "ETH:USDT".to_string(),
            channel: "book".to_string(),
            endpoint: MarketDataEndpoint::default(),
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            event_capacity: 50,
            refresh_capacity: 5,
            min_refresh_interval: Duration::from_secs(3),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            stable_connection_threshold: Duration::from_secs(60),
            max_rapid_failures: 10,
        }
    }
}

impl BookConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `DVF_ENDPOINT`, `DVF_READ_TIMEOUT_SECS` and
    /// `DVF_BOOK_CHANNEL` when set.
    pub fn from_env(symbol: impl Into<String>) -> Self {
        let mut config = Self::new(symbol);
        config.endpoint = MarketDataEndpoint::from_env();
        if let Some(secs) = std::env::var("DVF_READ_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Ok(channel) = std::env::var("DVF_BOOK_CHANNEL") {
            if !channel.trim().is_empty() {
                config.channel = channel.trim().to_string();
            }
        }
        config
    }

    /// Symbol as sent on the wire.
    pub fn wire_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }
}

/// Decoded feed events passed from the connection task to the book task.
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    /// Full book, first frame of a connection.
    Snapshot(Vec<BookEntry>),
    /// Single level delta.
    Update(BookEntry),
    /// The connection ended; emitted before the connection task reconnects.
    Disconnected(ConnectorError),
}

pub type EventSender = mpsc::Sender<BookEvent>;
pub type EventReceiver = mpsc::Receiver<BookEvent>;

pub fn create_event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Dialing the endpoint.
    Connecting,
    /// Connected and subscribed, waiting for the snapshot.
    Syncing,
    /// Snapshot applied, following updates.
    Synced,
    /// A failure was detected; the book is cleared and a reconnect is pending.
    Resyncing,
    /// Closed by the owner.
    Closed,
    /// Gave up after the refresh queue saturated or reconnects kept failing.
    Failed,
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Resyncing => "resyncing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BookConfig::default();
        assert_eq!(config.channel, "book");
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.event_capacity, 50);
        assert_eq!(config.refresh_capacity, 5);
        assert_eq!(config.min_refresh_interval, Duration::from_secs(3));
        assert!(config.endpoint.is_production());
    }

    #[test]
    fn test_wire_symbol_is_uppercase() {
        let config = BookConfig::new("eth:usdt");
        assert_eq!(config.wire_symbol(), "ETH:USDT");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(ConnectorError::ReadTimeout(Duration::from_secs(30)).is_recoverable());
        assert!(ConnectorError::from(ProtocolError::ChannelMismatch {
            expected: 7,
            actual: 8
        })
        .is_recoverable());
        assert!(ConnectorError::StaleBook(Side::Bid).is_recoverable());
        assert!(!ConnectorError::Overloaded.is_recoverable());
        assert!(!ConnectorError::Shutdown.is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = ConnectorError::from(ProtocolError::ChannelMismatch {
            expected: 7,
            actual: 9,
        });
        assert_eq!(
            err.to_string(),
            "Protocol error: channel id mismatch: expected 7, got 9"
        );
        assert_eq!(
            ConnectorError::StaleBook(Side::Ask).to_string(),
            "Book side ask empty while marked ready"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(SyncState::Closed.is_terminal());
        assert!(SyncState::Failed.is_terminal());
        assert!(!SyncState::Resyncing.is_terminal());
        assert_eq!(SyncState::Synced.to_string(), "synced");
    }
}
