//! Rate-limited queue of refresh (resync) requests.

use std::time::{Duration, Instant};

use connector_core::ConnectorError;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

/// What happened to a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Accepted; the book task will resync.
    Queued,
    /// Dropped because another request was accepted less than
    /// `min_interval` ago.
    RateLimited,
}

/// Bounded per-subscription queue feeding the book task.
///
/// Accepted requests are spaced at least `min_interval` apart; anything
/// in between is dropped, not queued. A full queue means the book task
/// has stopped keeping up and is reported as [`ConnectorError::Overloaded`].
#[derive(Debug)]
pub struct RefreshQueue {
    tx: mpsc::Sender<ConnectorError>,
    min_interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl RefreshQueue {
    pub fn new(capacity: usize, min_interval: Duration) -> (Self, mpsc::Receiver<ConnectorError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            min_interval,
            last_accepted: Mutex::new(None),
        };
        (queue, rx)
    }

    pub fn request(&self, reason: ConnectorError) -> Result<RefreshOutcome, ConnectorError> {
        let mut last_accepted = self.last_accepted.lock();
        let now = Instant::now();
        if let Some(previous) = *last_accepted {
            if now.duration_since(previous) < self.min_interval {
                return Ok(RefreshOutcome::RateLimited);
            }
        }

        match self.tx.try_send(reason) {
            Ok(()) => {
                *last_accepted = Some(now);
                Ok(RefreshOutcome::Queued)
            }
            Err(TrySendError::Full(_)) => Err(ConnectorError::Overloaded),
            Err(TrySendError::Closed(_)) => Err(ConnectorError::Shutdown),
        }
    }
}
