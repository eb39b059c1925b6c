//! Self-maintaining local order book for one symbol.
//!
//! [`LocalOrderBook::subscribe`] spawns two tasks joined by a bounded event
//! channel:
//!
//! - the feed task ([`run_feed`]) owns the websocket, decodes frames and
//!   reconnects with backoff;
//! - the book task applies snapshots and updates to the shared
//!   [`OrderBook`] and drives resyncs.
//!
//! Reads never touch the network. A read that finds one side empty while the
//! book claims to be ready reports not-ready and asks for a refresh through a
//! rate-limited [`RefreshQueue`]; if that queue is saturated the subscription
//! fails with [`ConnectorError::Overloaded`].
//!
//! Resyncs clear the book as soon as they start, so readers never see levels
//! from a connection that has been abandoned.

use std::sync::Arc;

use connector_core::{
    create_event_channel, BookConfig, BookEvent, ConnectorError, EventReceiver, SyncState,
};
use metrics::{create_metrics, SharedMetrics};
use orderbook::{BookRead, OrderBook, OrderBookError, PriceLevel};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::run_feed;
use crate::refresh::{RefreshOutcome, RefreshQueue};
use crate::status::SyncStatus;

/// State shared between the handle and its two tasks.
struct Shared {
    book: OrderBook,
    status: Arc<SyncStatus>,
    refresh: RefreshQueue,
    metrics: SharedMetrics,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn request_refresh(&self, reason: ConnectorError) -> Result<RefreshOutcome, ConnectorError> {
        match self.refresh.request(reason.clone()) {
            Ok(RefreshOutcome::Queued) => {
                self.metrics.inc_refresh_requests_accepted();
                debug!(symbol = %self.book.symbol(), reason = %reason, "Refresh queued");
                Ok(RefreshOutcome::Queued)
            }
            Ok(RefreshOutcome::RateLimited) => {
                self.metrics.inc_refresh_requests_dropped();
                debug!(symbol = %self.book.symbol(), reason = %reason, "Refresh dropped, too soon after the last one");
                Ok(RefreshOutcome::RateLimited)
            }
            Err(ConnectorError::Overloaded) => {
                self.metrics.inc_refresh_requests_dropped();
                self.fail(ConnectorError::Overloaded);
                Err(ConnectorError::Overloaded)
            }
            Err(e) => Err(e),
        }
    }

    /// Clears the book and enters `Resyncing`. Returns false when the
    /// subscription is already closed or failed.
    fn resync(&self, cause: &ConnectorError) -> bool {
        if !self.status.transition(SyncState::Resyncing) {
            return false;
        }
        self.book.reset();
        self.metrics.inc_resyncs();
        warn!(symbol = %self.book.symbol(), cause = %cause, "Resyncing order book");
        true
    }

    /// Clears the book after the feed lost a session nobody asked it to
    /// drop. The state only moves from `Synced` to `Resyncing`; the feed may
    /// already be connecting again and owns the state until the next
    /// snapshot. Returns false when the subscription is closed or failed.
    fn reset_after_disconnect(&self, cause: &ConnectorError) -> bool {
        if self.status.get().is_terminal() {
            return false;
        }
        self.status.transition_from(SyncState::Synced, SyncState::Resyncing);
        self.book.reset();
        self.metrics.inc_resyncs();
        warn!(symbol = %self.book.symbol(), cause = %cause, "Resyncing order book");
        true
    }

    fn fail(&self, error: ConnectorError) {
        if self.status.fail(error.clone()) {
            error!(symbol = %self.book.symbol(), error = %error, "Order book subscription failed");
        }
        self.book.close();
        self.shutdown_tx.send_replace(true);
    }

    fn close(&self) {
        self.book.close();
        if self.status.transition(SyncState::Closed) {
            info!(symbol = %self.book.symbol(), "Order book closed");
        }
        self.shutdown_tx.send_replace(true);
    }
}

/// Local order book kept in sync with the exchange feed.
///
/// Dropping the handle closes the subscription.
pub struct LocalOrderBook {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalOrderBook {
    /// Start syncing `config.symbol`. Must be called from within a Tokio runtime.
    pub fn subscribe(config: BookConfig) -> Self {
        Self::subscribe_with_metrics(config, create_metrics())
    }

    pub fn subscribe_with_metrics(config: BookConfig, metrics: SharedMetrics) -> Self {
        let config = Arc::new(config);
        let (refresh, refresh_rx) =
            RefreshQueue::new(config.refresh_capacity, config.min_refresh_interval);
        let (event_tx, event_rx) = create_event_channel(config.event_capacity.max(1));
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            book: OrderBook::new(config.wire_symbol()),
            status: Arc::new(SyncStatus::new()),
            refresh,
            metrics: metrics.clone(),
            shutdown_tx,
        });

        info!(
            symbol = %shared.book.symbol(),
            endpoint = %config.endpoint,
            channel = %config.channel,
            "Subscribing to order book"
        );

        let feed = {
            let shared = shared.clone();
            let feed = run_feed(
                config,
                event_tx,
                restart_rx,
                shutdown_rx.clone(),
                shared.status.clone(),
                metrics,
            );
            tokio::spawn(async move {
                match feed.await {
                    Ok(()) | Err(ConnectorError::ChannelClosed) | Err(ConnectorError::Shutdown) => {}
                    Err(e) => shared.fail(e),
                }
            })
        };
        let book_task = tokio::spawn(maintain_book(
            shared.clone(),
            event_rx,
            refresh_rx,
            restart_tx,
            shutdown_rx,
        ));

        Self {
            shared,
            tasks: Mutex::new(vec![feed, book_task]),
        }
    }

    pub fn symbol(&self) -> &str {
        self.shared.book.symbol()
    }

    /// All bids, best first, and whether the book is ready.
    pub fn get_bids(&self) -> (Vec<PriceLevel>, bool) {
        self.observe(self.shared.book.bids())
    }

    /// All asks, best first, and whether the book is ready.
    pub fn get_asks(&self) -> (Vec<PriceLevel>, bool) {
        self.observe(self.shared.book.asks())
    }

    /// Shortest run of best bids whose notional strictly exceeds `value`,
    /// or every bid if the whole side does not.
    pub fn get_bids_for_notional(&self, value: Decimal) -> (Vec<PriceLevel>, bool) {
        self.observe(self.shared.book.bids_for_notional(value))
    }

    /// Shortest run of best asks whose notional strictly exceeds `value`,
    /// or every ask if the whole side does not.
    pub fn get_asks_for_notional(&self, value: Decimal) -> (Vec<PriceLevel>, bool) {
        self.observe(self.shared.book.asks_for_notional(value))
    }

    /// Bids and asks read under both side locks, so they belong to the same
    /// moment of the book.
    pub fn get_both_sides(&self) -> (Vec<PriceLevel>, Vec<PriceLevel>, bool) {
        let ((bids, asks), ready) = self.observe(self.shared.book.both_sides());
        (bids, asks, ready)
    }

    /// An empty side on a ready book means the book went stale: report
    /// not-ready and ask for a refresh.
    fn observe<T: Default>(&self, read: BookRead<T>) -> (T, bool) {
        match read {
            BookRead::Ready(value) => (value, true),
            BookRead::NotReady => (T::default(), false),
            BookRead::Stale(side) => {
                // Overload already failed the subscription; the read stays not-ready either way.
                let _ = self.shared.request_refresh(ConnectorError::StaleBook(side));
                (T::default(), false)
            }
        }
    }

    /// Ask for a resync, subject to the same rate limit as staleness
    /// refreshes. `Err(Overloaded)` means the subscription has failed.
    pub fn request_refresh(&self, reason: impl Into<String>) -> Result<RefreshOutcome, ConnectorError> {
        if self.state().is_terminal() {
            return Err(self.failure().unwrap_or(ConnectorError::Shutdown));
        }
        self.shared
            .request_refresh(ConnectorError::RefreshRequested(reason.into()))
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.shared.book.best_bid()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.shared.book.best_ask()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        self.shared.book.mid_price()
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.shared.book.spread()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.book.is_ready()
    }

    /// Wall-clock milliseconds of the last change applied to the book.
    pub fn updated_at_ms(&self) -> i64 {
        self.shared.book.updated_at_ms()
    }

    pub fn state(&self) -> SyncState {
        self.shared.status.get()
    }

    /// The error that ended the subscription, if it failed.
    pub fn failure(&self) -> Option<ConnectorError> {
        self.shared.status.failure()
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.shared.metrics
    }

    /// Clears the book and stops both tasks. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// [`close`](Self::close), then wait for both tasks to exit.
    pub async fn shutdown(&self) {
        self.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(symbol = %self.symbol(), error = %e, "Order book task panicked");
            }
        }
    }
}

impl Drop for LocalOrderBook {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Applies feed events to the book and turns refresh requests into restarts
/// of the feed session.
async fn maintain_book(
    shared: Arc<Shared>,
    mut events: EventReceiver,
    mut refresh_rx: mpsc::Receiver<ConnectorError>,
    restart_tx: mpsc::Sender<ConnectorError>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let symbol = shared.book.symbol().to_string();
    // Set while the feed is tearing down a session we asked it to restart.
    // Events still queued from that session are skipped until its
    // `Disconnected` arrives.
    let mut awaiting_disconnect = false;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(symbol = %symbol, "Book task stopping");
                    return;
                }
            }

            reason = refresh_rx.recv() => {
                let Some(reason) = reason else { return };
                // Apply what the feed has already queued. A `Disconnected`
                // there means the session is gone and a restart would only
                // drop its successor.
                for _ in 0..events.len() {
                    let Ok(event) = events.try_recv() else { break };
                    if !apply_event(&shared, event, &mut awaiting_disconnect, &restart_tx) {
                        return;
                    }
                }
                if awaiting_disconnect
                    || !matches!(shared.status.get(), SyncState::Syncing | SyncState::Synced)
                {
                    debug!(symbol = %symbol, reason = %reason, "Resync already in progress");
                    continue;
                }
                if !shared.resync(&reason) {
                    return;
                }
                awaiting_disconnect = true;
                // A full slot means a restart is already pending.
                let _ = restart_tx.try_send(reason);
            }

            event = events.recv() => {
                let Some(event) = event else {
                    debug!(symbol = %symbol, "Feed stopped, book task exiting");
                    return;
                };
                if !apply_event(&shared, event, &mut awaiting_disconnect, &restart_tx) {
                    return;
                }
            }
        }
    }
}

/// Applies one feed event. Returns false once the book task should stop.
fn apply_event(
    shared: &Shared,
    event: BookEvent,
    awaiting_disconnect: &mut bool,
    restart_tx: &mpsc::Sender<ConnectorError>,
) -> bool {
    let symbol = shared.book.symbol();
    match event {
        BookEvent::Disconnected(cause) => {
            if *awaiting_disconnect {
                *awaiting_disconnect = false;
            } else if !shared.reset_after_disconnect(&cause) {
                return false;
            }
        }
        _ if *awaiting_disconnect => {}
        BookEvent::Snapshot(entries) => match shared.book.apply_snapshot(&entries) {
            Ok(()) => {
                shared.metrics.inc_snapshots_applied();
                if shared.status.transition(SyncState::Synced) {
                    info!(
                        symbol = %symbol,
                        bids = shared.book.bid_levels(),
                        asks = shared.book.ask_levels(),
                        "Order book synchronized"
                    );
                }
            }
            Err(OrderBookError::Closed) => return false,
            Err(e) => warn!(symbol = %symbol, error = %e, "Failed to apply snapshot"),
        },
        BookEvent::Update(entry) => match shared.book.apply_update(&entry) {
            Ok(_) => shared.metrics.inc_updates_applied(),
            Err(OrderBookError::NotInitialized) => {
                debug!(symbol = %symbol, "Dropping update for a book that is not ready");
            }
            Err(OrderBookError::Closed) => return false,
            Err(e) => {
                let cause = ConnectorError::RefreshRequested(e.to_string());
                if !shared.resync(&cause) {
                    return false;
                }
                *awaiting_disconnect = true;
                let _ = restart_tx.try_send(cause);
            }
        },
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MarketDataEndpoint;
    use futures_util::{SinkExt, StreamExt};
    use model::{BookEntry, Side};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

    type ServerConn = WebSocketStream<TcpStream>;

    /// Local websocket server handing each accepted connection to the test.
    async fn start_server() -> (String, mpsc::UnboundedReceiver<ServerConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        (url, rx)
    }

    fn test_config(url: String) -> BookConfig {
        BookConfig {
            endpoint: MarketDataEndpoint::Custom(url),
            min_refresh_interval: Duration::ZERO,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            max_rapid_failures: 0,
            ..BookConfig::new("eth:usdt")
        }
    }

    async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
        let mut conn = tokio::time::timeout(Duration::from_secs(5), conns.recv())
            .await
            .expect("no connection")
            .unwrap();
        let subscribe = conn.next().await.unwrap().unwrap();
        assert_eq!(
            subscribe,
            Message::Text(r#"{"event":"subscribe","channel":"book","symbol":"ETH:USDT"}"#.into())
        );
        conn
    }

    async fn send(conn: &mut ServerConn, frame: &str) {
        conn.send(Message::Text(frame.to_string())).await.unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn level(price: Decimal, quantity: Decimal) -> PriceLevel {
        PriceLevel::new(price, quantity)
    }

    #[tokio::test]
    async fn test_snapshot_then_update() {
        let (url, mut conns) = start_server().await;
        let book = LocalOrderBook::subscribe(test_config(url));
        assert_eq!(book.get_bids(), (vec![], false));

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, r#"{"event":"subscribed","channel":"book","chanId":7}"#).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        assert_eq!(book.state(), SyncState::Synced);
        assert_eq!(book.get_bids(), (vec![level(dec!(100.0), dec!(5))], true));
        assert_eq!(book.get_asks(), (vec![level(dec!(99.5), dec!(3))], true));

        send(&mut conn, "[7, [100.0, 0, 5]]").await;
        wait_until(|| book.best_bid().is_none()).await;
        assert_eq!(book.best_ask(), Some(level(dec!(99.5), dec!(3))));
        assert_eq!(book.metrics().snapshots_applied(), 1);
        assert_eq!(book.metrics().updates_applied(), 1);

        book.shutdown().await;
    }

    #[tokio::test]
    async fn test_notional_reads() {
        let (url, mut conns) = start_server().await;
        let book = LocalOrderBook::subscribe(test_config(url));

        let mut conn = next_conn(&mut conns).await;
        send(
            &mut conn,
            "[3, [[100, 1, 1], [99, 1, 2], [98, 1, 3], [101, 1, -1], [102, 1, -1]]]",
        )
        .await;
        wait_until(|| book.is_ready()).await;

        let (bids, ready) = book.get_bids_for_notional(dec!(150));
        assert!(ready);
        assert_eq!(bids, vec![level(dec!(100), dec!(1)), level(dec!(99), dec!(2))]);

        let (asks, ready) = book.get_asks_for_notional(dec!(10000));
        assert!(ready);
        assert_eq!(asks.len(), 2);

        let (bids, asks, ready) = book.get_both_sides();
        assert!(ready);
        assert_eq!((bids.len(), asks.len()), (3, 2));
        assert_eq!(book.spread(), Some(dec!(1)));

        book.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_side_triggers_refresh() {
        let (url, mut conns) = start_server().await;
        let book = LocalOrderBook::subscribe(test_config(url));

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        send(&mut conn, "[7, [100.0, 0, 5]]").await;
        wait_until(|| book.best_bid().is_none()).await;

        assert_eq!(book.get_bids(), (vec![], false));
        assert_eq!(book.metrics().refresh_requests_accepted(), 1);

        // The book task restarts the session on a fresh connection.
        let mut conn = next_conn(&mut conns).await;
        assert!(!book.is_ready());
        send(&mut conn, "[8, [[101.0, 1, 2], [102.0, 1, -1]]]").await;
        wait_until(|| book.is_ready()).await;

        assert_eq!(book.get_bids(), (vec![level(dec!(101.0), dec!(2))], true));
        assert_eq!(book.metrics().resyncs(), 1);

        book.shutdown().await;
    }

    #[tokio::test]
    async fn test_channel_mismatch_resyncs() {
        let (url, mut conns) = start_server().await;
        let book = LocalOrderBook::subscribe(test_config(url));

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        send(&mut conn, "[8, [100.0, 1, 6]]").await;
        wait_until(|| !book.is_ready()).await;
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.metrics().decode_errors(), 1);

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[9, [[100.0, 1, 6], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;
        assert_eq!(book.best_bid(), Some(level(dec!(100.0), dec!(6))));

        book.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_timeout_resyncs() {
        let (url, mut conns) = start_server().await;
        let mut config = test_config(url);
        config.read_timeout = Duration::from_millis(200);
        let book = LocalOrderBook::subscribe(config);

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        // Silence on the first connection; the feed gives up on it and redials.
        let _second = next_conn(&mut conns).await;
        wait_until(|| !book.is_ready()).await;
        assert!(book.metrics().read_timeouts() >= 1);

        book.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeats_keep_connection_alive() {
        let (url, mut conns) = start_server().await;
        let mut config = test_config(url);
        config.read_timeout = Duration::from_millis(300);
        let book = LocalOrderBook::subscribe(config);

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            send(&mut conn, r#"[7, "hb"]"#).await;
        }

        assert!(book.is_ready());
        assert_eq!(book.metrics().read_timeouts(), 0);
        assert!(conns.try_recv().is_err());

        book.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_clears_and_stops() {
        let (url, mut conns) = start_server().await;
        let book = LocalOrderBook::subscribe(test_config(url));

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        book.close();
        assert!(!book.is_ready());
        assert_eq!(book.get_bids(), (vec![], false));
        assert_eq!(book.get_asks(), (vec![], false));
        assert_eq!(book.state(), SyncState::Closed);

        book.close();
        tokio::time::timeout(Duration::from_secs(1), book.shutdown())
            .await
            .unwrap();
        assert_eq!(book.state(), SyncState::Closed);
        assert_eq!(book.failure(), None);

        // The feed closed its side of the socket.
        let end = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match conn.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn test_request_refresh_is_rate_limited() {
        let (url, mut conns) = start_server().await;
        let mut config = test_config(url);
        config.min_refresh_interval = Duration::from_secs(60);
        let book = LocalOrderBook::subscribe(config);

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        assert_eq!(book.request_refresh("manual"), Ok(RefreshOutcome::Queued));
        assert_eq!(book.request_refresh("again"), Ok(RefreshOutcome::RateLimited));
        assert_eq!(book.metrics().refresh_requests_dropped(), 1);

        let mut conn = next_conn(&mut conns).await;
        send(&mut conn, "[7, [[100.0, 1, 5], [99.5, 1, -3]]]").await;
        wait_until(|| book.is_ready()).await;

        book.shutdown().await;
        assert_eq!(book.request_refresh("late"), Err(ConnectorError::Shutdown));
    }

    #[tokio::test]
    async fn test_rapid_failures_fail_the_subscription() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut config = test_config(url);
        config.max_rapid_failures = 3;
        let book = LocalOrderBook::subscribe(config);

        wait_until(|| book.state() == SyncState::Failed).await;
        assert_eq!(book.failure(), Some(ConnectorError::Overloaded));
        assert_eq!(book.get_bids(), (vec![], false));
        assert_eq!(
            book.request_refresh("retry"),
            Err(ConnectorError::Overloaded)
        );

        tokio::time::timeout(Duration::from_secs(1), book.shutdown())
            .await
            .unwrap();
    }

    /// `Shared` without feed or book tasks; the refresh receiver is handed
    /// back so the test decides whether it gets drained.
    fn detached(
        refresh_capacity: usize,
    ) -> (Arc<Shared>, mpsc::Receiver<ConnectorError>, watch::Receiver<bool>) {
        let (refresh, refresh_rx) = RefreshQueue::new(refresh_capacity, Duration::ZERO);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            book: OrderBook::new("ETH:USDT"),
            status: Arc::new(SyncStatus::new()),
            refresh,
            metrics: create_metrics(),
            shutdown_tx,
        });
        (shared, refresh_rx, shutdown_rx)
    }

    fn snapshot() -> BookEvent {
        BookEvent::Snapshot(vec![
            BookEntry::new(dec!(100.0), dec!(1), dec!(5)),
            BookEntry::new(dec!(99.5), dec!(1), dec!(-3)),
        ])
    }

    #[tokio::test]
    async fn test_full_refresh_queue_fails_the_subscription() {
        let (shared, _refresh_rx, shutdown_rx) = detached(1);
        let (restart_tx, _restart_rx) = mpsc::channel(1);
        assert!(apply_event(&shared, snapshot(), &mut false, &restart_tx));
        assert!(shared.book.is_ready());

        assert_eq!(
            shared.request_refresh(ConnectorError::StaleBook(Side::Bid)),
            Ok(RefreshOutcome::Queued)
        );
        assert_eq!(
            shared.request_refresh(ConnectorError::StaleBook(Side::Ask)),
            Err(ConnectorError::Overloaded)
        );

        assert_eq!(shared.status.get(), SyncState::Failed);
        assert_eq!(shared.status.failure(), Some(ConnectorError::Overloaded));
        assert!(shared.book.is_closed());
        assert!(!shared.book.is_ready());
        assert!(*shutdown_rx.borrow());
        assert_eq!(shared.metrics.refresh_requests_accepted(), 1);
        assert_eq!(shared.metrics.refresh_requests_dropped(), 1);
    }

    #[test]
    fn test_late_disconnect_keeps_the_new_session_state() {
        let (shared, _refresh_rx, _shutdown_rx) = detached(4);
        let (restart_tx, mut restart_rx) = mpsc::channel(1);
        let mut awaiting = false;

        assert!(apply_event(&shared, snapshot(), &mut awaiting, &restart_tx));
        assert_eq!(shared.status.get(), SyncState::Synced);

        // The feed has already dialled the next session when the book task
        // gets to the previous one's `Disconnected`.
        shared.status.transition(SyncState::Syncing);
        let disconnected = BookEvent::Disconnected(ConnectorError::ConnectionClosed);
        assert!(apply_event(&shared, disconnected, &mut awaiting, &restart_tx));

        assert_eq!(shared.status.get(), SyncState::Syncing);
        assert!(!shared.book.is_ready());
        assert_eq!(shared.metrics.resyncs(), 1);
        assert!(restart_rx.try_recv().is_err());

        assert!(apply_event(&shared, snapshot(), &mut awaiting, &restart_tx));
        assert_eq!(shared.status.get(), SyncState::Synced);
    }

    #[test]
    fn test_disconnect_while_synced_enters_resyncing() {
        let (shared, _refresh_rx, _shutdown_rx) = detached(4);
        let (restart_tx, _restart_rx) = mpsc::channel(1);
        let mut awaiting = false;

        assert!(apply_event(&shared, snapshot(), &mut awaiting, &restart_tx));
        let disconnected = BookEvent::Disconnected(ConnectorError::ConnectionClosed);
        assert!(apply_event(&shared, disconnected, &mut awaiting, &restart_tx));
        assert_eq!(shared.status.get(), SyncState::Resyncing);

        shared.close();
        let disconnected = BookEvent::Disconnected(ConnectorError::ConnectionClosed);
        assert!(!apply_event(&shared, disconnected, &mut awaiting, &restart_tx));
        assert_eq!(shared.status.get(), SyncState::Closed);
    }

    #[tokio::test]
    async fn test_refresh_behind_queued_disconnect_does_not_restart_feed() {
        let (shared, refresh_rx, shutdown_rx) = detached(4);
        let (event_tx, event_rx) = create_event_channel(16);
        let (restart_tx, mut restart_rx) = mpsc::channel(1);
        let task = tokio::spawn(maintain_book(
            shared.clone(),
            event_rx,
            refresh_rx,
            restart_tx,
            shutdown_rx,
        ));

        event_tx.send(snapshot()).await.unwrap();
        wait_until(|| shared.status.get() == SyncState::Synced).await;

        // Both land before the book task runs again.
        event_tx
            .try_send(BookEvent::Disconnected(ConnectorError::ConnectionClosed))
            .unwrap();
        assert_eq!(
            shared.request_refresh(ConnectorError::StaleBook(Side::Bid)),
            Ok(RefreshOutcome::Queued)
        );
        wait_until(|| shared.metrics.resyncs() == 1).await;
        assert_eq!(shared.status.get(), SyncState::Resyncing);

        event_tx.send(snapshot()).await.unwrap();
        wait_until(|| shared.book.is_ready()).await;

        assert_eq!(shared.status.get(), SyncState::Synced);
        assert_eq!(shared.metrics.resyncs(), 1);
        assert!(restart_rx.try_recv().is_err());

        shared.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
