use std::sync::Arc;
use std::time::Duration;

use common::{ExponentialBackoff, RetryBudget};
use connector_core::{BookConfig, BookEvent, ConnectorError, EventSender, SyncState};
use futures_util::{SinkExt, StreamExt};
use metrics::SharedMetrics;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::parser::{FrameDecoder, ParsedFrame, SubscribeRequest};
use crate::status::SyncStatus;

const BACKOFF_JITTER: f64 = 0.1;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Result of a connection attempt.
enum ConnectResult {
    Connected(WsStream),
    Shutdown,
    Error(ConnectorError),
}

/// Dial `url`, giving up after `timeout` or when shutdown is signalled.
async fn connect_with_timeout(
    url: &str,
    timeout: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectResult {
    let connect = tokio::time::timeout(timeout, connect_async(url));
    tokio::pin!(connect);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return ConnectResult::Shutdown;
                }
            }

            result = &mut connect => {
                return match result {
                    Ok(Ok((stream, _))) => ConnectResult::Connected(stream),
                    Ok(Err(e)) => ConnectResult::Error(ConnectorError::WebSocket(e.to_string())),
                    Err(_) => ConnectResult::Error(ConnectorError::WebSocket(
                        "connection timeout".to_string(),
                    )),
                };
            }
        }
    }
}

/// Result of a session.
enum SessionResult {
    /// Shutdown was requested.
    Shutdown,
    /// The session connected and later ended with `error`.
    Connected {
        duration: Duration,
        error: ConnectorError,
    },
    /// Failed to connect.
    ConnectFailed(ConnectorError),
}

/// Handles shared by every session of one feed.
struct FeedContext<'a> {
    config: &'a BookConfig,
    sender: &'a EventSender,
    status: &'a SyncStatus,
    metrics: &'a SharedMetrics,
}

/// Run one websocket session: connect, subscribe, then forward decoded
/// snapshot and update frames until something goes wrong.
async fn run_session(
    ctx: &FeedContext<'_>,
    restart_rx: &mut mpsc::Receiver<ConnectorError>,
    shutdown_rx: &mut watch::Receiver<bool>,
    reconnect: bool,
) -> SessionResult {
    let url = ctx.config.endpoint.ws_url();
    info!(url = %url, symbol = %ctx.config.symbol, "Connecting to market data websocket");

    let ws_stream = match connect_with_timeout(url, ctx.config.connect_timeout, shutdown_rx).await
    {
        ConnectResult::Connected(stream) => stream,
        ConnectResult::Shutdown => return SessionResult::Shutdown,
        ConnectResult::Error(e) => return SessionResult::ConnectFailed(e),
    };
    let connected_at = Instant::now();
    if reconnect {
        ctx.metrics.inc_reconnect_successes();
    }

    // Restart requests raised before this connection existed are already satisfied.
    while restart_rx.try_recv().is_ok() {}

    let (mut write, mut read) = ws_stream.split();
    let ended = |error: ConnectorError| SessionResult::Connected {
        duration: connected_at.elapsed(),
        error,
    };

    let request = SubscribeRequest::new(&ctx.config.channel, &ctx.config.symbol);
    let subscribe = match request.to_json() {
        Ok(json) => json,
        Err(e) => return ended(ConnectorError::WebSocket(e.to_string())),
    };
    if let Err(e) = write.send(Message::Text(subscribe)).await {
        error!(error = %e, "Failed to send subscribe request");
        ctx.metrics.inc_websocket_errors();
        return ended(ConnectorError::WebSocket(e.to_string()));
    }
    info!(symbol = %request.symbol, channel = %request.channel, "Subscribe request sent");
    ctx.status.transition(SyncState::Syncing);

    let mut decoder = FrameDecoder::new();
    let read_timeout = ctx.config.read_timeout;
    let idle = tokio::time::sleep(read_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.close().await;
                    return SessionResult::Shutdown;
                }
            }

            reason = restart_rx.recv() => {
                let _ = write.close().await;
                return match reason {
                    Some(reason) => {
                        info!(reason = %reason, "Restarting session");
                        ended(reason)
                    }
                    None => SessionResult::Shutdown,
                };
            }

            _ = &mut idle => {
                warn!(timeout_secs = read_timeout.as_secs_f64(), "No frame received, dropping connection");
                ctx.metrics.inc_read_timeouts();
                let _ = write.close().await;
                return ended(ConnectorError::ReadTimeout(read_timeout));
            }

            msg_opt = read.next() => {
                let msg = match msg_opt {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        ctx.metrics.inc_websocket_errors();
                        return ended(ConnectorError::WebSocket(e.to_string()));
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return ended(ConnectorError::ConnectionClosed);
                    }
                };
                idle.as_mut().reset(Instant::now() + read_timeout);

                match msg {
                    Message::Text(text) => {
                        ctx.metrics.inc_frames_received();
                        let event = match decoder.decode(&text) {
                            Ok(ParsedFrame::Snapshot(entries)) => {
                                debug!(levels = entries.len(), "Snapshot frame received");
                                BookEvent::Snapshot(entries)
                            }
                            Ok(ParsedFrame::Update(entry)) => BookEvent::Update(entry),
                            Ok(ParsedFrame::ChannelAck(id)) => {
                                info!(channel_id = id, "Subscribed");
                                continue;
                            }
                            Ok(ParsedFrame::Heartbeat) => {
                                trace!("Heartbeat");
                                continue;
                            }
                            Ok(ParsedFrame::Info) => {
                                debug!(frame = %text, "Ignoring control message");
                                continue;
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to decode frame");
                                ctx.metrics.inc_decode_errors();
                                let _ = write.close().await;
                                return ended(e.into());
                            }
                        };
                        if ctx.sender.send(event).await.is_err() {
                            info!("Book task gone, stopping feed");
                            return ended(ConnectorError::ChannelClosed);
                        }
                    }
                    Message::Ping(data) => {
                        debug!("Received Ping, sending Pong");
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!(error = %e, "Failed to send Pong");
                            ctx.metrics.inc_websocket_errors();
                            return ended(ConnectorError::WebSocket(e.to_string()));
                        }
                    }
                    Message::Close(_) => {
                        info!("WebSocket closed by server");
                        return ended(ConnectorError::ConnectionClosed);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Whether the session was ended on purpose rather than by a fault.
fn is_requested_restart(error: &ConnectorError) -> bool {
    matches!(
        error,
        ConnectorError::StaleBook(_) | ConnectorError::RefreshRequested(_)
    )
}

/// Keep one book feed connected, reconnecting with backoff.
///
/// Every session that got connected ends with a [`BookEvent::Disconnected`]
/// on `sender`, emitted after all of that session's frames. A message on
/// `restart_rx` ends the current session early.
///
/// Returns:
/// - `Ok(())` once shutdown is signalled
/// - `Err(ChannelClosed)` when the event receiver is dropped
/// - `Err(Overloaded)` after `max_rapid_failures` consecutive short-lived
///   sessions or failed connects
pub async fn run_feed(
    config: Arc<BookConfig>,
    sender: EventSender,
    mut restart_rx: mpsc::Receiver<ConnectorError>,
    mut shutdown_rx: watch::Receiver<bool>,
    status: Arc<SyncStatus>,
    metrics: SharedMetrics,
) -> Result<(), ConnectorError> {
    let ctx = FeedContext {
        config: &config,
        sender: &sender,
        status: &status,
        metrics: &metrics,
    };
    let mut backoff = ExponentialBackoff::new(config.backoff_base, config.backoff_max, BACKOFF_JITTER);
    let mut budget = RetryBudget::new(config.stable_connection_threshold, config.max_rapid_failures);
    let mut reconnect = false;

    loop {
        if *shutdown_rx.borrow() {
            info!("Shutdown requested, exiting feed");
            return Ok(());
        }

        status.transition(SyncState::Connecting);
        if reconnect {
            metrics.inc_reconnect_attempts();
        }

        match run_session(&ctx, &mut restart_rx, &mut shutdown_rx, reconnect).await {
            SessionResult::Shutdown => {
                info!("Feed shutdown complete");
                return Ok(());
            }
            SessionResult::Connected { duration, error } => {
                reconnect = true;
                if matches!(error, ConnectorError::ChannelClosed) {
                    return Err(ConnectorError::ChannelClosed);
                }
                if sender
                    .send(BookEvent::Disconnected(error.clone()))
                    .await
                    .is_err()
                {
                    return Err(ConnectorError::ChannelClosed);
                }

                if is_requested_restart(&error) {
                    backoff.reset();
                } else if budget.record_session(duration) {
                    info!(
                        duration_secs = duration.as_secs(),
                        "Connection was stable, resetting backoff"
                    );
                    backoff.reset();
                }
                warn!(error = %error, duration_secs = duration.as_secs_f64(), "Session ended");
            }
            SessionResult::ConnectFailed(e) => {
                reconnect = true;
                budget.record_connect_failure();
                warn!(error = %e, "Connection failed");
            }
        }

        if budget.is_exhausted() {
            error!(
                rapid_failures = budget.rapid_failures(),
                "Too many rapid connection failures, giving up"
            );
            return Err(ConnectorError::Overloaded);
        }

        let delay = backoff.next_delay();
        debug!(
            attempt = backoff.attempt(),
            delay_secs = delay.as_secs_f64(),
            "Reconnecting after delay"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown requested during backoff");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MarketDataEndpoint;
    use connector_core::create_event_channel;
    use model::Side;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_config(url: String) -> BookConfig {
        BookConfig {
            endpoint: MarketDataEndpoint::Custom(url),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..BookConfig::new("eth:usdt")
        }
    }

    #[test]
    fn test_requested_restarts() {
        assert!(is_requested_restart(&ConnectorError::StaleBook(Side::Bid)));
        assert!(is_requested_restart(&ConnectorError::RefreshRequested("manual".into())));
        assert!(!is_requested_restart(&ConnectorError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_feed_forwards_frames_and_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let subscribe = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(r#"[7, [[100.0, 1, 5]]]"#.into())).await.unwrap();
            ws.send(Message::Text(r#"[7, "hb"]"#.into())).await.unwrap();
            ws.send(Message::Text(r#"[7, [101.0, 1, -2]]"#.into())).await.unwrap();
            ws.close(None).await.unwrap();
            subscribe
        });

        let (tx, mut rx) = create_event_channel(16);
        let (_restart_tx, restart_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = Arc::new(SyncStatus::new());
        let metrics = metrics::create_metrics();

        let mut config = test_config(url);
        config.max_rapid_failures = 0;

        let feed = tokio::spawn(run_feed(
            Arc::new(config),
            tx,
            restart_rx,
            shutdown_rx,
            status.clone(),
            metrics.clone(),
        ));

        assert!(matches!(rx.recv().await, Some(BookEvent::Snapshot(ref e)) if e.len() == 1));
        assert!(matches!(rx.recv().await, Some(BookEvent::Update(_))));
        assert_eq!(
            rx.recv().await,
            Some(BookEvent::Disconnected(ConnectorError::ConnectionClosed))
        );

        let subscribe = server.await.unwrap();
        assert_eq!(
            subscribe,
            Message::Text(r#"{"event":"subscribe","channel":"book","symbol":"ETH:USDT"}"#.into())
        );
        assert_eq!(metrics.frames_received(), 3);

        shutdown_tx.send(true).unwrap();
        assert_eq!(feed.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_feed_gives_up_after_rapid_connect_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut config = test_config(url);
        config.max_rapid_failures = 3;

        let (tx, _rx) = create_event_channel(16);
        let (_restart_tx, restart_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = metrics::create_metrics();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_feed(
                Arc::new(config),
                tx,
                restart_rx,
                shutdown_rx,
                Arc::new(SyncStatus::new()),
                metrics.clone(),
            ),
        )
        .await
        .unwrap();

        assert_eq!(result, Err(ConnectorError::Overloaded));
        assert_eq!(metrics.reconnect_attempts(), 2);
        assert_eq!(metrics.reconnect_successes(), 0);
    }

    #[tokio::test]
    async fn test_feed_stops_on_shutdown_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (tx, _rx) = create_event_channel(16);
        let (_restart_tx, restart_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = Arc::new(SyncStatus::new());

        let feed = tokio::spawn(run_feed(
            Arc::new(test_config(url)),
            tx,
            restart_rx,
            shutdown_rx,
            status.clone(),
            metrics::create_metrics(),
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while status.get() != SyncState::Syncing {
            assert!(Instant::now() < deadline, "feed never subscribed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), feed).await.unwrap();
        assert_eq!(result.unwrap(), Ok(()));
    }
}
