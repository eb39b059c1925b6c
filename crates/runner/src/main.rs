use connector_core::BookConfig;
use connector_dvf::LocalOrderBook;
use metrics::create_metrics;
use std::time::Duration;
use tracing::{info, warn};

/// Interval for periodic top-of-book and health logging.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }
    common::init_logging();

    let symbol = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ETH:USDT".to_string());
    let config = BookConfig::from_env(symbol);
    info!(
        symbol = %config.wire_symbol(),
        endpoint = %config.endpoint,
        read_timeout_secs = config.read_timeout.as_secs(),
        "Starting order book"
    );

    let metrics = create_metrics();
    let book = LocalOrderBook::subscribe_with_metrics(config, metrics.clone());

    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if book.state().is_terminal() {
                    warn!(state = %book.state(), failure = ?book.failure(), "Subscription ended");
                    break;
                }

                let snapshot = metrics.snapshot();
                match (book.best_bid(), book.best_ask()) {
                    (Some(bid), Some(ask)) => info!(
                        bid = %bid.price,
                        bid_qty = %bid.quantity,
                        ask = %ask.price,
                        ask_qty = %ask.quantity,
                        spread = ?book.spread(),
                        "Top of book"
                    ),
                    _ => info!(state = %book.state(), "Book not ready"),
                }
                info!(
                    status = %snapshot.health_status(),
                    frames = snapshot.frames_received,
                    errors = snapshot.websocket_errors + snapshot.decode_errors,
                    resyncs = snapshot.resyncs,
                    reconnects = snapshot.reconnect_attempts,
                    "Health check"
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Received Ctrl+C, initiating shutdown");
                break;
            }
        }
    }

    book.shutdown().await;

    println!("\n{}", metrics.snapshot());
    info!("Shutdown complete");
}
