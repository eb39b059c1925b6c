use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Thread-safe counters for one order book subscription.
#[derive(Debug)]
pub struct BookMetrics {
    frames_received: AtomicU64,
    snapshots_applied: AtomicU64,
    updates_applied: AtomicU64,
    decode_errors: AtomicU64,
    websocket_errors: AtomicU64,
    read_timeouts: AtomicU64,
    resyncs: AtomicU64,
    refresh_requests_accepted: AtomicU64,
    refresh_requests_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,

    inner: RwLock<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    start_time: Instant,
    last_frame_time: Option<Instant>,
    last_error_time: Option<Instant>,
    last_resync_time: Option<Instant>,
}

impl Default for BookMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BookMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            snapshots_applied: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            websocket_errors: AtomicU64::new(0),
            read_timeouts: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            refresh_requests_accepted: AtomicU64::new(0),
            refresh_requests_dropped: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_successes: AtomicU64::new(0),
            inner: RwLock::new(MetricsInner {
                start_time: Instant::now(),
                last_frame_time: None,
                last_error_time: None,
                last_resync_time: None,
            }),
        }
    }

    // --- Increment methods ---

    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_frame_time = Some(Instant::now());
    }

    pub fn inc_snapshots_applied(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_updates_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_websocket_errors(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_read_timeouts(&self) {
        self.read_timeouts.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_error_time = Some(Instant::now());
    }

    pub fn inc_resyncs(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_resync_time = Some(Instant::now());
    }

    pub fn inc_refresh_requests_accepted(&self) {
        self.refresh_requests_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refresh_requests_dropped(&self) {
        self.refresh_requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnect_successes(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    // --- Getter methods ---

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied.load(Ordering::Relaxed)
    }

    pub fn updates_applied(&self) -> u64 {
        self.updates_applied.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn websocket_errors(&self) -> u64 {
        self.websocket_errors.load(Ordering::Relaxed)
    }

    pub fn read_timeouts(&self) -> u64 {
        self.read_timeouts.load(Ordering::Relaxed)
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    pub fn refresh_requests_accepted(&self) -> u64 {
        self.refresh_requests_accepted.load(Ordering::Relaxed)
    }

    pub fn refresh_requests_dropped(&self) -> u64 {
        self.refresh_requests_dropped.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn reconnect_successes(&self) -> u64 {
        self.reconnect_successes.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.inner.read().start_time.elapsed().as_secs_f64()
    }

    pub fn secs_since_last_frame(&self) -> Option<f64> {
        self.inner
            .read()
            .last_frame_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn secs_since_last_error(&self) -> Option<f64> {
        self.inner
            .read()
            .last_error_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn secs_since_last_resync(&self) -> Option<f64> {
        self.inner
            .read()
            .last_resync_time
            .map(|t| t.elapsed().as_secs_f64())
    }

    /// Generate a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received(),
            snapshots_applied: self.snapshots_applied(),
            updates_applied: self.updates_applied(),
            decode_errors: self.decode_errors(),
            websocket_errors: self.websocket_errors(),
            read_timeouts: self.read_timeouts(),
            resyncs: self.resyncs(),
            refresh_requests_accepted: self.refresh_requests_accepted(),
            refresh_requests_dropped: self.refresh_requests_dropped(),
            reconnect_attempts: self.reconnect_attempts(),
            reconnect_successes: self.reconnect_successes(),
            uptime_secs: self.uptime_secs(),
            secs_since_last_frame: self.secs_since_last_frame(),
            secs_since_last_error: self.secs_since_last_error(),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub snapshots_applied: u64,
    pub updates_applied: u64,
    pub decode_errors: u64,
    pub websocket_errors: u64,
    pub read_timeouts: u64,
    pub resyncs: u64,
    pub refresh_requests_accepted: u64,
    pub refresh_requests_dropped: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub uptime_secs: f64,
    pub secs_since_last_frame: Option<f64>,
    pub secs_since_last_error: Option<f64>,
}

/// Health status of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Frames are arriving.
    Healthy,
    /// No frame for longer than the read deadline.
    Degraded,
    /// No frame for an extended period.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

impl MetricsSnapshot {
    const STALE_THRESHOLD_SECS: f64 = 30.0;
    const UNHEALTHY_THRESHOLD_SECS: f64 = 60.0;

    /// Health based on how long ago the last frame arrived.
    ///
    /// Before the first frame, uptime stands in for frame age.
    pub fn health_status(&self) -> HealthStatus {
        let age = self.secs_since_last_frame.unwrap_or(self.uptime_secs);

        if age > Self::UNHEALTHY_THRESHOLD_SECS {
            HealthStatus::Unhealthy
        } else if age > Self::STALE_THRESHOLD_SECS {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Order Book Metrics ===")?;
        writeln!(f, "Uptime:              {:.1}s", self.uptime_secs)?;
        writeln!(f, "Frames received:     {}", self.frames_received)?;
        writeln!(f, "Snapshots applied:   {}", self.snapshots_applied)?;
        writeln!(f, "Updates applied:     {}", self.updates_applied)?;
        writeln!(f, "Decode errors:       {}", self.decode_errors)?;
        writeln!(f, "WebSocket errors:    {}", self.websocket_errors)?;
        writeln!(f, "Read timeouts:       {}", self.read_timeouts)?;
        writeln!(f, "Resyncs:             {}", self.resyncs)?;
        writeln!(
            f,
            "Refresh requests:    {} accepted, {} dropped",
            self.refresh_requests_accepted, self.refresh_requests_dropped
        )?;
        writeln!(f, "Reconnect attempts:  {}", self.reconnect_attempts)?;
        writeln!(f, "Reconnect successes: {}", self.reconnect_successes)?;
        if let Some(secs) = self.secs_since_last_frame {
            writeln!(f, "Since last frame:    {:.1}s", secs)?;
        }
        if let Some(secs) = self.secs_since_last_error {
            writeln!(f, "Since last error:    {:.1}s", secs)?;
        }
        Ok(())
    }
}

/// Shared handle to metrics.
pub type SharedMetrics = Arc<BookMetrics>;

pub fn create_metrics() -> SharedMetrics {
    Arc::new(BookMetrics::new())
}
