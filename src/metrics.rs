use crate::session::ConnectionState;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters and per-shard gauges for the gateway client.
///
/// Use `snapshot()` to get a point-in-time view of everything, or the
/// individual getters for specific values.
///
/// # Example
/// ```ignore
/// let metrics = coordinator.metrics();
/// println!("Events dispatched: {}", metrics.events_dispatched());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    missed_heartbeats_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    events_dispatched_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    malformed_frames_total: AtomicU64,
    errors_total: AtomicU64,
    rate_limit_waits_total: AtomicU64,
    rate_limited_responses_total: AtomicU64,

    /// Per-shard metrics
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    pub state: ConnectionState,
    pub is_connected: bool,
    /// Round trip of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    pub last_sequence: u64,
    /// Current reconnection attempt (0 if connected)
    pub reconnect_attempt: u32,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last dispatch received (None if no events)
    pub time_since_last_event: Option<Duration>,
    /// Total connected time, excluding the current connection
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_event_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            state: ConnectionState::Disconnected,
            is_connected: false,
            latency: None,
            last_sequence: 0,
            reconnect_attempt: 0,
            time_since_connected: None,
            time_since_last_event: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_event_at: None,
        }
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_event: self.last_event_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }

    /// Mark the shard connected and start the uptime clock
    pub(crate) fn mark_connected(&mut self) {
        self.is_connected = true;
        self.reconnect_attempt = 0;
        self.last_connected_at = Some(Instant::now());
    }

    /// Mark the shard disconnected and fold the session into total uptime
    pub(crate) fn mark_disconnected(&mut self) {
        if self.is_connected {
            if let Some(at) = self.last_connected_at {
                self.total_uptime += at.elapsed();
            }
        }
        self.is_connected = false;
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    pub fn missed_heartbeats(&self) -> u64 {
        self.missed_heartbeats_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched_total.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Requests or sends that had to wait for a bucket
    pub fn rate_limit_waits(&self) -> u64 {
        self.rate_limit_waits_total.load(Ordering::Relaxed)
    }

    /// HTTP 429 responses received
    pub fn rate_limited_responses(&self) -> u64 {
        self.rate_limited_responses_total.load(Ordering::Relaxed)
    }

    // Recording methods (called internally)

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_missed_heartbeat(&self) {
        self.missed_heartbeats_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dispatched(&self) {
        self.events_dispatched_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed_frame(&self) {
        self.malformed_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limit_wait(&self) {
        self.rate_limit_waits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited_response(&self) {
        self.rate_limited_responses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let index = shard_id as usize;

        while shards.len() <= index {
            let id = shards.len() as u32;
            shards.push(ShardMetrics::new(id));
        }

        update_fn(&mut shards[index]);
    }

    /// Snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Current active connection count
    pub fn active_connections(&self) -> usize {
        self.shard_metrics.read().iter().filter(|s| s.is_connected).count()
    }

    /// Point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            missed_heartbeats_total: self.missed_heartbeats_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            events_dispatched_total: self.events_dispatched_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            malformed_frames_total: self.malformed_frames_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            rate_limit_waits_total: self.rate_limit_waits_total.load(Ordering::Acquire),
            rate_limited_responses_total: self.rate_limited_responses_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub missed_heartbeats_total: u64,
    pub invalid_sessions_total: u64,
    pub events_dispatched_total: u64,
    pub frames_received_total: u64,
    pub frames_sent_total: u64,
    pub malformed_frames_total: u64,
    pub errors_total: u64,
    pub rate_limit_waits_total: u64,
    pub rate_limited_responses_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
