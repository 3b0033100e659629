use crate::shard::ShardStatus;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters cover every shard of a manager. Use `snapshot()` to get a
/// point-in-time view of all metrics, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Identifies: {}", metrics.identifies());
/// println!("Dispatches: {}", metrics.dispatches());
///
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
    zombies_total: AtomicU64,
    dispatches_total: AtomicU64,
    commands_sent_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    errors_total: AtomicU64,

    /// Per-shard metrics keyed by shard id
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u32,
    /// Current lifecycle status
    pub status: ShardStatus,
    /// Whether the socket is currently open
    pub is_connected: bool,
    /// Round trip of the last acked heartbeat
    pub ping: Option<Duration>,
    /// Last sequence number seen
    pub sequence: Option<u64>,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last frame received (None if no frames)
    pub time_since_last_message: Option<Duration>,
    /// Current reconnection attempt (0 if connected)
    pub reconnect_attempt: u32,
    /// Total uptime for this shard
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            status: ShardStatus::Idle,
            is_connected: false,
            ping: None,
            sequence: None,
            time_since_connected: None,
            time_since_last_message: None,
            reconnect_attempt: 0,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_message_at: None,
        }
    }

    /// Create a snapshot with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total socket connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total identifies sent
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// Get total resumes sent
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats sent
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeat acks received
    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Get total zombie connections detected
    pub fn zombies(&self) -> u64 {
        self.zombies_total.load(Ordering::Relaxed)
    }

    /// Get total dispatches received
    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    /// Get total frames written
    pub fn commands_sent(&self) -> u64 {
        self.commands_sent_total.load(Ordering::Relaxed)
    }

    /// Get total invalid sessions received
    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

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

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie(&self) {
        self.zombies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_command_sent(&self) {
        self.commands_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    pub(crate) fn set_status(&self, shard_id: u32, status: ShardStatus) {
        self.update_shard(shard_id, |s| s.status = status);
    }

    pub(crate) fn record_shard_frame(&self, shard_id: u32) {
        self.update_shard(shard_id, |s| s.last_message_at = Some(Instant::now()));
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    /// Get one shard's metrics
    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_id).map(|s| s.snapshot())
    }

    /// Get a shard's status. Unknown shards report `Idle`.
    pub fn shard_status(&self, shard_id: u32) -> ShardStatus {
        self.shard_metrics
            .read()
            .get(&shard_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Get a shard's last heartbeat round trip
    pub fn shard_ping(&self, shard_id: u32) -> Option<Duration> {
        self.shard_metrics.read().get(&shard_id).and_then(|s| s.ping)
    }

    /// Mean heartbeat round trip over shards that measured one
    pub fn average_ping(&self) -> Option<Duration> {
        let shards = self.shard_metrics.read();
        let pings: Vec<Duration> = shards.values().filter_map(|s| s.ping).collect();
        if pings.is_empty() {
            return None;
        }
        Some(pings.iter().sum::<Duration>() / pings.len() as u32)
    }

    /// Get current active connection count
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            zombies_total: self.zombies_total.load(Ordering::Acquire),
            dispatches_total: self.dispatches_total.load(Ordering::Acquire),
            commands_sent_total: self.commands_sent_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
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
    pub zombies_total: u64,
    pub dispatches_total: u64,
    pub commands_sent_total: u64,
    pub invalid_sessions_total: u64,
    pub errors_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
