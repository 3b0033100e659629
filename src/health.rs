use crate::config::HeartbeatConfig;
use tokio::time::{Duration, Instant};

/// What the shard must do when a heartbeat falls due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a heartbeat now
    Send,
    /// The previous heartbeat was never acked; the connection is dead
    Zombie,
}

/// Tracks heartbeat cadence and acks for a single connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,

    /// Interval dictated by the server's Hello
    interval: Option<Duration>,

    /// When the next heartbeat is due
    next_due: Option<Instant>,

    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Whether the last heartbeat was acked
    acked: bool,

    /// Round trip of the last acked heartbeat
    ping: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            interval: None,
            next_due: None,
            last_sent: None,
            acked: true,
            ping: None,
        }
    }

    /// Begin heartbeating on a fresh connection.
    ///
    /// The first beat is pulled forward by a random fraction (up to
    /// `jitter`) of the interval; subsequent beats follow the interval.
    pub fn start(&mut self, interval: Duration, now: Instant) {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let offset = interval.mul_f64(rand::random::<f64>() * jitter);
        self.interval = Some(interval);
        self.next_due = Some(now + interval.saturating_sub(offset));
        self.last_sent = None;
        self.acked = true;
    }

    /// Stop heartbeating. Clears the timer; the ping of the last ack is kept.
    pub fn stop(&mut self) {
        self.interval = None;
        self.next_due = None;
        self.last_sent = None;
        self.acked = true;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Called when `next_due` has passed.
    ///
    /// Returns [`HeartbeatAction::Zombie`] if the previous beat is still un-acked,
    /// otherwise records a send and schedules the next beat.
    pub fn on_due(&mut self, now: Instant) -> HeartbeatAction {
        if !self.acked && self.last_sent.is_some() {
            self.next_due = None;
            return HeartbeatAction::Zombie;
        }
        self.record_sent(now);
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
        HeartbeatAction::Send
    }

    /// Record a heartbeat sent outside the schedule (server request).
    ///
    /// The ack flag is left alone so an outstanding beat is still tracked.
    pub fn record_requested(&mut self, now: Instant) {
        if self.acked {
            self.last_sent = Some(now);
        }
    }

    fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.acked = false;
    }

    /// Record a HeartbeatAck. Returns the measured round trip.
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        self.acked = true;
        let rtt = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        if rtt.is_some() {
            self.ping = rtt;
        }
        rtt
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn ping(&self) -> Option<Duration> {
        self.ping
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(jitter: f64) -> HeartbeatConfig {
        HeartbeatConfig { jitter }
    }

    #[test]
    fn test_first_beat_within_jitter() {
        let now = Instant::now();
        let interval = Duration::from_millis(1000);
        for _ in 0..20 {
            let mut monitor = HeartbeatMonitor::new(test_config(0.1));
            monitor.start(interval, now);
            let due = monitor.next_due().unwrap();
            assert!(due <= now + interval);
            assert!(due >= now + Duration::from_millis(900));
        }
    }

    #[test]
    fn test_acked_beats_never_zombie() {
        let mut monitor = HeartbeatMonitor::new(test_config(0.0));
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        monitor.start(interval, start);

        let mut now = start;
        for _ in 0..5 {
            now = monitor.next_due().unwrap();
            assert_eq!(monitor.on_due(now), HeartbeatAction::Send);
            let rtt = monitor.record_ack(now + Duration::from_millis(7));
            assert_eq!(rtt, Some(Duration::from_millis(7)));
        }
        assert_eq!(monitor.next_due(), Some(now + interval));
        assert_eq!(monitor.ping(), Some(Duration::from_millis(7)));
    }

    #[test]
    fn test_missing_ack_is_zombie() {
        let mut monitor = HeartbeatMonitor::new(test_config(0.0));
        let start = Instant::now();
        monitor.start(Duration::from_millis(100), start);

        let first = monitor.next_due().unwrap();
        assert_eq!(monitor.on_due(first), HeartbeatAction::Send);
        let second = monitor.next_due().unwrap();
        assert_eq!(monitor.on_due(second), HeartbeatAction::Zombie);
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_requested_beat_keeps_ack_flag() {
        let mut monitor = HeartbeatMonitor::new(test_config(0.0));
        let start = Instant::now();
        monitor.start(Duration::from_millis(100), start);

        let due = monitor.next_due().unwrap();
        monitor.on_due(due);
        monitor.record_requested(due + Duration::from_millis(10));
        assert!(!monitor.is_acked());
        let next = monitor.next_due().unwrap();
        assert_eq!(monitor.on_due(next), HeartbeatAction::Zombie);
    }

    #[test]
    fn test_stop_clears_timer() {
        let mut monitor = HeartbeatMonitor::new(test_config(0.1));
        monitor.start(Duration::from_millis(100), Instant::now());
        assert!(monitor.is_running());
        monitor.stop();
        assert!(monitor.next_due().is_none());
        assert!(monitor.interval().is_none());
    }
}
