use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// Spaces identifies of every shard in a manager by at least `delay`.
///
/// Shards call [`reserve`](Self::reserve) to claim the next free slot and
/// wait until it. Claims are handed out in call order.
#[derive(Debug)]
pub struct IdentifyLimiter {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl IdentifyLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Claim the next identify slot at or after `now`.
    pub fn reserve_at(&self, now: Instant) -> Instant {
        let mut last = self.last.lock();
        let slot = match *last {
            Some(prev) => now.max(prev + self.delay),
            None => now,
        };
        *last = Some(slot);
        slot
    }

    pub fn reserve(&self) -> Instant {
        self.reserve_at(Instant::now())
    }
}
