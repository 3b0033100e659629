use crate::config::RateLimitConfig;
use crate::protocol::GatewayPayload;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Result of asking the queue for the next payload to write.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuePoll {
    /// Write this payload now; the send has already been counted.
    Ready(GatewayPayload),
    /// Something is queued but the budget is spent until this instant.
    Wait(Instant),
    /// Nothing sendable is queued.
    Idle,
}

/// Per-shard outbound queue throttled to `limit` sends per rolling `window`.
///
/// The window is a sliding log of send instants. Ordinary payloads may only
/// use `limit - reserved` slots of it so that heartbeats and other important
/// frames always find room.
#[derive(Debug)]
pub struct SendQueue {
    limit: usize,
    reserved: usize,
    window: Duration,
    sent: VecDeque<Instant>,
    important: VecDeque<GatewayPayload>,
    ordinary: VecDeque<GatewayPayload>,
}

impl SendQueue {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.limit as usize,
            reserved: config.reserved.min(config.limit) as usize,
            window: config.window,
            sent: VecDeque::new(),
            important: VecDeque::new(),
            ordinary: VecDeque::new(),
        }
    }

    /// Important payloads skip the ordinary FIFO and may use the reserved budget.
    pub fn push(&mut self, payload: GatewayPayload, important: bool) {
        if important {
            self.important.push_back(payload);
        } else {
            self.ordinary.push_back(payload);
        }
    }

    pub fn len(&self) -> usize {
        self.important.len() + self.ordinary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends counted in the window ending at `now`.
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.sent.len()
    }

    /// Take the next payload if the budget allows.
    ///
    /// Until `established` is set only heartbeats, identifies and resumes
    /// leave the queue; everything else waits for the session.
    pub fn poll_next(&mut self, now: Instant, established: bool) -> QueuePoll {
        self.prune(now);

        let sendable = self
            .important
            .iter()
            .position(|p| established || p.op.is_connection_scoped());
        if let Some(index) = sendable {
            return match self.wait_until(self.limit) {
                None => {
                    self.sent.push_back(now);
                    self.important
                        .remove(index)
                        .map_or(QueuePoll::Idle, QueuePoll::Ready)
                }
                Some(at) => QueuePoll::Wait(at),
            };
        }

        if established && !self.ordinary.is_empty() {
            let budget = self.limit - self.reserved;
            return match self.wait_until(budget) {
                None => {
                    self.sent.push_back(now);
                    self.ordinary
                        .pop_front()
                        .map_or(QueuePoll::Idle, QueuePoll::Ready)
                }
                Some(at) => QueuePoll::Wait(at),
            };
        }

        QueuePoll::Idle
    }

    /// Drop heartbeats, identifies and resumes queued for a connection that closed.
    pub fn purge_connection_frames(&mut self) -> usize {
        let before = self.len();
        self.important.retain(|p| !p.op.is_connection_scoped());
        self.ordinary.retain(|p| !p.op.is_connection_scoped());
        before - self.len()
    }

    /// Start a fresh window for a new connection.
    pub fn reset_window(&mut self) {
        self.sent.clear();
    }

    pub fn clear(&mut self) {
        self.important.clear();
        self.ordinary.clear();
        self.sent.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.sent.front() {
            if oldest + self.window <= now {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// `None` if a send fits under `budget`, otherwise the instant a slot frees up.
    fn wait_until(&self, budget: usize) -> Option<Instant> {
        if self.sent.len() < budget {
            return None;
        }
        // budget == 0 never frees a slot; report the end of the current window
        let index = (self.sent.len() - budget).min(self.sent.len().saturating_sub(1));
        self.sent
            .get(index)
            .map(|&at| at + self.window)
            .or_else(|| Some(Instant::now() + self.window))
    }
}
