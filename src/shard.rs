use crate::error::Error;
use crate::protocol::GatewayPayload;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;

/// Lifecycle of a shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardStatus {
    #[default]
    Idle,
    Connecting,
    WaitingForHello,
    Identifying,
    Resuming,
    WaitingForGuilds,
    Ready,
    Resumed,
    Connected,
    Disconnected,
    Reconnecting,
    Destroyed,
}

impl ShardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::WaitingForHello => "waiting_for_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::WaitingForGuilds => "waiting_for_guilds",
            Self::Ready => "ready",
            Self::Resumed => "resumed",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Destroyed => "destroyed",
        }
    }

    /// The gateway accepts ordinary commands in these states.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            Self::WaitingForGuilds | Self::Ready | Self::Resumed | Self::Connected
        )
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands that can be sent to a shard
#[derive(Debug)]
pub enum ShardCommand {
    /// Queue a payload for sending
    Send {
        payload: GatewayPayload,
        important: bool,
    },
    /// Drop the connection and reconnect, optionally discarding the session
    Reconnect { reidentify: bool },
    /// Stop the shard for good
    Destroy,
}

/// The manager's handle on a running shard
#[derive(Debug, Clone)]
pub struct ShardHandle {
    /// Shard identifier
    pub id: u32,
    /// Command sender for this shard's connection
    pub command_tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub fn new(id: u32, command_tx: mpsc::Sender<ShardCommand>) -> Self {
        Self { id, command_tx }
    }

    /// Queue a payload on this shard's send queue
    pub async fn send(&self, payload: GatewayPayload, important: bool) -> Result<(), Error> {
        self.command_tx
            .send(ShardCommand::Send { payload, important })
            .await
            .map_err(|e| Error::ChannelSend(format!("shard {}: {}", self.id, e)))
    }

    pub async fn reconnect(&self, reidentify: bool) -> Result<(), Error> {
        self.command_tx
            .send(ShardCommand::Reconnect { reidentify })
            .await
            .map_err(|e| Error::ChannelSend(format!("shard {}: {}", self.id, e)))
    }

    /// Ask the shard to stop. Does nothing if it already exited.
    pub fn destroy(&self) {
        let _ = self.command_tx.try_send(ShardCommand::Destroy);
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Shard that receives events for a guild: `(guild_id >> 22) % total_shards`.
pub fn shard_id_for_guild(guild_id: u64, total_shards: u32) -> u32 {
    if total_shards == 0 {
        return 0;
    }
    ((guild_id >> 22) % total_shards as u64) as u32
}

#[derive(Debug, Default)]
struct ReadyState {
    expected_guilds: HashMap<u32, HashSet<u64>>,
    ready: HashSet<u32>,
    all_ready_fired: bool,
}

/// Readiness of every shard owned by one manager.
///
/// Tracks the guilds each shard still waits for after READY and fires the
/// all-ready transition exactly once.
#[derive(Debug)]
pub struct ReadyTracker {
    owned: HashSet<u32>,
    state: Mutex<ReadyState>,
}

impl ReadyTracker {
    pub fn new(owned: impl IntoIterator<Item = u32>) -> Self {
        Self {
            owned: owned.into_iter().collect(),
            state: Mutex::new(ReadyState::default()),
        }
    }

    /// Record the guild ids a READY said belong to this shard.
    pub fn set_expected(&self, shard_id: u32, guilds: HashSet<u64>) {
        self.state.lock().expected_guilds.insert(shard_id, guilds);
    }

    /// Mark a guild as arrived. Returns how many are still expected.
    pub fn guild_arrived(&self, shard_id: u32, guild_id: u64) -> usize {
        let mut state = self.state.lock();
        match state.expected_guilds.get_mut(&shard_id) {
            Some(expected) => {
                expected.remove(&guild_id);
                expected.len()
            }
            None => 0,
        }
    }

    pub fn expected(&self, shard_id: u32) -> usize {
        self.state
            .lock()
            .expected_guilds
            .get(&shard_id)
            .map_or(0, HashSet::len)
    }

    /// Take the guilds that never arrived.
    pub fn take_unavailable(&self, shard_id: u32) -> HashSet<u64> {
        self.state
            .lock()
            .expected_guilds
            .remove(&shard_id)
            .unwrap_or_default()
    }

    /// Record that a shard is ready. Returns `true` exactly once: for the call
    /// that completes the owned set.
    pub fn mark_ready(&self, shard_id: u32) -> bool {
        let mut state = self.state.lock();
        state.ready.insert(shard_id);
        if state.all_ready_fired || !self.owned.iter().all(|id| state.ready.contains(id)) {
            return false;
        }
        state.all_ready_fired = true;
        true
    }

    pub fn is_all_ready(&self) -> bool {
        self.state.lock().all_ready_fired
    }
}
