use crate::config::{GatewayConfig, ShardCount};
use crate::connection::{Connection, ShardContext};
use crate::error::Error;
use crate::handler::EventHandler;
use crate::identify::IdentifyLimiter;
use crate::metrics::Metrics;
use crate::protocol::GatewayPayload;
use crate::shard::{shard_id_for_guild, ReadyTracker, ShardCommand, ShardHandle, ShardStatus};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Default channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Gateway endpoint and recommended shard count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    /// Base WebSocket URL, without query
    pub url: String,
    /// Recommended total shard count
    pub shards: u32,
}

/// Where the manager learns the gateway URL and the recommended shard count.
///
/// Usually backed by the provider's REST endpoint, which lives outside this crate.
pub trait GatewayInfoSource: Send + Sync {
    fn gateway_info(&self) -> impl Future<Output = Result<GatewayInfo, Error>> + Send;
}

/// A fixed gateway URL and shard count
#[derive(Debug, Clone)]
pub struct StaticGatewayInfo {
    info: GatewayInfo,
}

impl StaticGatewayInfo {
    pub fn new(url: impl Into<String>, shards: u32) -> Self {
        Self {
            info: GatewayInfo {
                url: url.into(),
                shards,
            },
        }
    }
}

impl GatewayInfoSource for StaticGatewayInfo {
    async fn gateway_info(&self) -> Result<GatewayInfo, Error> {
        Ok(self.info.clone())
    }
}

/// Runs the shards of one process.
///
/// # Thread Safety
///
/// `GatewayManager` is `Send + Sync` and all methods can be safely called from
/// multiple tasks concurrently. Internal state is protected by `parking_lot::RwLock`
/// which does not poison on panic.
pub struct GatewayManager<H: EventHandler> {
    handler: Arc<H>,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    limiter: Arc<IdentifyLimiter>,
    /// Resolved once, before the first shard connects
    total_shards: OnceLock<u32>,
    state: RwLock<ManagerState>,
    shard_handles: RwLock<HashMap<u32, JoinHandle<()>>>,
    /// Serializes start calls. This is a tokio::Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
}

#[derive(Default)]
struct ManagerState {
    shards: BTreeMap<u32, ShardHandle>,
    /// Shard ids not spawned yet
    pending: VecDeque<u32>,
    readiness: Option<Arc<ReadyTracker>>,
    is_running: bool,
}

impl<H: EventHandler> GatewayManager<H> {
    /// Create a new gateway manager
    pub fn new(config: GatewayConfig, handler: H) -> Self {
        let limiter = Arc::new(IdentifyLimiter::new(config.sharding.identify_delay));
        Self {
            handler: Arc::new(handler),
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()),
            limiter,
            total_shards: OnceLock::new(),
            state: RwLock::new(ManagerState::default()),
            shard_handles: RwLock::new(HashMap::new()),
            lifecycle_lock: Mutex::new(()),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Get a reference to the handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Check if the manager is currently running
    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    /// Total shard count across every process, once resolved
    pub fn total_shards(&self) -> Option<u32> {
        self.total_shards.get().copied()
    }

    /// Shards owned by this manager
    pub fn shard_ids(&self) -> Vec<u32> {
        self.state.read().shards.keys().copied().collect()
    }

    /// Whether every owned shard has become ready at least once
    pub fn is_all_ready(&self) -> bool {
        self.state
            .read()
            .readiness
            .as_ref()
            .is_some_and(|r| r.is_all_ready())
    }

    /// Resolve the shard layout and spawn every owned shard.
    ///
    /// Shards are spawned in id order. Each one is given `spawn_timeout` to
    /// establish its session before the next is started; identifies are
    /// additionally spaced by the identify delay.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is already running, the shard layout is
    /// invalid, gateway info cannot be resolved, or a shard closes fatally
    /// while spawning (in which case every shard is destroyed).
    pub async fn start(&self, source: &impl GatewayInfoSource) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.state.read().is_running {
            return Err(Error::AlreadyRunning);
        }

        let info = source.gateway_info().await?;
        let resolved = match self.config.sharding.shard_count {
            ShardCount::Fixed(n) => n,
            ShardCount::Auto => info.shards,
        };
        if resolved == 0 {
            return Err(Error::GatewayInfo(
                "recommended shard count is 0".to_string(),
            ));
        }
        let total = *self.total_shards.get_or_init(|| resolved);
        if total != resolved {
            warn!(
                "Total shard count is fixed at {}, ignoring newly resolved {}",
                total, resolved
            );
        }

        let shard_ids: Vec<u32> = match &self.config.sharding.shard_ids {
            Some(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            None => (0..total).collect(),
        };
        if let Some(bad) = shard_ids.iter().find(|&&id| id >= total) {
            return Err(Error::InvalidShardConfig(format!(
                "shard id {} is out of range for {} shards",
                bad, total
            )));
        }

        info!(
            "Starting GatewayManager with {} of {} shards at {}",
            shard_ids.len(),
            total,
            info.url
        );

        let readiness = Arc::new(ReadyTracker::new(shard_ids.iter().copied()));
        let ctx = Arc::new(ShardContext {
            total_shards: total,
            gateway_url: info.url,
            config: self.config.clone(),
            limiter: self.limiter.clone(),
            readiness: readiness.clone(),
            metrics: self.metrics.clone(),
        });

        {
            let mut state = self.state.write();
            state.pending = shard_ids.into();
            state.readiness = Some(readiness);
            state.is_running = true;
        }

        while let Some(shard_id) = self.next_pending() {
            let spawned = self.create_shard(shard_id, ctx.clone());

            match timeout(self.config.sharding.spawn_timeout, spawned).await {
                Ok(Ok(Ok(()))) => {
                    debug!("[SHARD-{}] Spawned", shard_id);
                }
                Ok(Ok(Err(Error::ShuttingDown))) => {
                    debug!("[SHARD-{}] Destroyed while spawning", shard_id);
                    return Err(Error::ShuttingDown);
                }
                Ok(Ok(Err(e))) => {
                    error!("[SHARD-{}] Failed to spawn: {}", shard_id, e);
                    self.shutdown().await;
                    return Err(e);
                }
                Ok(Err(_)) => {
                    warn!("[SHARD-{}] Shard task ended before its session started", shard_id);
                }
                Err(_) => {
                    warn!(
                        "[SHARD-{}] Not ready within {:?}, continuing",
                        shard_id, self.config.sharding.spawn_timeout
                    );
                }
            }
        }

        if !self.is_running() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn next_pending(&self) -> Option<u32> {
        let mut state = self.state.write();
        if !state.is_running {
            state.pending.clear();
            return None;
        }
        state.pending.pop_front()
    }

    fn handle(&self, shard_id: u32) -> Result<ShardHandle, Error> {
        self.state
            .read()
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or(Error::ShardNotFound(shard_id))
    }

    /// Queue a payload on one shard
    pub async fn send(
        &self,
        shard_id: u32,
        payload: GatewayPayload,
        important: bool,
    ) -> Result<(), Error> {
        self.handle(shard_id)?.send(payload, important).await
    }

    /// Queue a payload on every shard.
    ///
    /// Every shard is attempted; the error lists the shards whose send failed.
    pub async fn broadcast(&self, payload: GatewayPayload, important: bool) -> Result<(), Error> {
        let handles: Vec<ShardHandle> = self.state.read().shards.values().cloned().collect();
        let mut failed = Vec::new();

        for handle in handles {
            if let Err(e) = handle.send(payload.clone(), important).await {
                warn!("[SHARD-{}] Broadcast send failed: {}", handle.id, e);
                failed.push(handle.id);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Broadcast { failed })
        }
    }

    /// Shard responsible for a guild
    pub fn shard_for_guild(&self, guild_id: u64) -> Result<u32, Error> {
        let total = self.total_shards().ok_or_else(|| {
            Error::InvalidShardConfig("total shard count is not resolved yet".to_string())
        })?;
        Ok(shard_id_for_guild(guild_id, total))
    }

    /// Queue a payload on the shard responsible for a guild
    pub async fn send_to_guild(
        &self,
        guild_id: u64,
        payload: GatewayPayload,
        important: bool,
    ) -> Result<(), Error> {
        let shard_id = self.shard_for_guild(guild_id)?;
        self.send(shard_id, payload, important).await
    }

    /// Update the presence on every shard (op 3)
    pub async fn set_presence(&self, presence: Value) -> Result<(), Error> {
        self.broadcast(GatewayPayload::status_update(presence), false)
            .await
    }

    /// Request member chunks for a guild (op 8)
    pub async fn request_guild_members(
        &self,
        guild_id: u64,
        query: &str,
        limit: u32,
    ) -> Result<(), Error> {
        let payload = GatewayPayload::request_guild_members(guild_id, query, limit);
        self.send_to_guild(guild_id, payload, false).await
    }

    /// Join, move or leave a voice channel (op 4)
    pub async fn update_voice_state(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), Error> {
        let payload =
            GatewayPayload::voice_state_update(guild_id, channel_id, self_mute, self_deaf);
        self.send_to_guild(guild_id, payload, false).await
    }

    /// Current status of an owned shard
    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        if !self.state.read().shards.contains_key(&shard_id) {
            return None;
        }
        Some(self.metrics.shard_status(shard_id))
    }

    /// Last heartbeat round trip of a shard
    pub fn ping(&self, shard_id: u32) -> Option<Duration> {
        self.metrics.shard_ping(shard_id)
    }

    /// Mean heartbeat round trip across shards
    pub fn average_ping(&self) -> Option<Duration> {
        self.metrics.average_ping()
    }

    /// Force reconnection of a specific shard
    pub async fn reconnect_shard(&self, shard_id: u32, reidentify: bool) -> Result<(), Error> {
        self.handle(shard_id)?.reconnect(reidentify).await
    }

    /// Destroy every shard and wait for their tasks to finish.
    ///
    /// Safe to call while `start` is still spawning; it stops spawning.
    pub async fn destroy(&self) -> Result<(), Error> {
        info!("Destroying GatewayManager");
        self.shutdown().await;
        info!("GatewayManager destroyed");
        Ok(())
    }

    async fn shutdown(&self) {
        let shards: Vec<ShardHandle> = {
            let mut state = self.state.write();
            state.is_running = false;
            state.pending.clear();
            std::mem::take(&mut state.shards).into_values().collect()
        };

        for shard in &shards {
            shard.destroy();
        }
        drop(shards);

        let handles: HashMap<u32, JoinHandle<()>> = {
            let mut handles = self.shard_handles.write();
            std::mem::take(&mut *handles)
        };

        for (shard_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!("[SHARD-{}] Task join failed: {}", shard_id, e);
            }
        }
    }

    /// Create a new shard. Resolves when its first session is ready.
    fn create_shard(
        &self,
        shard_id: u32,
        ctx: Arc<ShardContext>,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = mpsc::channel::<ShardCommand>(DEFAULT_CHANNEL_SIZE);
        let (spawned_tx, spawned_rx) = oneshot::channel();

        debug!("[SHARD-{}] Creating shard", shard_id);
        self.metrics.set_status(shard_id, ShardStatus::Idle);

        let handler = self.handler.clone();
        let metrics = self.metrics.clone();
        let handle = tokio::spawn(async move {
            Self::run_connection_with_recovery(shard_id, handler, ctx, metrics, rx, spawned_tx)
                .await
        });

        self.state
            .write()
            .shards
            .insert(shard_id, ShardHandle::new(shard_id, tx));
        self.shard_handles.write().insert(shard_id, handle);

        spawned_rx
    }

    /// Run connection with panic recovery
    async fn run_connection_with_recovery(
        shard_id: u32,
        handler: Arc<H>,
        ctx: Arc<ShardContext>,
        metrics: Arc<Metrics>,
        command_rx: mpsc::Receiver<ShardCommand>,
        spawned_tx: oneshot::Sender<Result<(), Error>>,
    ) {
        let connection = Connection::new(shard_id, handler, ctx, command_rx, Some(spawned_tx));

        match AssertUnwindSafe(connection.run()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!("[SHARD-{}] Connection task completed normally", shard_id);
            }
            Ok(Err(e)) => {
                warn!(
                    "[SHARD-{}] Connection task ended with error: {}",
                    shard_id, e
                );
            }
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    "[SHARD-{}] Connection task PANICKED: {}. Shard is now dead.",
                    shard_id, panic_msg
                );
                metrics.record_error();
                metrics.update_shard(shard_id, |s| {
                    s.status = ShardStatus::Destroyed;
                    s.is_connected = false;
                });
            }
        }
    }
}

impl<H: EventHandler> Drop for GatewayManager<H> {
    fn drop(&mut self) {
        // Abort all shard handles to prevent orphaned tasks
        let handles = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, handle) in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, ConnectionConfig, HeartbeatConfig, ShardingConfig};
    use crate::handler::DispatchEvent;
    use crate::protocol::OpCode;
    use crate::test_gateway::{guild_on_shard, Behavior, TestGateway};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestHandler;

    impl EventHandler for TestHandler {
        async fn on_dispatch(&self, _event: DispatchEvent) {}
    }

    fn config() -> GatewayConfig {
        GatewayConfig::builder()
            .token("test-token")
            .shard_count(ShardCount::Fixed(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_shard() {
        let manager = GatewayManager::new(config(), TestHandler);

        assert!(manager.status(0).is_none());
        let err = manager
            .send(0, GatewayPayload::heartbeat(None), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotFound(0)));
        assert!(matches!(
            manager.reconnect_shard(5, false).await,
            Err(Error::ShardNotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_routing_requires_resolved_count() {
        let manager = GatewayManager::new(config(), TestHandler);
        assert!(manager.shard_for_guild(1 << 22).is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_start() {
        let manager = GatewayManager::new(config(), TestHandler);
        let source = StaticGatewayInfo::new("not a url", 2);

        let err = manager.start(&source).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
        assert!(!manager.is_running());
        assert_eq!(manager.total_shards(), Some(2));
        assert!(manager.shard_ids().is_empty());
    }

    #[tokio::test]
    async fn test_auto_count_validates_shard_ids() {
        let config = GatewayConfig::builder()
            .token("test-token")
            .shard_ids(vec![0, 5])
            .build()
            .unwrap();
        let manager = GatewayManager::new(config, TestHandler);
        let source = StaticGatewayInfo::new("ws://127.0.0.1:1", 3);

        let err = manager.start(&source).await.unwrap_err();
        assert!(matches!(err, Error::InvalidShardConfig(_)));
        assert_eq!(manager.total_shards(), Some(3));
        assert_eq!(manager.shard_for_guild(4 << 22).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_destroy_before_start() {
        let manager = GatewayManager::new(config(), TestHandler);
        manager.destroy().await.unwrap();
        assert!(!manager.is_running());
        assert!(manager.broadcast(GatewayPayload::heartbeat(None), true).await.is_ok());
    }

    #[derive(Default)]
    struct Recorder {
        all_ready: AtomicUsize,
        invalid_sessions: AtomicUsize,
        dispatches: parking_lot::Mutex<Vec<(String, Option<u64>)>>,
        ready: parking_lot::Mutex<Vec<u32>>,
        unavailable: parking_lot::Mutex<Vec<HashSet<u64>>>,
        resumed: parking_lot::Mutex<Vec<(u32, u64)>>,
    }

    impl EventHandler for Recorder {
        async fn on_dispatch(&self, event: DispatchEvent) {
            self.dispatches.lock().push((event.name, event.sequence));
        }

        async fn on_shard_ready(&self, shard_id: u32, unavailable: HashSet<u64>) {
            self.ready.lock().push(shard_id);
            self.unavailable.lock().push(unavailable);
        }

        async fn on_shard_resumed(&self, shard_id: u32, replayed: u64) {
            self.resumed.lock().push((shard_id, replayed));
        }

        async fn on_all_ready(&self) {
            self.all_ready.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_invalid_session(&self, _shard_id: u32, _resumable: bool) {
            self.invalid_sessions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config(shards: u32, identify_delay: Duration) -> GatewayConfig {
        GatewayConfig::builder()
            .token("test-token")
            .heartbeat(HeartbeatConfig { jitter: 0.0 })
            .backoff(BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: false,
            })
            .connection(ConnectionConfig {
                wait_guild_timeout: Duration::from_millis(500),
                invalid_session_delay_min: Duration::from_millis(10),
                invalid_session_delay_max: Duration::from_millis(20),
                ..ConnectionConfig::default()
            })
            .sharding(ShardingConfig {
                shard_count: ShardCount::Fixed(shards),
                identify_delay,
                spawn_timeout: Duration::from_secs(5),
                ..ShardingConfig::default()
            })
            .build()
            .unwrap()
    }

    async fn eventually(limit: Duration, f: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f()
    }

    #[tokio::test]
    async fn test_identifies_are_spaced_and_all_ready_fires_once() {
        let gateway = TestGateway::start(Behavior {
            guilds_per_shard: 2,
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(
            fast_config(3, Duration::from_millis(300)),
            Recorder::default(),
        );

        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 3))
            .await
            .unwrap();

        let identifies = gateway.received_op(OpCode::Identify);
        assert_eq!(identifies.len(), 3);
        for pair in identifies.windows(2) {
            let gap = pair[1].at.duration_since(pair[0].at);
            assert!(gap >= Duration::from_millis(290), "identifies {:?} apart", gap);
        }

        let handler = manager.handler().clone();
        assert!(eventually(Duration::from_secs(2), || handler.all_ready.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.all_ready.load(Ordering::SeqCst), 1);

        let mut ready = handler.ready.lock().clone();
        ready.sort_unstable();
        assert_eq!(ready, vec![0, 1, 2]);
        assert!(manager.is_all_ready());
        for shard_id in 0..3 {
            assert!(manager.status(shard_id).unwrap().is_established());
        }
        assert!(matches!(
            manager
                .start(&StaticGatewayInfo::new(gateway.url.clone(), 3))
                .await,
            Err(Error::AlreadyRunning)
        ));

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_acked_heartbeats_keep_one_connection() {
        let gateway = TestGateway::start(Behavior {
            heartbeat_interval_ms: 50,
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(gateway.connections(), 1);
        assert!(gateway.received_op(OpCode::Heartbeat).len() >= 4);
        assert!(manager.ping(0).is_some());
        assert_eq!(manager.status(0), Some(ShardStatus::Connected));
        assert_eq!(manager.metrics().zombies(), 0);

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_zombie_connection_resumes() {
        let gateway = TestGateway::start(Behavior {
            heartbeat_interval_ms: 100,
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        gateway.set_ack_heartbeats(false);
        assert!(
            gateway
                .wait_for(Duration::from_secs(3), |g| !g.received_op(OpCode::Resume).is_empty())
                .await
        );
        gateway.set_ack_heartbeats(true);

        let resume = &gateway.received_op(OpCode::Resume)[0];
        assert!(resume.connection >= 2);
        assert_eq!(resume.payload.d["session_id"], "session-0");
        assert_eq!(resume.payload.d["seq"], 1);
        assert_eq!(gateway.received_op(OpCode::Identify).len(), 1);

        let handler = manager.handler().clone();
        assert!(eventually(Duration::from_secs(2), || !handler.resumed.lock().is_empty()).await);
        assert_eq!(handler.resumed.lock()[0], (0, 1));
        assert!(manager.metrics().zombies() >= 1);

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_stops_heartbeats() {
        let gateway = TestGateway::start(Behavior {
            heartbeat_interval_ms: 50,
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        manager.destroy().await.unwrap();
        let sent = gateway.received_op(OpCode::Heartbeat).len();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(gateway.received_op(OpCode::Heartbeat).len(), sent);
        assert!(!manager.is_running());
        assert_eq!(manager.status(0), None);
        assert_eq!(manager.metrics().shard_status(0), ShardStatus::Destroyed);
        assert_eq!(gateway.connections(), 1);
    }

    #[tokio::test]
    async fn test_fatal_close_fails_start() {
        let gateway = TestGateway::start(Behavior {
            close_on_identify: Some(4004),
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(2, Duration::ZERO), Recorder::default());

        let err = manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FatalClose { code: 4004, .. }));
        assert!(err.is_fatal());
        assert!(!manager.is_running());
        assert_eq!(gateway.received_op(OpCode::Identify).len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.connections(), 1);
    }

    #[tokio::test]
    async fn test_invalid_session_reidentifies_on_same_connection() {
        let gateway = TestGateway::start(Behavior {
            invalid_sessions: 1,
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        let identifies = gateway.received_op(OpCode::Identify);
        assert_eq!(identifies.len(), 2);
        assert!(identifies.iter().all(|r| r.connection == 1));
        assert_eq!(gateway.connections(), 1);
        let handler = manager.handler().clone();
        assert!(eventually(Duration::from_secs(1), || {
            handler.invalid_sessions.load(Ordering::SeqCst) == 1
        })
        .await);

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_command_resumes_immediately() {
        let gateway = TestGateway::start(Behavior::default()).await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        manager.reconnect_shard(0, false).await.unwrap();
        assert!(
            gateway
                .wait_for(Duration::from_secs(2), |g| !g.received_op(OpCode::Resume).is_empty())
                .await
        );
        assert_eq!(gateway.connections(), 2);

        manager.reconnect_shard(0, true).await.unwrap();
        assert!(
            gateway
                .wait_for(Duration::from_secs(2), |g| g.received_op(OpCode::Identify).len() == 2)
                .await
        );

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_guild_traffic_goes_to_owning_shard() {
        let gateway = TestGateway::start(Behavior::default()).await;
        let manager = GatewayManager::new(fast_config(2, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 2))
            .await
            .unwrap();

        let on_one = guild_on_shard(1, 2, 5);
        let on_zero = guild_on_shard(0, 2, 3);
        assert_eq!(manager.shard_for_guild(on_one).unwrap(), 1);
        assert_eq!(manager.shard_for_guild(on_zero).unwrap(), 0);

        manager.request_guild_members(on_one, "", 10).await.unwrap();
        manager
            .update_voice_state(on_zero, None, false, true)
            .await
            .unwrap();
        manager.set_presence(serde_json::json!({ "status": "idle" })).await.unwrap();

        assert!(
            gateway
                .wait_for(Duration::from_secs(2), |g| {
                    g.received_op(OpCode::RequestGuildMembers).len() == 1
                        && g.received_op(OpCode::VoiceStateUpdate).len() == 1
                        && g.received_op(OpCode::StatusUpdate).len() == 2
                })
                .await
        );
        assert_eq!(gateway.received_op(OpCode::RequestGuildMembers)[0].shard_id, Some(1));
        assert_eq!(gateway.received_op(OpCode::VoiceStateUpdate)[0].shard_id, Some(0));

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_without_sequence_is_forwarded() {
        let gateway = TestGateway::start(Behavior {
            after_ready: vec![
                r#"{"op":0,"t":"NO_SEQ","d":{}}"#.to_string(),
                r#"{"op":0,"t":"WITH_SEQ","s":2,"d":{}}"#.to_string(),
            ],
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        let handler = manager.handler().clone();
        assert!(eventually(Duration::from_secs(2), || handler.dispatches.lock().len() == 3).await);
        assert_eq!(
            *handler.dispatches.lock(),
            vec![
                ("READY".to_string(), Some(1)),
                ("NO_SEQ".to_string(), None),
                ("WITH_SEQ".to_string(), Some(2)),
            ]
        );
        assert_eq!(manager.metrics().shard(0).unwrap().sequence, Some(2));
        assert_eq!(manager.metrics().dispatches(), 3);

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_hello_drops_socket_and_retries() {
        let gateway = TestGateway::start(Behavior {
            send_hello: false,
            ..Behavior::default()
        })
        .await;
        let mut config = fast_config(1, Duration::ZERO);
        config.connection.hello_timeout = Duration::from_millis(100);
        let manager = GatewayManager::new(config, Recorder::default());

        let source = StaticGatewayInfo::new(gateway.url.clone(), 1);
        let (started, _) = tokio::join!(manager.start(&source), async {
            gateway
                .wait_for(Duration::from_secs(3), |g| g.connections() >= 2)
                .await;
            gateway.set_send_hello(true);
        });
        started.unwrap();

        assert!(gateway.connections() >= 2);
        assert!(manager.metrics().errors() >= 1);
        assert_eq!(gateway.received_op(OpCode::Identify).len(), 1);
        assert!(manager.status(0).unwrap().is_established());

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_guild_wait_timeout_reports_unavailable() {
        let gateway = TestGateway::start(Behavior {
            guilds_per_shard: 2,
            withhold_guilds: 1,
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        let handler = manager.handler().clone();
        assert!(eventually(Duration::from_secs(2), || handler.all_ready.load(Ordering::SeqCst) == 1).await);
        let withheld: HashSet<u64> = [guild_on_shard(0, 1, 1)].into_iter().collect();
        assert_eq!(*handler.unavailable.lock(), vec![withheld]);
        assert_eq!(*handler.ready.lock(), vec![0]);
        assert!(manager.is_all_ready());

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_unusable_resume_url_falls_back_to_gateway_url() {
        let gateway = TestGateway::start(Behavior {
            resume_url: Some("not a url".to_string()),
            ..Behavior::default()
        })
        .await;
        let manager = GatewayManager::new(fast_config(1, Duration::ZERO), Recorder::default());
        manager
            .start(&StaticGatewayInfo::new(gateway.url.clone(), 1))
            .await
            .unwrap();

        manager.reconnect_shard(0, false).await.unwrap();
        assert!(
            gateway
                .wait_for(Duration::from_secs(2), |g| !g.received_op(OpCode::Resume).is_empty())
                .await
        );
        assert_eq!(gateway.received_op(OpCode::Resume)[0].connection, 2);

        let handler = manager.handler().clone();
        assert!(eventually(Duration::from_secs(2), || handler.resumed.lock().len() == 1).await);
        assert!(manager.is_running());
        assert!(manager.status(0).unwrap().is_established());

        manager.destroy().await.unwrap();
    }
}
