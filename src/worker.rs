use crate::config::{GatewayConfigBuilder, ShardCount};
use crate::error::{Error, ErrorKind};
use crate::handler::{DispatchEvent, EventHandler};
use crate::ipc::{millis, spawn_line_bridge, IpcMessage, RequestOutcome};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Set to `true` for every child launched by a supervisor
pub const ENV_MANAGED: &str = "SHARDING_MANAGER";
/// Worker id within the supervisor
pub const ENV_WORKER_ID: &str = "SHARDING_WORKER_ID";
/// Comma-separated shard ids run by the worker
pub const ENV_SHARDS: &str = "SHARDS";
/// Total shard count across every worker
pub const ENV_SHARD_COUNT: &str = "SHARD_COUNT";
/// Launch mode, `process` or `worker`
pub const ENV_MODE: &str = "SHARDING_MANAGER_MODE";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a worker was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Child process talking over stdin/stdout
    Process,
    /// Task inside the supervisor's runtime
    Worker,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "process" => Some(Self::Process),
            "worker" => Some(Self::Worker),
            _ => None,
        }
    }
}

/// Answers the supervisor's requests inside a worker.
pub trait EvalHandler: Send + Sync + 'static {
    /// Evaluate `script` against this worker's client state.
    fn eval(
        &self,
        script: String,
        context: Option<Value>,
    ) -> impl Future<Output = Result<Value, String>> + Send;

    /// Read a client value by property path, e.g. `guilds.size`.
    fn fetch_value(&self, property: String) -> impl Future<Output = Result<Value, String>> + Send {
        async move { Err(format!("unknown property '{}'", property)) }
    }

    /// Application message sent by the supervisor.
    fn on_message(&self, _message: Value) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Parse a comma-separated shard list such as `0,1,2`.
pub fn parse_shard_list(s: &str) -> Result<Vec<u32>, Error> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|_| Error::InvalidShardConfig(format!("invalid shard id '{}'", part)))
        })
        .collect::<Result<Vec<_>, _>>()
        .and_then(|ids| {
            if ids.is_empty() {
                Err(Error::InvalidShardConfig("empty shard list".to_string()))
            } else {
                Ok(ids)
            }
        })
}

/// A worker's link to its supervisor.
///
/// Cloning is cheap; every clone shares the same link.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    worker_id: u32,
    shard_ids: Vec<u32>,
    total_shards: u32,
    mode: WorkerMode,
    tx: mpsc::UnboundedSender<IpcMessage>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<IpcMessage>>>,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<RequestOutcome>>>>,
    request_timeout: Duration,
}

impl WorkerClient {
    pub(crate) fn new(
        worker_id: u32,
        shard_ids: Vec<u32>,
        total_shards: u32,
        mode: WorkerMode,
        tx: mpsc::UnboundedSender<IpcMessage>,
        mut rx: mpsc::UnboundedReceiver<IpcMessage>,
        request_timeout: Duration,
    ) -> Self {
        let pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<RequestOutcome>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        // Answers to our own requests are resolved here; everything else goes to `serve`.
        let router_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    IpcMessage::BroadcastResult { nonce, outcome } => {
                        match router_pending.lock().remove(&nonce) {
                            Some(waiter) => {
                                let _ = waiter.send(outcome);
                            }
                            None => debug!("[WORKER-{}] Late answer for {}", worker_id, nonce),
                        }
                    }
                    other => {
                        let _ = incoming_tx.send(other);
                    }
                }
            }
            router_pending.lock().clear();
        });

        Self {
            inner: Arc::new(ClientInner {
                worker_id,
                shard_ids,
                total_shards,
                mode,
                tx,
                incoming: Mutex::new(Some(incoming_rx)),
                pending,
                request_timeout,
            }),
        }
    }

    /// Connect to the supervisor that launched this process.
    ///
    /// Reads the shard layout from the environment and speaks
    /// newline-delimited JSON over stdin/stdout. Logs must go to stderr.
    pub fn from_env() -> Result<Self, Error> {
        if env::var(ENV_MANAGED).ok().as_deref() != Some("true") {
            return Err(Error::Ipc(format!("{} is not set", ENV_MANAGED)));
        }
        let worker_id = read_env(ENV_WORKER_ID)?
            .parse::<u32>()
            .map_err(|_| Error::Ipc(format!("invalid {}", ENV_WORKER_ID)))?;
        let shard_ids = parse_shard_list(&read_env(ENV_SHARDS)?)?;
        let total_shards = read_env(ENV_SHARD_COUNT)?
            .parse::<u32>()
            .map_err(|_| Error::InvalidShardConfig(format!("invalid {}", ENV_SHARD_COUNT)))?;
        match WorkerMode::parse(&read_env(ENV_MODE)?) {
            Some(WorkerMode::Process) => {}
            _ => {
                return Err(Error::Ipc(format!(
                    "{} must be 'process' for an environment client",
                    ENV_MODE
                )))
            }
        }
        if let Some(bad) = shard_ids.iter().find(|&&id| id >= total_shards) {
            return Err(Error::InvalidShardConfig(format!(
                "shard id {} is out of range for {} shards",
                bad, total_shards
            )));
        }

        let (tx, rx) = spawn_line_bridge(
            tokio::io::stdin(),
            tokio::io::stdout(),
            format!("WORKER-{}", worker_id),
        );
        info!(
            "[WORKER-{}] Attached to supervisor with shards {:?} of {}",
            worker_id, shard_ids, total_shards
        );
        Ok(Self::new(
            worker_id,
            shard_ids,
            total_shards,
            WorkerMode::Process,
            tx,
            rx,
            DEFAULT_REQUEST_TIMEOUT,
        ))
    }

    pub fn worker_id(&self) -> u32 {
        self.inner.worker_id
    }

    pub fn shard_ids(&self) -> &[u32] {
        &self.inner.shard_ids
    }

    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    pub fn mode(&self) -> WorkerMode {
        self.inner.mode
    }

    /// Apply this worker's shard layout to a gateway config.
    pub fn configure(&self, builder: GatewayConfigBuilder) -> GatewayConfigBuilder {
        builder
            .shard_count(ShardCount::Fixed(self.inner.total_shards))
            .shard_ids(self.inner.shard_ids.clone())
    }

    /// Wrap an event handler so shard lifecycle is reported to the supervisor.
    pub fn reporting<H: EventHandler>(&self, handler: H) -> ReportingHandler<H> {
        ReportingHandler {
            client: self.clone(),
            inner: handler,
        }
    }

    /// Tell the supervisor every shard of this worker is ready.
    pub fn send_ready(&self) -> Result<(), Error> {
        self.notify(IpcMessage::Ready)
    }

    /// Send an application message to the supervisor.
    pub fn send(&self, message: Value) -> Result<(), Error> {
        self.notify(IpcMessage::Custom(message))
    }

    /// Evaluate a script on every worker, results in worker order.
    pub async fn broadcast_eval(
        &self,
        script: impl Into<String>,
        context: Option<Value>,
    ) -> Result<Vec<Value>, Error> {
        let script = script.into();
        let value = self
            .request(|nonce| IpcMessage::BroadcastEval {
                nonce,
                script,
                context,
            })
            .await?;
        into_array(value)
    }

    /// Fetch a client value from every worker, results in worker order.
    pub async fn fetch_client_values(&self, property: impl Into<String>) -> Result<Vec<Value>, Error> {
        let property = property.into();
        let value = self
            .request(|nonce| IpcMessage::BroadcastFetch { nonce, property })
            .await?;
        into_array(value)
    }

    /// Ask the supervisor to respawn every worker, this one included.
    pub fn respawn_all(
        &self,
        shard_delay: Duration,
        respawn_delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.notify(IpcMessage::RespawnAll {
            shard_delay_ms: millis(shard_delay),
            respawn_delay_ms: millis(respawn_delay),
            timeout_ms: timeout.map(millis),
        })
    }

    /// Answer supervisor requests until it asks us to stop or the link closes.
    pub async fn serve<E: EvalHandler>(&self, handler: Arc<E>) -> Result<(), Error> {
        let mut incoming = self.inner.incoming.lock().take().ok_or(Error::AlreadyRunning)?;
        let worker_id = self.inner.worker_id;

        while let Some(message) = incoming.recv().await {
            match message {
                IpcMessage::Eval {
                    nonce,
                    script,
                    context,
                } => {
                    let handler = Arc::clone(&handler);
                    let tx = self.inner.tx.clone();
                    tokio::spawn(async move {
                        let outcome = RequestOutcome::from(handler.eval(script, context).await);
                        let _ = tx.send(IpcMessage::EvalResult { nonce, outcome });
                    });
                }
                IpcMessage::FetchValue { nonce, property } => {
                    let handler = Arc::clone(&handler);
                    let tx = self.inner.tx.clone();
                    tokio::spawn(async move {
                        let outcome = RequestOutcome::from(handler.fetch_value(property).await);
                        let _ = tx.send(IpcMessage::FetchValueResult { nonce, outcome });
                    });
                }
                IpcMessage::Custom(value) => handler.on_message(value).await,
                IpcMessage::Shutdown => {
                    info!("[WORKER-{}] Shutdown requested", worker_id);
                    return Ok(());
                }
                other => debug!("[WORKER-{}] Ignoring {:?}", worker_id, other),
            }
        }

        debug!("[WORKER-{}] Supervisor link closed", worker_id);
        Ok(())
    }

    fn notify(&self, message: IpcMessage) -> Result<(), Error> {
        self.inner
            .tx
            .send(message)
            .map_err(|_| Error::Ipc("supervisor link closed".to_string()))
    }

    async fn request(&self, build: impl FnOnce(Uuid) -> IpcMessage) -> Result<Value, Error> {
        let nonce = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(nonce, tx);

        if let Err(e) = self.notify(build(nonce)) {
            self.inner.pending.lock().remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(RequestOutcome::Ok(value))) => Ok(value),
            Ok(Ok(RequestOutcome::Err(message))) => Err(Error::Eval(message)),
            Ok(Err(_)) => Err(Error::Ipc("supervisor link closed".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&nonce);
                Err(Error::RequestTimeout {
                    worker_id: self.inner.worker_id,
                    nonce: nonce.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("worker_id", &self.inner.worker_id)
            .field("shard_ids", &self.inner.shard_ids)
            .field("total_shards", &self.inner.total_shards)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

fn read_env(key: &str) -> Result<String, Error> {
    env::var(key).map_err(|_| Error::Ipc(format!("{} is not set", key)))
}

fn into_array(value: Value) -> Result<Vec<Value>, Error> {
    match value {
        Value::Array(values) => Ok(values),
        other => Err(Error::Protocol(format!(
            "expected an array of results, got {}",
            other
        ))),
    }
}

/// Event handler that mirrors shard lifecycle to the supervisor.
///
/// Built with [`WorkerClient::reporting`]. Every callback is still delivered
/// to the wrapped handler.
pub struct ReportingHandler<H> {
    client: WorkerClient,
    inner: H,
}

impl<H> ReportingHandler<H> {
    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn report(&self, message: IpcMessage) {
        if let Err(e) = self.client.notify(message) {
            warn!("[WORKER-{}] Lifecycle report dropped: {}", self.client.worker_id(), e);
        }
    }
}

impl<H: EventHandler> EventHandler for ReportingHandler<H> {
    async fn on_dispatch(&self, event: DispatchEvent) {
        self.inner.on_dispatch(event).await
    }

    async fn on_shard_ready(&self, shard_id: u32, unavailable_guilds: HashSet<u64>) {
        let mut unavailable: Vec<u64> = unavailable_guilds.iter().copied().collect();
        unavailable.sort_unstable();
        self.report(IpcMessage::ShardReady {
            shard_id,
            unavailable_guilds: unavailable,
        });
        self.inner.on_shard_ready(shard_id, unavailable_guilds).await
    }

    async fn on_shard_resumed(&self, shard_id: u32, replayed: u64) {
        self.report(IpcMessage::ShardResumed { shard_id, replayed });
        self.inner.on_shard_resumed(shard_id, replayed).await
    }

    async fn on_all_ready(&self) {
        self.report(IpcMessage::Ready);
        self.inner.on_all_ready().await
    }

    async fn on_shard_reconnecting(&self, shard_id: u32) {
        self.report(IpcMessage::ShardReconnecting { shard_id });
        self.inner.on_shard_reconnecting(shard_id).await
    }

    async fn on_shard_disconnect(&self, shard_id: u32, code: Option<u16>) {
        self.report(IpcMessage::ShardDisconnect { shard_id, code });
        self.inner.on_shard_disconnect(shard_id, code).await
    }

    async fn on_shard_error(&self, shard_id: u32, kind: ErrorKind, message: &str) {
        self.inner.on_shard_error(shard_id, kind, message).await
    }

    async fn on_invalid_session(&self, shard_id: u32, resumable: bool) {
        self.inner.on_invalid_session(shard_id, resumable).await
    }

    async fn on_ping(&self, shard_id: u32, ping: Duration) {
        self.inner.on_ping(shard_id, ping).await
    }
}
