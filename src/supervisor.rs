use crate::config::{ProcessSpec, ShardCount, SupervisorConfig};
use crate::error::Error;
use crate::ipc::{millis, spawn_line_bridge, IpcMessage, RequestOutcome};
use crate::manager::GatewayInfoSource;
use crate::worker::{
    WorkerClient, WorkerMode, ENV_MANAGED, ENV_MODE, ENV_SHARDS, ENV_SHARD_COUNT, ENV_WORKER_ID,
};
use futures_util::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Entry point of an in-process worker
pub type WorkerTask = Arc<dyn Fn(WorkerClient) -> BoxFuture<'static, ()> + Send + Sync>;

/// How workers are started
#[derive(Clone)]
pub enum WorkerLauncher {
    /// Run a program per worker; IPC over its stdin/stdout
    Process(ProcessSpec),
    /// Run a task per worker inside this runtime; IPC over channels
    Task(WorkerTask),
}

impl WorkerLauncher {
    pub fn process(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self::Process(ProcessSpec {
            program: program.into(),
            args,
        })
    }

    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkerClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Task(Arc::new(move |client| Box::pin(f(client))))
    }

    pub fn mode(&self) -> WorkerMode {
        match self {
            Self::Process(_) => WorkerMode::Process,
            Self::Task(_) => WorkerMode::Worker,
        }
    }
}

impl fmt::Debug for WorkerLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(spec) => f.debug_tuple("Process").field(spec).finish(),
            Self::Task(_) => f.write_str("Task(..)"),
        }
    }
}

/// Pacing for [`ShardingSupervisor::respawn_all`]
#[derive(Debug, Clone, Copy)]
pub struct RespawnOptions {
    /// Minimum time between two workers' respawns
    pub shard_delay: Duration,
    /// Pause between killing a worker and starting it again
    pub respawn_delay: Duration,
    /// Ready deadline per worker; `None` does not wait for ready
    pub timeout: Option<Duration>,
}

impl Default for RespawnOptions {
    fn default() -> Self {
        Self {
            shard_delay: Duration::from_secs(5),
            respawn_delay: Duration::from_millis(500),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Split `0..total` into contiguous ranges of at most `per_worker` shards.
pub fn partition_shards(total: u32, per_worker: u32) -> Vec<Range<u32>> {
    let per_worker = per_worker.max(1);
    (0..total)
        .step_by(per_worker as usize)
        .map(|start| start..start.saturating_add(per_worker).min(total))
        .collect()
}

/// Worker lifecycle callbacks. Every method has a no-op default.
pub trait SupervisorHandler: Send + Sync + 'static {
    fn on_worker_spawn(&self, _worker_id: u32, _shard_ids: &[u32]) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_worker_ready(&self, _worker_id: u32) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The worker's process or task ended. A respawn may follow.
    fn on_worker_death(&self, _worker_id: u32, _reason: &str) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Shard lifecycle reports and application messages from a worker.
    fn on_worker_message(
        &self,
        _worker_id: u32,
        _message: &IpcMessage,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

impl SupervisorHandler for () {}

struct WorkerSlot {
    generation: u64,
    tx: mpsc::UnboundedSender<IpcMessage>,
    kill: Option<oneshot::Sender<()>>,
    ready: Option<oneshot::Sender<()>>,
    is_ready: bool,
    monitor: Option<JoinHandle<()>>,
}

struct PendingRequest {
    worker_id: u32,
    generation: u64,
    tx: oneshot::Sender<RequestOutcome>,
}

enum WorkerExit {
    Process(Child),
    Task(JoinHandle<()>),
}

impl WorkerExit {
    async fn wait(&mut self) -> String {
        match self {
            Self::Process(child) => match child.wait().await {
                Ok(status) => format!("process exited with {}", status),
                Err(e) => format!("process wait failed: {}", e),
            },
            Self::Task(handle) => match handle.await {
                Ok(()) => "task finished".to_string(),
                Err(e) if e.is_panic() => "task panicked".to_string(),
                Err(_) => "task aborted".to_string(),
            },
        }
    }

    fn kill(&mut self) {
        match self {
            Self::Process(child) => {
                if let Err(e) = child.start_kill() {
                    debug!("Kill of worker process failed: {}", e);
                }
            }
            Self::Task(handle) => handle.abort(),
        }
    }
}

struct Shared<S> {
    config: SupervisorConfig,
    launcher: WorkerLauncher,
    handler: Arc<S>,
    total_shards: OnceLock<u32>,
    /// Worker id -> shard ids; fixed once spawned
    layout: RwLock<BTreeMap<u32, Vec<u32>>>,
    workers: RwLock<BTreeMap<u32, WorkerSlot>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Distributes shards over worker processes or tasks and routes requests between them.
///
/// Each worker runs its own [`GatewayManager`](crate::GatewayManager) for a
/// contiguous range of shard ids and reports back through a
/// [`WorkerClient`]. Exited workers are respawned when configured.
pub struct ShardingSupervisor<S: SupervisorHandler = ()> {
    shared: Arc<Shared<S>>,
}

impl<S: SupervisorHandler> ShardingSupervisor<S> {
    pub fn new(config: SupervisorConfig, launcher: WorkerLauncher, handler: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                handler: Arc::new(handler),
                total_shards: OnceLock::new(),
                layout: RwLock::new(BTreeMap::new()),
                workers: RwLock::new(BTreeMap::new()),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    pub fn handler(&self) -> &Arc<S> {
        &self.shared.handler
    }

    pub fn total_shards(&self) -> Option<u32> {
        self.shared.total_shards.get().copied()
    }

    /// Worker ids in spawn order
    pub fn worker_ids(&self) -> Vec<u32> {
        self.shared.layout.read().keys().copied().collect()
    }

    pub fn worker_shards(&self, worker_id: u32) -> Option<Vec<u32>> {
        self.shared.layout.read().get(&worker_id).cloned()
    }

    pub fn worker_for_shard(&self, shard_id: u32) -> Option<u32> {
        self.shared.worker_for_shard(shard_id)
    }

    /// Workers whose process or task is currently running
    pub fn live_workers(&self) -> Vec<u32> {
        self.shared.workers.read().keys().copied().collect()
    }

    pub fn is_worker_ready(&self, worker_id: u32) -> bool {
        self.shared
            .workers
            .read()
            .get(&worker_id)
            .is_some_and(|slot| slot.is_ready)
    }

    /// Resolve the shard count, then start every worker in turn.
    ///
    /// Each worker must report ready within `spawn_timeout` before the next
    /// one starts `spawn_delay` later.
    pub async fn spawn(&self, source: &impl GatewayInfoSource) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if !shared.layout.read().is_empty() {
            return Err(Error::AlreadyRunning);
        }

        let total = match shared.config.total_shards {
            ShardCount::Fixed(n) => n,
            ShardCount::Auto => source.gateway_info().await?.shards,
        };
        if total == 0 {
            return Err(Error::InvalidShardConfig(
                "total shard count must be > 0".to_string(),
            ));
        }
        let total = *shared.total_shards.get_or_init(|| total);

        let ranges = partition_shards(total, shared.config.shards_per_worker);
        {
            let mut layout = shared.layout.write();
            for (worker_id, range) in ranges.iter().enumerate() {
                layout.insert(worker_id as u32, range.clone().collect());
            }
        }
        info!(
            "Spawning {} workers ({} mode) for {} shards",
            ranges.len(),
            shared.launcher.mode().as_str(),
            total
        );

        for worker_id in 0..ranges.len() as u32 {
            if worker_id > 0 && !shared.config.spawn_delay.is_zero() {
                tokio::time::sleep(shared.config.spawn_delay).await;
            }
            if shared.shutting_down.load(Ordering::SeqCst) {
                return Err(Error::ShuttingDown);
            }
            let ready = shared.launch(worker_id)?;
            shared
                .await_ready(worker_id, ready, Some(shared.config.spawn_timeout))
                .await?;
        }

        info!("All {} workers ready", ranges.len());
        Ok(())
    }

    /// Evaluate a script in one worker.
    pub async fn eval(
        &self,
        worker_id: u32,
        script: impl Into<String>,
        context: Option<Value>,
    ) -> Result<Value, Error> {
        let script = script.into();
        self.shared
            .request(worker_id, |nonce| IpcMessage::Eval {
                nonce,
                script,
                context,
            })
            .await
    }

    /// Evaluate a script in the worker that owns `shard_id`.
    pub async fn eval_on_shard(
        &self,
        shard_id: u32,
        script: impl Into<String>,
        context: Option<Value>,
    ) -> Result<Value, Error> {
        let worker_id = self
            .shared
            .worker_for_shard(shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        self.eval(worker_id, script, context).await
    }

    /// Evaluate a script in every worker, results in worker order.
    pub async fn broadcast_eval(
        &self,
        script: impl Into<String>,
        context: Option<Value>,
    ) -> Result<Vec<Value>, Error> {
        self.shared.broadcast_eval(script.into(), context).await
    }

    /// Read a client value from one worker.
    pub async fn fetch_value(
        &self,
        worker_id: u32,
        property: impl Into<String>,
    ) -> Result<Value, Error> {
        let property = property.into();
        self.shared
            .request(worker_id, |nonce| IpcMessage::FetchValue { nonce, property })
            .await
    }

    /// Read a client value from every worker, results in worker order.
    pub async fn fetch_values(&self, property: impl Into<String>) -> Result<Vec<Value>, Error> {
        self.shared.fetch_values(property.into()).await
    }

    /// Send an application message to one worker.
    pub fn send(&self, worker_id: u32, message: Value) -> Result<(), Error> {
        self.shared.send(worker_id, IpcMessage::Custom(message))
    }

    /// Send an application message to every live worker.
    pub fn broadcast(&self, message: Value) -> Result<(), Error> {
        let failed: Vec<u32> = self
            .shared
            .workers
            .read()
            .iter()
            .filter(|(_, slot)| slot.tx.send(IpcMessage::Custom(message.clone())).is_err())
            .map(|(&id, _)| id)
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Ipc(format!("workers {:?} unreachable", failed)))
        }
    }

    /// Kill a worker and start it again.
    pub async fn respawn(&self, worker_id: u32) -> Result<(), Error> {
        self.shared
            .respawn_worker(
                worker_id,
                self.shared.config.respawn_delay,
                Some(self.shared.config.spawn_timeout),
            )
            .await
    }

    /// Respawn every worker one after another.
    pub async fn respawn_all(&self, options: RespawnOptions) -> Result<(), Error> {
        self.shared.respawn_all(options).await
    }

    /// Kill a worker without respawning it.
    pub async fn kill(&self, worker_id: u32) -> Result<(), Error> {
        if self.shared.stop_worker(worker_id).await {
            Ok(())
        } else {
            Err(Error::WorkerNotFound(worker_id))
        }
    }

    /// Ask every worker to stop, then kill what is left.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down supervisor");

        let ids: Vec<u32> = shared.workers.read().keys().copied().collect();
        for &worker_id in &ids {
            let _ = shared.send(worker_id, IpcMessage::Shutdown);
        }
        for worker_id in ids {
            shared.stop_worker(worker_id).await;
        }
        shared.pending.lock().clear();
    }
}

impl<S: SupervisorHandler> Drop for ShardingSupervisor<S> {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        for slot in self.shared.workers.write().values_mut() {
            if let Some(kill) = slot.kill.take() {
                let _ = kill.send(());
            }
        }
    }
}

impl<S: SupervisorHandler> Shared<S> {
    fn worker_for_shard(&self, shard_id: u32) -> Option<u32> {
        self.layout
            .read()
            .iter()
            .find(|(_, shards)| shards.contains(&shard_id))
            .map(|(&id, _)| id)
    }

    fn send(&self, worker_id: u32, message: IpcMessage) -> Result<(), Error> {
        let workers = self.workers.read();
        let slot = workers
            .get(&worker_id)
            .ok_or(Error::WorkerNotFound(worker_id))?;
        slot.tx
            .send(message)
            .map_err(|_| Error::ChannelSend(format!("worker {} link closed", worker_id)))
    }

    /// Start a worker's process or task and its monitor. Returns the ready signal.
    fn launch(self: &Arc<Self>, worker_id: u32) -> Result<oneshot::Receiver<()>, Error> {
        let shard_ids = self
            .layout
            .read()
            .get(&worker_id)
            .cloned()
            .ok_or(Error::WorkerNotFound(worker_id))?;
        let total = self.total_shards.get().copied().ok_or_else(|| {
            Error::InvalidShardConfig("shard count has not been resolved".to_string())
        })?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx, exit) = match &self.launcher {
            WorkerLauncher::Process(spec) => {
                let shards = shard_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let mut child = Command::new(&spec.program)
                    .args(&spec.args)
                    .env(ENV_MANAGED, "true")
                    .env(ENV_WORKER_ID, worker_id.to_string())
                    .env(ENV_SHARDS, shards)
                    .env(ENV_SHARD_COUNT, total.to_string())
                    .env(ENV_MODE, WorkerMode::Process.as_str())
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Ipc("worker stdin unavailable".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Ipc("worker stdout unavailable".to_string()))?;
                let (tx, rx) = spawn_line_bridge(stdout, stdin, format!("WORKER-{}", worker_id));
                (tx, rx, WorkerExit::Process(child))
            }
            WorkerLauncher::Task(task) => {
                let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
                let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel();
                let client = WorkerClient::new(
                    worker_id,
                    shard_ids.clone(),
                    total,
                    WorkerMode::Worker,
                    from_worker_tx,
                    to_worker_rx,
                    self.config.request_timeout,
                );
                let handle = tokio::spawn(task(client));
                (to_worker_tx, from_worker_rx, WorkerExit::Task(handle))
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            // held while the monitor starts so its first message finds the slot
            let mut workers = self.workers.write();
            let monitor = tokio::spawn(Arc::clone(self).monitor(
                worker_id,
                generation,
                shard_ids.clone(),
                rx,
                exit,
                kill_rx,
            ));
            workers.insert(
                worker_id,
                WorkerSlot {
                    generation,
                    tx,
                    kill: Some(kill_tx),
                    ready: Some(ready_tx),
                    is_ready: false,
                    monitor: Some(monitor),
                },
            );
        }

        info!(
            "[WORKER-{}] Spawned with shards {:?} (generation {})",
            worker_id, shard_ids, generation
        );
        Ok(ready_rx)
    }

    async fn await_ready(
        &self,
        worker_id: u32,
        ready: oneshot::Receiver<()>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "[WORKER-{}] Not ready after {}ms",
                        worker_id,
                        timeout.as_millis()
                    );
                    return Err(Error::SpawnTimeout {
                        worker_id,
                        timeout_ms: millis(timeout),
                    });
                }
            },
            None => ready.await,
        };
        result.map_err(|_| Error::WorkerExited {
            worker_id,
            reason: "exited before becoming ready".to_string(),
        })
    }

    async fn monitor(
        self: Arc<Self>,
        worker_id: u32,
        generation: u64,
        shard_ids: Vec<u32>,
        mut rx: mpsc::UnboundedReceiver<IpcMessage>,
        mut exit: WorkerExit,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        self.handler.on_worker_spawn(worker_id, &shard_ids).await;

        let mut killed = false;
        let reason = loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.on_worker_message(worker_id, generation, message).await,
                    None => break exit.wait().await,
                },
                reason = exit.wait() => break reason,
                _ = &mut kill_rx => {
                    killed = true;
                    exit.kill();
                    break exit.wait().await;
                }
            }
        };

        self.on_worker_exit(worker_id, generation, reason, killed)
            .await;
    }

    async fn on_worker_message(self: &Arc<Self>, worker_id: u32, generation: u64, message: IpcMessage) {
        match message {
            IpcMessage::Ready => {
                let ready = {
                    let mut workers = self.workers.write();
                    match workers.get_mut(&worker_id) {
                        Some(slot) if slot.generation == generation => {
                            slot.is_ready = true;
                            slot.ready.take()
                        }
                        _ => None,
                    }
                };
                if let Some(ready) = ready {
                    let _ = ready.send(());
                }
                info!("[WORKER-{}] Ready", worker_id);
                self.handler.on_worker_ready(worker_id).await;
            }
            IpcMessage::EvalResult { nonce, outcome }
            | IpcMessage::FetchValueResult { nonce, outcome } => {
                self.resolve(worker_id, nonce, outcome);
            }
            IpcMessage::BroadcastEval {
                nonce,
                script,
                context,
            } => {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = match shared.broadcast_eval(script, context).await {
                        Ok(values) => RequestOutcome::Ok(Value::Array(values)),
                        Err(e) => RequestOutcome::Err(e.to_string()),
                    };
                    let _ = shared.send(worker_id, IpcMessage::BroadcastResult { nonce, outcome });
                });
            }
            IpcMessage::BroadcastFetch { nonce, property } => {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = match shared.fetch_values(property).await {
                        Ok(values) => RequestOutcome::Ok(Value::Array(values)),
                        Err(e) => RequestOutcome::Err(e.to_string()),
                    };
                    let _ = shared.send(worker_id, IpcMessage::BroadcastResult { nonce, outcome });
                });
            }
            IpcMessage::RespawnAll {
                shard_delay_ms,
                respawn_delay_ms,
                timeout_ms,
            } => {
                info!("[WORKER-{}] Requested respawn of every worker", worker_id);
                let options = RespawnOptions {
                    shard_delay: Duration::from_millis(shard_delay_ms),
                    respawn_delay: Duration::from_millis(respawn_delay_ms),
                    timeout: timeout_ms.map(Duration::from_millis),
                };
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = shared.respawn_all(options).await {
                        error!("Respawn of every worker failed: {}", e);
                    }
                });
            }
            other => {
                debug!("[WORKER-{}] Message: {:?}", worker_id, other);
                self.handler.on_worker_message(worker_id, &other).await;
            }
        }
    }

    fn resolve(&self, worker_id: u32, nonce: Uuid, outcome: RequestOutcome) {
        match self.pending.lock().remove(&nonce) {
            Some(request) => {
                if request.worker_id != worker_id {
                    warn!(
                        "[WORKER-{}] Answered request {} sent to worker {}",
                        worker_id, nonce, request.worker_id
                    );
                }
                let _ = request.tx.send(outcome);
            }
            None => debug!("[WORKER-{}] Late answer for {}", worker_id, nonce),
        }
    }

    async fn on_worker_exit(
        self: &Arc<Self>,
        worker_id: u32,
        generation: u64,
        reason: String,
        killed: bool,
    ) {
        let removed = {
            let mut workers = self.workers.write();
            match workers.get(&worker_id) {
                Some(slot) if slot.generation == generation => workers.remove(&worker_id),
                _ => None,
            }
        };
        // dropping the slot fails a pending ready wait
        drop(removed);
        self.pending
            .lock()
            .retain(|_, request| !(request.worker_id == worker_id && request.generation == generation));

        if killed {
            info!("[WORKER-{}] Killed: {}", worker_id, reason);
        } else {
            warn!("[WORKER-{}] Exited: {}", worker_id, reason);
        }
        self.handler.on_worker_death(worker_id, &reason).await;

        if killed || !self.config.respawn || self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.respawn_delay).await;
            if shared.shutting_down.load(Ordering::SeqCst)
                || shared.workers.read().contains_key(&worker_id)
            {
                return;
            }
            info!("[WORKER-{}] Respawning", worker_id);
            match shared.launch(worker_id) {
                Ok(ready) => {
                    if let Err(e) = shared
                        .await_ready(worker_id, ready, Some(shared.config.spawn_timeout))
                        .await
                    {
                        warn!("[WORKER-{}] Respawn did not become ready: {}", worker_id, e);
                    }
                }
                Err(e) => error!("[WORKER-{}] Respawn failed: {}", worker_id, e),
            }
        });
    }

    /// Kill a running worker and wait for its monitor. `false` if it was not running.
    async fn stop_worker(&self, worker_id: u32) -> bool {
        let slot = self.workers.write().remove(&worker_id);
        let Some(mut slot) = slot else {
            return false;
        };
        if let Some(kill) = slot.kill.take() {
            let _ = kill.send(());
        }
        if let Some(monitor) = slot.monitor.take() {
            if let Err(e) = monitor.await {
                debug!("[WORKER-{}] Monitor ended abnormally: {}", worker_id, e);
            }
        }
        true
    }

    async fn respawn_worker(
        self: &Arc<Self>,
        worker_id: u32,
        respawn_delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if !self.layout.read().contains_key(&worker_id) {
            return Err(Error::WorkerNotFound(worker_id));
        }

        self.stop_worker(worker_id).await;
        if !respawn_delay.is_zero() {
            tokio::time::sleep(respawn_delay).await;
        }
        let ready = self.launch(worker_id)?;
        match timeout {
            Some(timeout) => self.await_ready(worker_id, ready, Some(timeout)).await,
            None => Ok(()),
        }
    }

    async fn respawn_all(self: &Arc<Self>, options: RespawnOptions) -> Result<(), Error> {
        let ids: Vec<u32> = self.layout.read().keys().copied().collect();
        info!("Respawning {} workers", ids.len());

        for (i, &worker_id) in ids.iter().enumerate() {
            let pause = async {
                if i + 1 < ids.len() && !options.shard_delay.is_zero() {
                    tokio::time::sleep(options.shard_delay).await;
                }
            };
            let (result, ()) = tokio::join!(
                self.respawn_worker(worker_id, options.respawn_delay, options.timeout),
                pause
            );
            result?;
        }
        Ok(())
    }

    async fn request(
        &self,
        worker_id: u32,
        build: impl FnOnce(Uuid) -> IpcMessage,
    ) -> Result<Value, Error> {
        let (tx, generation) = {
            let workers = self.workers.read();
            let slot = workers
                .get(&worker_id)
                .ok_or(Error::WorkerNotFound(worker_id))?;
            (slot.tx.clone(), slot.generation)
        };

        let nonce = Uuid::new_v4();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.pending.lock().insert(
            nonce,
            PendingRequest {
                worker_id,
                generation,
                tx: outcome_tx,
            },
        );

        if tx.send(build(nonce)).is_err() {
            self.pending.lock().remove(&nonce);
            return Err(Error::WorkerExited {
                worker_id,
                reason: "link closed".to_string(),
            });
        }

        match tokio::time::timeout(self.config.request_timeout, outcome_rx).await {
            Ok(Ok(RequestOutcome::Ok(value))) => Ok(value),
            Ok(Ok(RequestOutcome::Err(message))) => Err(Error::Eval(message)),
            Ok(Err(_)) => Err(Error::WorkerExited {
                worker_id,
                reason: "exited before answering".to_string(),
            }),
            Err(_) => {
                self.pending.lock().remove(&nonce);
                Err(Error::RequestTimeout {
                    worker_id,
                    nonce: nonce.to_string(),
                })
            }
        }
    }

    async fn broadcast_eval(
        &self,
        script: String,
        context: Option<Value>,
    ) -> Result<Vec<Value>, Error> {
        let ids: Vec<u32> = self.layout.read().keys().copied().collect();
        let results = join_all(ids.into_iter().map(|worker_id| {
            let script = script.clone();
            let context = context.clone();
            self.request(worker_id, move |nonce| IpcMessage::Eval {
                nonce,
                script,
                context,
            })
        }))
        .await;
        results.into_iter().collect()
    }

    async fn fetch_values(&self, property: String) -> Result<Vec<Value>, Error> {
        let ids: Vec<u32> = self.layout.read().keys().copied().collect();
        let results = join_all(ids.into_iter().map(|worker_id| {
            let property = property.clone();
            self.request(worker_id, move |nonce| IpcMessage::FetchValue { nonce, property })
        }))
        .await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::StaticGatewayInfo;
    use crate::worker::EvalHandler;
    use serde_json::json;
    use tokio::sync::Notify;

    struct Echo {
        client: WorkerClient,
        exit: Notify,
    }

    impl EvalHandler for Echo {
        async fn eval(&self, script: String, _context: Option<Value>) -> Result<Value, String> {
            match script.as_str() {
                "shards" => Ok(json!(self.client.shard_ids())),
                "fail" => Err("boom".to_string()),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(Value::Null)
                }
                "relay" => self
                    .client
                    .broadcast_eval("shards", None)
                    .await
                    .map(Value::from)
                    .map_err(|e| e.to_string()),
                other => Ok(json!(other)),
            }
        }

        async fn fetch_value(&self, property: String) -> Result<Value, String> {
            match property.as_str() {
                "worker_id" => Ok(json!(self.client.worker_id())),
                other => Err(format!("unknown property '{}'", other)),
            }
        }

        async fn on_message(&self, message: Value) {
            if message == json!("exit") {
                self.exit.notify_one();
            }
        }
    }

    async fn echo_worker(client: WorkerClient) {
        let handler = Arc::new(Echo {
            client: client.clone(),
            exit: Notify::new(),
        });
        client.send_ready().unwrap();
        tokio::select! {
            _ = client.serve(handler.clone()) => {}
            _ = handler.exit.notified() => {}
        }
    }

    #[derive(Default)]
    struct Lifecycle {
        spawns: Mutex<Vec<u32>>,
        deaths: Mutex<Vec<u32>>,
    }

    impl SupervisorHandler for Lifecycle {
        async fn on_worker_spawn(&self, worker_id: u32, _shard_ids: &[u32]) {
            self.spawns.lock().push(worker_id);
        }

        async fn on_worker_death(&self, worker_id: u32, _reason: &str) {
            self.deaths.lock().push(worker_id);
        }
    }

    async fn spawned(respawn: bool) -> ShardingSupervisor<Lifecycle> {
        let config = SupervisorConfig::builder()
            .total_shards(ShardCount::Fixed(4))
            .shards_per_worker(2)
            .respawn(respawn)
            .spawn_delay(Duration::from_millis(10))
            .spawn_timeout(Duration::from_secs(2))
            .respawn_delay(Duration::from_millis(20))
            .request_timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let supervisor =
            ShardingSupervisor::new(config, WorkerLauncher::task(echo_worker), Lifecycle::default());
        supervisor
            .spawn(&StaticGatewayInfo::new("ws://127.0.0.1:1", 1))
            .await
            .unwrap();
        supervisor
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

    #[test]
    fn test_partition_shards() {
        assert_eq!(partition_shards(4, 1), vec![0..1, 1..2, 2..3, 3..4]);
        assert_eq!(partition_shards(5, 2), vec![0..2, 2..4, 4..5]);
        assert_eq!(partition_shards(3, 8), vec![0..3]);
        assert!(partition_shards(0, 2).is_empty());
    }

    #[test]
    fn test_partition_covers_every_shard_once() {
        for total in 1..40 {
            for per_worker in 1..7 {
                let ranges = partition_shards(total, per_worker);
                let flat: Vec<u32> = ranges.iter().cloned().flatten().collect();
                assert_eq!(flat, (0..total).collect::<Vec<_>>());
                assert!(ranges.iter().all(|r| r.len() as u32 <= per_worker));
            }
        }
    }

    #[test]
    fn test_launcher_mode() {
        let launcher = WorkerLauncher::process("/usr/bin/bot", vec!["--worker".to_string()]);
        assert_eq!(launcher.mode(), WorkerMode::Process);
        let launcher = WorkerLauncher::task(|_client| async {});
        assert_eq!(launcher.mode(), WorkerMode::Worker);
        assert_eq!(format!("{:?}", launcher), "Task(..)");
    }

    #[tokio::test]
    async fn test_requests_before_spawn() {
        let supervisor = ShardingSupervisor::new(
            SupervisorConfig::default(),
            WorkerLauncher::task(|_client| async {}),
            (),
        );
        assert!(matches!(
            supervisor.eval(0, "1", None).await,
            Err(Error::WorkerNotFound(0))
        ));
        assert!(matches!(
            supervisor.eval_on_shard(3, "1", None).await,
            Err(Error::ShardNotFound(3))
        ));
        assert!(matches!(supervisor.kill(0).await, Err(Error::WorkerNotFound(0))));
        assert!(supervisor.broadcast_eval("1", None).await.unwrap().is_empty());
        assert_eq!(supervisor.total_shards(), None);
    }

    #[tokio::test]
    async fn test_spawn_layout_and_eval() {
        let supervisor = spawned(false).await;

        assert_eq!(supervisor.total_shards(), Some(4));
        assert_eq!(supervisor.worker_ids(), vec![0, 1]);
        assert_eq!(supervisor.worker_shards(1), Some(vec![2, 3]));
        assert_eq!(supervisor.worker_for_shard(3), Some(1));
        assert!(supervisor.is_worker_ready(0) && supervisor.is_worker_ready(1));
        assert!(matches!(
            supervisor
                .spawn(&StaticGatewayInfo::new("ws://127.0.0.1:1", 1))
                .await,
            Err(Error::AlreadyRunning)
        ));

        assert_eq!(
            supervisor.broadcast_eval("shards", None).await.unwrap(),
            vec![json!([0, 1]), json!([2, 3])]
        );
        assert_eq!(
            supervisor.eval_on_shard(2, "shards", None).await.unwrap(),
            json!([2, 3])
        );
        assert_eq!(
            supervisor.fetch_values("worker_id").await.unwrap(),
            vec![json!(0), json!(1)]
        );
        assert!(matches!(
            supervisor.eval(0, "fail", None).await,
            Err(Error::Eval(message)) if message == "boom"
        ));
        assert!(matches!(
            supervisor.fetch_value(1, "nope").await,
            Err(Error::Eval(_))
        ));

        supervisor.shutdown().await;
        assert!(supervisor.live_workers().is_empty());
    }

    #[tokio::test]
    async fn test_worker_can_broadcast_through_supervisor() {
        let supervisor = spawned(false).await;
        assert_eq!(
            supervisor.eval(0, "relay", None).await.unwrap(),
            json!([[0, 1], [2, 3]])
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let supervisor = spawned(false).await;
        let err = supervisor.eval(1, "slow", None).await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { worker_id: 1, .. }));
        assert!(supervisor.shared.pending.lock().is_empty());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_worker_is_respawned() {
        let supervisor = spawned(true).await;
        supervisor.send(0, json!("exit")).unwrap();

        let handler = supervisor.handler().clone();
        assert!(eventually(Duration::from_secs(2), || handler.spawns.lock().len() == 3).await);
        assert_eq!(*handler.deaths.lock(), vec![0]);
        assert!(eventually(Duration::from_secs(2), || supervisor.is_worker_ready(0)).await);
        assert_eq!(
            supervisor.eval(0, "shards", None).await.unwrap(),
            json!([0, 1])
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_then_respawn() {
        let supervisor = spawned(true).await;

        supervisor.kill(1).await.unwrap();
        assert_eq!(supervisor.live_workers(), vec![0]);
        assert!(matches!(
            supervisor.eval(1, "shards", None).await,
            Err(Error::WorkerNotFound(1))
        ));
        assert!(supervisor.broadcast_eval("shards", None).await.is_err());

        // killed workers are not respawned on their own
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.live_workers(), vec![0]);

        supervisor.respawn(1).await.unwrap();
        assert_eq!(supervisor.live_workers(), vec![0, 1]);
        assert_eq!(
            supervisor.eval(1, "shards", None).await.unwrap(),
            json!([2, 3])
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_respawn_all() {
        let supervisor = spawned(true).await;
        supervisor
            .respawn_all(RespawnOptions {
                shard_delay: Duration::from_millis(10),
                respawn_delay: Duration::from_millis(10),
                timeout: Some(Duration::from_secs(2)),
            })
            .await
            .unwrap();

        let handler = supervisor.handler().clone();
        assert_eq!(*handler.spawns.lock(), vec![0, 1, 0, 1]);
        assert_eq!(*handler.deaths.lock(), vec![0, 1]);
        assert_eq!(
            supervisor.broadcast_eval("shards", None).await.unwrap(),
            vec![json!([0, 1]), json!([2, 3])]
        );

        supervisor.shutdown().await;
        assert!(matches!(
            supervisor.respawn(0).await,
            Err(Error::ShuttingDown)
        ));
    }
}
