use crate::config::GatewayConfig;
use crate::error::{Error, ErrorKind};
use crate::handler::{DispatchEvent, EventHandler};
use crate::health::{HeartbeatAction, HeartbeatMonitor};
use crate::identify::IdentifyLimiter;
use crate::ipc::millis;
use crate::metrics::Metrics;
use crate::protocol::{
    close_action, close_reason, CloseAction, GatewayPayload, OpCode, RESUMABLE_CLOSE_CODE,
};
use crate::queue::{QueuePoll, SendQueue};
use crate::session::{Handshake, SessionState};
use crate::shard::{ReadyTracker, ShardCommand, ShardStatus};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Close code used when the session should not be resumed.
const NORMAL_CLOSE_CODE: u16 = 1000;

/// State shared by every shard of one manager
#[derive(Debug)]
pub(crate) struct ShardContext {
    pub total_shards: u32,
    pub gateway_url: String,
    pub config: Arc<GatewayConfig>,
    pub limiter: Arc<IdentifyLimiter>,
    pub readiness: Arc<ReadyTracker>,
    pub metrics: Arc<Metrics>,
}

/// Result of the first session of a shard, reported to the manager
pub(crate) type SpawnSignal = oneshot::Sender<Result<(), Error>>;

/// How a single connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The shard was destroyed
    Destroyed,
    /// The socket closed; `immediate` skips backoff
    Closed { code: Option<u16>, immediate: bool },
}

/// Lifecycle notifications delivered to the handler
enum ShardEvent {
    Dispatch(DispatchEvent),
    Ready(HashSet<u64>),
    Resumed(u64),
    AllReady,
    Reconnecting,
    Disconnect(Option<u16>),
    Error(ErrorKind, String),
    InvalidSession(bool),
    Ping(Duration),
}

impl ShardEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "on_dispatch",
            Self::Ready(_) => "on_shard_ready",
            Self::Resumed(_) => "on_shard_resumed",
            Self::AllReady => "on_all_ready",
            Self::Reconnecting => "on_shard_reconnecting",
            Self::Disconnect(_) => "on_shard_disconnect",
            Self::Error(..) => "on_shard_error",
            Self::InvalidSession(_) => "on_invalid_session",
            Self::Ping(_) => "on_ping",
        }
    }
}

async fn deliver<H: EventHandler>(handler: &H, shard_id: u32, event: ShardEvent) {
    match event {
        ShardEvent::Dispatch(dispatch) => handler.on_dispatch(dispatch).await,
        ShardEvent::Ready(unavailable) => handler.on_shard_ready(shard_id, unavailable).await,
        ShardEvent::Resumed(replayed) => handler.on_shard_resumed(shard_id, replayed).await,
        ShardEvent::AllReady => handler.on_all_ready().await,
        ShardEvent::Reconnecting => handler.on_shard_reconnecting(shard_id).await,
        ShardEvent::Disconnect(code) => handler.on_shard_disconnect(shard_id, code).await,
        ShardEvent::Error(kind, message) => handler.on_shard_error(shard_id, kind, &message).await,
        ShardEvent::InvalidSession(resumable) => {
            handler.on_invalid_session(shard_id, resumable).await
        }
        ShardEvent::Ping(ping) => handler.on_ping(shard_id, ping).await,
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A single gateway shard: one socket at a time, reconnecting until destroyed
pub(crate) struct Connection<H: EventHandler> {
    shard_id: u32,
    handler: Arc<H>,
    ctx: Arc<ShardContext>,
    command_rx: mpsc::Receiver<ShardCommand>,
    /// Fires once, when the first session is ready or the shard fails fatally
    spawned_tx: Option<SpawnSignal>,
    session: SessionState,
    queue: SendQueue,
    heartbeat: HeartbeatMonitor,
    status: ShardStatus,
    /// Whether the current connection reached READY or RESUMED
    established: bool,
    hello_deadline: Option<Instant>,
    pending_handshake: Option<(Instant, Handshake)>,
    ready_deadline: Option<Instant>,
}

impl<H: EventHandler> Connection<H> {
    pub fn new(
        shard_id: u32,
        handler: Arc<H>,
        ctx: Arc<ShardContext>,
        command_rx: mpsc::Receiver<ShardCommand>,
        spawned_tx: Option<SpawnSignal>,
    ) -> Self {
        let queue = SendQueue::new(&ctx.config.rate_limit);
        let heartbeat = HeartbeatMonitor::new(ctx.config.heartbeat.clone());
        Self {
            shard_id,
            handler,
            ctx,
            command_rx,
            spawned_tx,
            session: SessionState::new(),
            queue,
            heartbeat,
            status: ShardStatus::Idle,
            established: false,
            hello_deadline: None,
            pending_handshake: None,
            ready_deadline: None,
        }
    }

    /// Run the shard until it is destroyed or closed fatally
    pub async fn run(mut self) -> Result<(), Error> {
        let mut attempt = 0u32;
        let mut delay = Duration::ZERO;
        let mut is_first_connect = true;

        loop {
            if !is_first_connect {
                self.set_status(ShardStatus::Reconnecting);
                self.ctx.metrics.record_reconnection();
                self.ctx
                    .metrics
                    .update_shard(self.shard_id, |s| s.reconnect_attempt = attempt);
                self.emit(ShardEvent::Reconnecting).await;

                if !delay.is_zero() {
                    debug!(
                        "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                        self.shard_id, delay, attempt
                    );
                    if self.wait_or_destroy(delay).await {
                        self.destroyed();
                        return Ok(());
                    }
                }
            }
            is_first_connect = false;

            let result = self.connect_and_run().await;
            let purged = self.queue.purge_connection_frames();
            if purged > 0 {
                trace!(
                    "[SHARD-{}] Dropped {} connection-scoped frames",
                    self.shard_id,
                    purged
                );
            }
            if self.established {
                attempt = 0;
                self.ctx
                    .metrics
                    .update_shard(self.shard_id, |s| s.reconnect_attempt = 0);
            }

            match result {
                Ok(Outcome::Destroyed) => {
                    info!("[SHARD-{}] Destroyed", self.shard_id);
                    self.destroyed();
                    return Ok(());
                }
                Ok(Outcome::Closed { code, immediate }) => {
                    self.set_status(ShardStatus::Disconnected);
                    self.emit(ShardEvent::Disconnect(code)).await;

                    let action = close_action(code);
                    match (action, code) {
                        (CloseAction::Fatal, Some(code)) => {
                            return Err(self.fail(fatal_close(self.shard_id, code)).await);
                        }
                        (CloseAction::Reidentify, _) => {
                            info!(
                                "[SHARD-{}] Session ended by close {:?}, will re-identify",
                                self.shard_id, code
                            );
                        }
                        _ => {}
                    }
                    self.session.on_close(action);

                    delay = if immediate {
                        Duration::ZERO
                    } else {
                        let d = self.ctx.config.backoff.delay_for_attempt(attempt);
                        attempt = attempt.saturating_add(1);
                        d
                    };
                }
                Err(e) if e.is_fatal() => {
                    return Err(self.fail(e).await);
                }
                Err(e) => {
                    self.ctx.metrics.record_error();
                    warn!(
                        "[SHARD-{}] Connection error: {} (attempt {})",
                        self.shard_id,
                        e,
                        attempt + 1
                    );
                    self.emit(ShardEvent::Error(e.kind(), e.to_string())).await;
                    self.set_status(ShardStatus::Disconnected);
                    self.session.on_close(CloseAction::Resume);

                    delay = self.ctx.config.backoff.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Sleep between connections while still serving commands.
    ///
    /// Returns `true` if the shard was destroyed meanwhile.
    async fn wait_or_destroy(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ShardCommand::Send { payload, important }) => {
                        self.queue.push(payload, important);
                    }
                    Some(ShardCommand::Reconnect { reidentify }) => {
                        if reidentify {
                            self.session.reset();
                        }
                        return false;
                    }
                    Some(ShardCommand::Destroy) | None => return true,
                },
            }
        }
    }

    /// Connect and run until disconnection
    async fn connect_and_run(&mut self) -> Result<Outcome, Error> {
        let url = self.connect_url()?;
        self.set_status(ShardStatus::Connecting);
        debug!("[SHARD-{}] Connecting to {}", self.shard_id, url);

        let ws_stream = match timeout(
            self.ctx.config.connection.connect_timeout,
            connect(&url),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectionFailed("Connection timeout".to_string())),
        };

        self.ctx.metrics.record_connection();
        self.ctx.metrics.update_shard(self.shard_id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(std::time::Instant::now());
        });
        info!("[SHARD-{}] Connected to {}", self.shard_id, url);

        let (mut write, mut read) = ws_stream.split();

        self.queue.reset_window();
        self.established = false;
        self.set_status(ShardStatus::WaitingForHello);
        self.hello_deadline = Some(Instant::now() + self.ctx.config.connection.hello_timeout);

        let outcome = self.message_loop(&mut write, &mut read).await;
        self.clear_timers();

        self.ctx.metrics.update_shard(self.shard_id, |s| {
            s.is_connected = false;
            if let Some(connected_at) = s.last_connected_at {
                s.total_uptime += connected_at.elapsed();
            }
        });

        outcome
    }

    async fn message_loop(
        &mut self,
        write: &mut WsSink,
        read: &mut WsSource,
    ) -> Result<Outcome, Error> {
        loop {
            let queue_wait = self.flush_queue(write).await?;
            let deadline = self.next_deadline(queue_wait);

            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            if let Some(outcome) = self.handle_message(message, write).await? {
                                return Ok(outcome);
                            }
                        }
                        Some(Err(e)) => {
                            warn!("[SHARD-{}] WebSocket error: {}", self.shard_id, e);
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                            return Ok(Outcome::Closed { code: None, immediate: false });
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ShardCommand::Send { payload, important }) => {
                            trace!("[SHARD-{}] Queued {} (important={})", self.shard_id, payload.op, important);
                            self.queue.push(payload, important);
                        }
                        Some(ShardCommand::Reconnect { reidentify }) => {
                            info!("[SHARD-{}] Received reconnect command (reidentify={})", self.shard_id, reidentify);
                            let code = if reidentify { NORMAL_CLOSE_CODE } else { RESUMABLE_CLOSE_CODE };
                            close_socket(write, code).await;
                            return Ok(Outcome::Closed { code: Some(code), immediate: true });
                        }
                        Some(ShardCommand::Destroy) | None => {
                            self.clear_timers();
                            close_socket(write, NORMAL_CLOSE_CODE).await;
                            return Ok(Outcome::Destroyed);
                        }
                    }
                }

                _ = sleep_until(deadline) => {
                    if let Some(outcome) = self.on_timers(write).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Write everything the queue allows. Returns when the queue next frees up.
    async fn flush_queue(&mut self, write: &mut WsSink) -> Result<Option<Instant>, Error> {
        let established = self.status.is_established();
        loop {
            match self.queue.poll_next(Instant::now(), established) {
                QueuePoll::Ready(payload) => {
                    let text = payload.to_json()?;
                    trace!("[SHARD-{}] Sending {}", self.shard_id, payload.op);
                    write.send(Message::Text(text)).await?;
                    self.ctx.metrics.record_command_sent();
                }
                QueuePoll::Wait(at) => {
                    debug!(
                        "[SHARD-{}] Send budget spent, {} queued until {:?}",
                        self.shard_id,
                        self.queue.len(),
                        at.saturating_duration_since(Instant::now())
                    );
                    return Ok(Some(at));
                }
                QueuePoll::Idle => return Ok(None),
            }
        }
    }

    fn next_deadline(&self, queue_wait: Option<Instant>) -> Instant {
        [
            queue_wait,
            self.hello_deadline,
            self.heartbeat.next_due(),
            self.pending_handshake.as_ref().map(|(at, _)| *at),
            self.ready_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    /// Handle every timer that has expired
    async fn on_timers(&mut self, write: &mut WsSink) -> Result<Option<Outcome>, Error> {
        let now = Instant::now();

        if let Some(deadline) = self.hello_deadline {
            if deadline <= now {
                warn!("[SHARD-{}] Hello timeout", self.shard_id);
                return Err(Error::HelloTimeout {
                    shard_id: self.shard_id,
                    timeout_ms: millis(self.ctx.config.connection.hello_timeout),
                });
            }
        }

        if self.heartbeat.next_due().is_some_and(|due| due <= now) {
            match self.heartbeat.on_due(now) {
                HeartbeatAction::Send => {
                    debug!(
                        "[SHARD-{}] Heartbeat (seq={:?})",
                        self.shard_id,
                        self.session.sequence()
                    );
                    self.queue
                        .push(GatewayPayload::heartbeat(self.session.sequence()), true);
                    self.ctx.metrics.record_heartbeat();
                }
                HeartbeatAction::Zombie => {
                    self.ctx.metrics.record_zombie();
                    warn!(
                        "[SHARD-{}] Heartbeat not acknowledged, zombie connection; reconnecting",
                        self.shard_id
                    );
                    close_socket(write, RESUMABLE_CLOSE_CODE).await;
                    return Ok(Some(Outcome::Closed {
                        code: Some(RESUMABLE_CLOSE_CODE),
                        immediate: false,
                    }));
                }
            }
        }

        if self
            .pending_handshake
            .as_ref()
            .is_some_and(|(at, _)| *at <= now)
        {
            if let Some((_, handshake)) = self.pending_handshake.take() {
                self.send_handshake(handshake);
            }
        }

        if self.ready_deadline.is_some_and(|at| at <= now) {
            self.ready_deadline = None;
            debug!(
                "[SHARD-{}] Guild wait elapsed with {} guilds outstanding",
                self.shard_id,
                self.ctx.readiness.expected(self.shard_id)
            );
            self.finish_ready().await;
        }

        Ok(None)
    }

    async fn handle_message(
        &mut self,
        message: Message,
        write: &mut WsSink,
    ) -> Result<Option<Outcome>, Error> {
        self.ctx.metrics.record_shard_frame(self.shard_id);

        let payload = match message {
            Message::Text(text) => GatewayPayload::from_json(&text),
            Message::Binary(bytes) => serde_json::from_slice::<GatewayPayload>(&bytes),
            Message::Ping(data) => {
                trace!("[SHARD-{}] Received ping, sending pong", self.shard_id);
                write.send(Message::Pong(data)).await?;
                return Ok(None);
            }
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                match code {
                    Some(code) => info!(
                        "[SHARD-{}] Received close {} ({})",
                        self.shard_id,
                        code,
                        close_reason(code)
                    ),
                    None => info!("[SHARD-{}] Received close without code", self.shard_id),
                }
                return Ok(Some(Outcome::Closed {
                    code,
                    immediate: false,
                }));
            }
            Message::Pong(_) | Message::Frame(_) => return Ok(None),
        };

        match payload {
            Ok(payload) => self.handle_payload(payload, write).await,
            Err(e) => {
                warn!("[SHARD-{}] Dropping undecodable frame: {}", self.shard_id, e);
                self.ctx.metrics.record_error();
                Ok(None)
            }
        }
    }

    async fn handle_payload(
        &mut self,
        payload: GatewayPayload,
        write: &mut WsSink,
    ) -> Result<Option<Outcome>, Error> {
        let now = Instant::now();
        match payload.op {
            OpCode::Hello => {
                let interval = payload
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Protocol("Hello without heartbeat_interval".to_string()))?;
                let interval = Duration::from_millis(interval);
                self.hello_deadline = None;
                self.heartbeat.start(interval, now);
                debug!(
                    "[SHARD-{}] Hello, heartbeat interval {:?}",
                    self.shard_id, interval
                );
                self.schedule_handshake(now);
            }
            OpCode::HeartbeatAck => {
                self.ctx.metrics.record_heartbeat_ack();
                if let Some(ping) = self.heartbeat.record_ack(now) {
                    trace!("[SHARD-{}] Heartbeat ack in {:?}", self.shard_id, ping);
                    self.ctx.metrics.update_shard(self.shard_id, |s| s.ping = Some(ping));
                    self.emit(ShardEvent::Ping(ping)).await;
                }
                if matches!(self.status, ShardStatus::Ready | ShardStatus::Resumed) {
                    self.set_status(ShardStatus::Connected);
                }
            }
            OpCode::Heartbeat => {
                debug!("[SHARD-{}] Server requested a heartbeat", self.shard_id);
                self.heartbeat.record_requested(now);
                self.queue
                    .push(GatewayPayload::heartbeat(self.session.sequence()), true);
                self.ctx.metrics.record_heartbeat();
            }
            OpCode::Reconnect => {
                info!("[SHARD-{}] Server requested reconnect", self.shard_id);
                close_socket(write, RESUMABLE_CLOSE_CODE).await;
                return Ok(Some(Outcome::Closed {
                    code: Some(RESUMABLE_CLOSE_CODE),
                    immediate: true,
                }));
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                self.ctx.metrics.record_invalid_session();
                warn!(
                    "[SHARD-{}] Invalid session (resumable={})",
                    self.shard_id, resumable
                );
                self.emit(ShardEvent::InvalidSession(resumable)).await;
                self.ready_deadline = None;

                if resumable && self.session.can_resume() {
                    self.schedule_handshake(now);
                } else {
                    self.session.reset();
                    let delay = self.ctx.config.connection.invalid_session_delay();
                    debug!(
                        "[SHARD-{}] Re-identifying in {:?}",
                        self.shard_id, delay
                    );
                    self.schedule_handshake(now + delay);
                }
            }
            OpCode::Dispatch => self.handle_dispatch(payload).await,
            other => {
                trace!("[SHARD-{}] Ignoring {}", self.shard_id, other);
            }
        }
        Ok(None)
    }

    async fn handle_dispatch(&mut self, payload: GatewayPayload) {
        let GatewayPayload { d, s, t, .. } = payload;
        if let Some(sequence) = s {
            self.session.record_sequence(sequence);
            self.ctx
                .metrics
                .update_shard(self.shard_id, |m| m.sequence = self.session.sequence());
        }
        self.ctx.metrics.record_dispatch();

        let name = t.unwrap_or_default();
        let mut became_ready = false;
        let mut resumed = false;

        match name.as_str() {
            "READY" => {
                self.on_ready_dispatch(&d);
                became_ready = self.ctx.readiness.expected(self.shard_id) == 0;
            }
            "RESUMED" => resumed = true,
            "GUILD_CREATE" if self.status == ShardStatus::WaitingForGuilds => {
                if let Some(guild_id) = snowflake(d.get("id")) {
                    let remaining = self.ctx.readiness.guild_arrived(self.shard_id, guild_id);
                    if remaining == 0 {
                        became_ready = true;
                    } else {
                        self.ready_deadline =
                            Some(Instant::now() + self.ctx.config.connection.wait_guild_timeout);
                    }
                }
            }
            _ => {}
        }

        self.emit(ShardEvent::Dispatch(DispatchEvent {
            shard_id: self.shard_id,
            name,
            sequence: s,
            data: d,
        }))
        .await;

        if resumed {
            self.finish_resume().await;
        } else if became_ready {
            self.ready_deadline = None;
            self.finish_ready().await;
        }
    }

    fn on_ready_dispatch(&mut self, d: &Value) {
        let session_id = d.get("session_id").and_then(Value::as_str);
        let resume_url = d
            .get("resume_gateway_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        match session_id {
            Some(session_id) => self.session.establish(session_id.to_string(), resume_url),
            None => warn!("[SHARD-{}] READY without session_id", self.shard_id),
        }

        let guilds: HashSet<u64> = d
            .get("guilds")
            .and_then(Value::as_array)
            .map(|guilds| guilds.iter().filter_map(|g| snowflake(g.get("id"))).collect())
            .unwrap_or_default();

        info!(
            "[SHARD-{}] Session established, waiting for {} guilds",
            self.shard_id,
            guilds.len()
        );
        self.established = true;
        self.ctx.readiness.set_expected(self.shard_id, guilds);
        self.set_status(ShardStatus::WaitingForGuilds);
        self.ready_deadline = Some(Instant::now() + self.ctx.config.connection.wait_guild_timeout);
    }

    async fn finish_ready(&mut self) {
        let unavailable = self.ctx.readiness.take_unavailable(self.shard_id);
        self.set_status(ShardStatus::Ready);
        if unavailable.is_empty() {
            info!("[SHARD-{}] Ready", self.shard_id);
        } else {
            info!(
                "[SHARD-{}] Ready with {} unavailable guilds",
                self.shard_id,
                unavailable.len()
            );
        }
        self.emit(ShardEvent::Ready(unavailable)).await;
        self.mark_ready().await;
    }

    async fn finish_resume(&mut self) {
        let replayed = self.session.replayed();
        self.established = true;
        self.ready_deadline = None;
        self.set_status(ShardStatus::Resumed);
        info!(
            "[SHARD-{}] Resumed session, {} events replayed",
            self.shard_id, replayed
        );
        self.emit(ShardEvent::Resumed(replayed)).await;
        self.mark_ready().await;
    }

    async fn mark_ready(&mut self) {
        if let Some(tx) = self.spawned_tx.take() {
            let _ = tx.send(Ok(()));
        }
        if self.ctx.readiness.mark_ready(self.shard_id) {
            info!("[SHARD-{}] All shards ready", self.shard_id);
            self.emit(ShardEvent::AllReady).await;
        }
    }

    /// Decide Identify vs Resume and schedule it no earlier than `earliest`.
    fn schedule_handshake(&mut self, earliest: Instant) {
        let handshake = self.session.next_handshake();
        let at = match handshake {
            Handshake::Identify => {
                self.set_status(ShardStatus::Identifying);
                self.ctx.limiter.reserve_at(earliest)
            }
            Handshake::Resume { .. } => {
                self.set_status(ShardStatus::Resuming);
                earliest
            }
        };
        if at > earliest {
            debug!(
                "[SHARD-{}] Identify slot in {:?}",
                self.shard_id,
                at.saturating_duration_since(Instant::now())
            );
        }
        self.pending_handshake = Some((at, handshake));
    }

    fn send_handshake(&mut self, handshake: Handshake) {
        let identify = &self.ctx.config.identify;
        let payload = match handshake {
            Handshake::Identify => {
                info!(
                    "[SHARD-{}] Identifying as shard [{}, {}]",
                    self.shard_id, self.shard_id, self.ctx.total_shards
                );
                self.ctx.metrics.record_identify();
                GatewayPayload::identify(identify.payload(self.shard_id, self.ctx.total_shards))
            }
            Handshake::Resume {
                session_id,
                sequence,
            } => {
                info!(
                    "[SHARD-{}] Resuming session {} at seq {}",
                    self.shard_id, session_id, sequence
                );
                self.ctx.metrics.record_resume();
                GatewayPayload::resume(&identify.token, &session_id, sequence)
            }
        };
        self.queue.push(payload, true);
    }

    /// URL for the next connection. Only the configured URL can fail fatally;
    /// an unusable resume URL from the gateway is dropped.
    fn connect_url(&mut self) -> Result<String, Error> {
        let api_version = self.ctx.config.connection.api_version;
        if self.session.can_resume() {
            if let Some(resume_url) = self.session.resume_url() {
                match gateway_url_with_query(resume_url, api_version) {
                    Ok(url) => return Ok(url),
                    Err(e) => {
                        warn!("[SHARD-{}] Ignoring resume URL: {}", self.shard_id, e);
                        self.session.clear_resume_url();
                    }
                }
            }
        }
        gateway_url_with_query(&self.ctx.gateway_url, api_version)
    }

    fn set_status(&mut self, status: ShardStatus) {
        if self.status != status {
            trace!(
                "[SHARD-{}] {} -> {}",
                self.shard_id,
                self.status,
                status
            );
            self.status = status;
            self.ctx.metrics.set_status(self.shard_id, status);
        }
    }

    /// Stop every per-connection timer
    fn clear_timers(&mut self) {
        self.heartbeat.stop();
        self.hello_deadline = None;
        self.pending_handshake = None;
        self.ready_deadline = None;
    }

    fn destroyed(&mut self) {
        self.clear_timers();
        self.queue.clear();
        self.set_status(ShardStatus::Destroyed);
        if let Some(tx) = self.spawned_tx.take() {
            let _ = tx.send(Err(Error::ShuttingDown));
        }
    }

    /// Surface a fatal error and stop the shard
    async fn fail(&mut self, err: Error) -> Error {
        self.ctx.metrics.record_error();
        error!("[SHARD-{}] Fatal: {}", self.shard_id, err);
        self.emit(ShardEvent::Error(err.kind(), err.to_string())).await;
        if let Some(tx) = self.spawned_tx.take() {
            let _ = tx.send(Err(clone_fatal(&err)));
        }
        self.destroyed();
        err
    }

    /// Deliver an event to the handler, optionally with panic protection.
    ///
    /// In low-latency mode, handlers are called directly (panics crash the task).
    /// Otherwise, handlers are spawned in a separate task for panic isolation.
    async fn emit(&self, event: ShardEvent) {
        if self.ctx.config.connection.low_latency_mode {
            deliver(&*self.handler, self.shard_id, event).await;
            return;
        }

        let handler = self.handler.clone();
        let shard_id = self.shard_id;
        let name = event.name();
        let result = tokio::task::spawn(async move {
            let fut = AssertUnwindSafe(deliver(&*handler, shard_id, event));
            fut.await;
        })
        .await;

        if let Err(e) = result {
            if e.is_panic() {
                error!(
                    "[SHARD-{}] Handler.{} panicked! Event dropped. Error: {:?}",
                    shard_id, name, e
                );
                self.ctx.metrics.record_error();
            } else {
                warn!("[SHARD-{}] Handler.{} task failed: {:?}", shard_id, name, e);
            }
        }
    }
}

fn fatal_close(shard_id: u32, code: u16) -> Error {
    Error::FatalClose {
        shard_id,
        code,
        reason: close_reason(code),
    }
}

/// Copy of a fatal error for the spawn signal
fn clone_fatal(err: &Error) -> Error {
    match err {
        Error::FatalClose {
            shard_id,
            code,
            reason,
        } => Error::FatalClose {
            shard_id: *shard_id,
            code: *code,
            reason: *reason,
        },
        Error::InvalidUrl { url, reason } => Error::InvalidUrl {
            url: url.clone(),
            reason: reason.clone(),
        },
        other => Error::ConnectionFailed(other.to_string()),
    }
}

/// Parse a snowflake sent as a string or number
fn snowflake(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Append `v` and `encoding` to a gateway URL
pub(crate) fn gateway_url_with_query(base: &str, api_version: u8) -> Result<String, Error> {
    let mut url = Url::parse(base).map_err(|e| Error::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => {}
        scheme => {
            return Err(Error::InvalidUrl {
                url: base.to_string(),
                reason: format!("unsupported scheme '{}'", scheme),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidUrl {
            url: base.to_string(),
            reason: "no host".to_string(),
        });
    }
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &api_version.to_string())
        .append_pair("encoding", "json");
    Ok(url.to_string())
}

async fn close_socket(write: &mut WsSink, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        trace!("Close frame not sent: {}", e);
    }
}

/// Open a WebSocket to a gateway URL
async fn connect(url: &str) -> Result<WsStream, Error> {
    let parsed_url = Url::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let host = parsed_url.host_str().ok_or_else(|| Error::InvalidUrl {
        url: url.to_string(),
        reason: "no host".to_string(),
    })?;

    let is_tls = parsed_url.scheme() == "wss";
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

    let tcp_stream = connect_direct(host, port).await?;

    // Set TCP options for low latency
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
