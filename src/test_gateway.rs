//! In-process gateway used by the end-to-end tests.

use crate::protocol::{GatewayPayload, OpCode};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// How the gateway answers its clients
#[derive(Debug, Clone)]
pub(crate) struct Behavior {
    /// Greet new connections with Hello
    pub send_hello: bool,
    pub heartbeat_interval_ms: u64,
    pub ack_heartbeats: bool,
    /// Guilds announced in READY, then sent as GUILD_CREATE
    pub guilds_per_shard: u64,
    /// Trailing guilds of READY that never get a GUILD_CREATE
    pub withhold_guilds: u64,
    /// `resume_gateway_url` carried by READY
    pub resume_url: Option<String>,
    /// Raw text frames written after READY and its GUILD_CREATEs
    pub after_ready: Vec<String>,
    /// Close every identify with this code instead of answering
    pub close_on_identify: Option<u16>,
    /// Answer this many identifies with a non-resumable invalid session
    pub invalid_sessions: u32,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            send_hello: true,
            heartbeat_interval_ms: 45_000,
            ack_heartbeats: true,
            guilds_per_shard: 0,
            withhold_guilds: 0,
            resume_url: None,
            after_ready: Vec::new(),
            close_on_identify: None,
            invalid_sessions: 0,
        }
    }
}

/// A frame received from a client
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub connection: usize,
    /// Shard of the connection, known after its identify or resume
    pub shard_id: Option<u32>,
    pub payload: GatewayPayload,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct State {
    behavior: Behavior,
    connections: usize,
    received: Vec<Received>,
}

pub(crate) struct TestGateway {
    pub url: String,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

/// Guild id owned by `shard_id` of `total`
pub(crate) fn guild_on_shard(shard_id: u32, total: u32, n: u64) -> u64 {
    ((n * total as u64 + shard_id as u64) << 22) | 1
}

impl TestGateway {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(State {
            behavior,
            ..State::default()
        }));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = {
                    let mut state = accept_state.lock();
                    state.connections += 1;
                    state.connections
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        serve(ws, connection, state).await;
                    }
                });
            }
        });

        Self { url, state, task }
    }

    pub fn set_ack_heartbeats(&self, ack: bool) {
        self.state.lock().behavior.ack_heartbeats = ack;
    }

    pub fn set_send_hello(&self, hello: bool) {
        self.state.lock().behavior.send_hello = hello;
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().received.clone()
    }

    pub fn received_op(&self, op: OpCode) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.payload.op == op)
            .collect()
    }

    /// Poll until `f` holds or `limit` passes
    pub async fn wait_for(&self, limit: Duration, f: impl Fn(&TestGateway) -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if f(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f(self)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    connection: usize,
    state: Arc<Mutex<State>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let (send_hello, interval) = {
        let state = state.lock();
        (state.behavior.send_hello, state.behavior.heartbeat_interval_ms)
    };
    if send_hello
        && write
            .send(text(&GatewayPayload::hello(interval)))
            .await
            .is_err()
    {
        return;
    }

    let mut shard_id: Option<u32> = None;
    let mut seq = 0u64;

    while let Some(Ok(message)) = read.next().await {
        let payload = match message {
            Message::Text(text) => match GatewayPayload::from_json(&text) {
                Ok(payload) => payload,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };

        if let Some(id) = payload.d.get("shard").and_then(|s| s.get(0)).and_then(Value::as_u64) {
            shard_id = Some(id as u32);
        }
        if payload.op == OpCode::Resume {
            if let Some(id) = payload
                .d
                .get("session_id")
                .and_then(Value::as_str)
                .and_then(|s| s.strip_prefix("session-"))
                .and_then(|s| s.parse().ok())
            {
                shard_id = Some(id);
            }
        }

        let behavior = {
            let mut state = state.lock();
            state.received.push(Received {
                connection,
                shard_id,
                payload: payload.clone(),
                at: Instant::now(),
            });
            state.behavior.clone()
        };

        let mut replies = Vec::new();
        match payload.op {
            OpCode::Heartbeat if behavior.ack_heartbeats => {
                replies.push(text(&GatewayPayload::heartbeat_ack()));
            }
            OpCode::Identify => {
                if let Some(code) = behavior.close_on_identify {
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
                if behavior.invalid_sessions > 0 {
                    state.lock().behavior.invalid_sessions -= 1;
                    replies.push(text(&GatewayPayload::invalid_session(false)));
                } else {
                    let shard = payload.d["shard"][0].as_u64().unwrap_or(0) as u32;
                    let total = payload.d["shard"][1].as_u64().unwrap_or(1) as u32;
                    let guilds: Vec<u64> = (0..behavior.guilds_per_shard)
                        .map(|n| guild_on_shard(shard, total, n))
                        .collect();
                    let mut ready = json!({
                        "session_id": format!("session-{}", shard),
                        "guilds": guilds
                            .iter()
                            .map(|id| json!({ "id": id.to_string(), "unavailable": true }))
                            .collect::<Vec<_>>(),
                    });
                    if let Some(url) = &behavior.resume_url {
                        ready["resume_gateway_url"] = json!(url);
                    }
                    seq += 1;
                    replies.push(text(&GatewayPayload::dispatch("READY", seq, ready)));
                    let delivered = guilds.len().saturating_sub(behavior.withhold_guilds as usize);
                    for id in guilds.into_iter().take(delivered) {
                        seq += 1;
                        replies.push(text(&GatewayPayload::dispatch(
                            "GUILD_CREATE",
                            seq,
                            json!({ "id": id.to_string() }),
                        )));
                    }
                    replies.extend(behavior.after_ready.iter().cloned().map(Message::Text));
                }
            }
            OpCode::Resume => {
                seq = payload.d["seq"].as_u64().unwrap_or(0) + 1;
                replies.push(text(&GatewayPayload::dispatch("RESUMED", seq, json!({}))));
            }
            _ => {}
        }

        for reply in replies {
            if write.send(reply).await.is_err() {
                return;
            }
        }
    }
}

fn text(payload: &GatewayPayload) -> Message {
    Message::Text(payload.to_json().unwrap())
}
