//! Messages exchanged between the supervisor and its workers.
//!
//! The same envelope, `{"type": ..., "data": ...}`, is used over channels
//! (in-process workers) and as newline-delimited JSON over a child's
//! stdin/stdout.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Outcome of a remote request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Ok(Value),
    Err(String),
}

impl From<Result<Value, String>> for RequestOutcome {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(message) => Self::Err(message),
        }
    }
}

/// IPC envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum IpcMessage {
    /// Worker: every shard of the worker is ready
    Ready,
    /// Worker: a shard finished its guild wait
    ShardReady {
        shard_id: u32,
        unavailable_guilds: Vec<u64>,
    },
    /// Worker: a shard resumed its session
    ShardResumed { shard_id: u32, replayed: u64 },
    /// Worker: a shard is reconnecting
    ShardReconnecting { shard_id: u32 },
    /// Worker: a shard's socket closed
    ShardDisconnect { shard_id: u32, code: Option<u16> },

    /// Supervisor: evaluate a script in the worker
    Eval {
        nonce: Uuid,
        script: String,
        context: Option<Value>,
    },
    /// Worker: answer to `Eval`
    EvalResult { nonce: Uuid, outcome: RequestOutcome },
    /// Supervisor: read a client value by property path
    FetchValue { nonce: Uuid, property: String },
    /// Worker: answer to `FetchValue`
    FetchValueResult { nonce: Uuid, outcome: RequestOutcome },

    /// Worker: evaluate a script on every worker
    BroadcastEval {
        nonce: Uuid,
        script: String,
        context: Option<Value>,
    },
    /// Worker: fetch a client value from every worker
    BroadcastFetch { nonce: Uuid, property: String },
    /// Supervisor: answer to `BroadcastEval` / `BroadcastFetch`, an array in worker order
    BroadcastResult { nonce: Uuid, outcome: RequestOutcome },
    /// Worker: ask the supervisor to respawn every worker
    RespawnAll {
        shard_delay_ms: u64,
        respawn_delay_ms: u64,
        timeout_ms: Option<u64>,
    },

    /// Supervisor: stop gracefully
    Shutdown,
    /// Application message, either direction
    Custom(Value),
}

impl IpcMessage {
    /// Nonce of an answer to a supervisor request
    pub fn response_nonce(&self) -> Option<Uuid> {
        match self {
            Self::EvalResult { nonce, .. }
            | Self::FetchValueResult { nonce, .. }
            | Self::BroadcastResult { nonce, .. } => Some(*nonce),
            _ => None,
        }
    }

    /// Encode as one line of newline-delimited JSON
    pub fn to_line(&self) -> Result<String, Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Both ends of an IPC link
pub type IpcChannel = (
    mpsc::UnboundedSender<IpcMessage>,
    mpsc::UnboundedReceiver<IpcMessage>,
);

/// Bridge a byte stream pair to message channels.
///
/// Lines that do not parse as an envelope are skipped, so a child may still
/// print unrelated output. Both tasks end when their side closes.
pub fn spawn_line_bridge<R, W>(reader: R, writer: W, label: String) -> IpcChannel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (in_tx, in_rx) = mpsc::unbounded_channel::<IpcMessage>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<IpcMessage>();

    let read_label = label.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match IpcMessage::from_line(&line) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => trace!("[{}] Skipping non-IPC line ({}): {}", read_label, e, line),
                    }
                }
                Ok(None) => {
                    debug!("[{}] IPC input closed", read_label);
                    break;
                }
                Err(e) => {
                    warn!("[{}] IPC read failed: {}", read_label, e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = out_rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!("[{}] Dropping unencodable IPC message: {}", label, e);
                    continue;
                }
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                warn!("[{}] IPC write failed: {}", label, e);
                break;
            }
            if let Err(e) = writer.flush().await {
                warn!("[{}] IPC flush failed: {}", label, e);
                break;
            }
        }
    });

    (out_tx, in_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_envelope_shape() {
        let nonce = Uuid::new_v4();
        let message = IpcMessage::Eval {
            nonce,
            script: "guilds.size".to_string(),
            context: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "eval");
        assert_eq!(value["data"]["script"], "guilds.size");
        assert_eq!(value["data"]["nonce"], nonce.to_string());

        let value = serde_json::to_value(IpcMessage::Ready).unwrap();
        assert_eq!(value, json!({ "type": "ready" }));
    }

    #[test]
    fn test_outcome_encoding() {
        let nonce = Uuid::new_v4();
        let line = IpcMessage::EvalResult {
            nonce,
            outcome: RequestOutcome::Err("boom".to_string()),
        }
        .to_line()
        .unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""outcome":{"err":"boom"}"#));

        let parsed = IpcMessage::from_line(&line).unwrap();
        assert_eq!(parsed.response_nonce(), Some(nonce));
    }

    #[test]
    fn test_custom_message() {
        let parsed =
            IpcMessage::from_line(r#"{"type":"custom","data":{"hello":"world"}}"#).unwrap();
        assert_eq!(parsed, IpcMessage::Custom(json!({ "hello": "world" })));
        assert!(IpcMessage::from_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_line_bridge() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let (a_tx, mut a_rx) = spawn_line_bridge(our_read, our_write, "a".to_string());
        let (b_tx, mut b_rx) = spawn_line_bridge(their_read, their_write, "b".to_string());

        a_tx.send(IpcMessage::ShardReconnecting { shard_id: 3 }).unwrap();
        assert_eq!(
            b_rx.recv().await,
            Some(IpcMessage::ShardReconnecting { shard_id: 3 })
        );

        b_tx.send(IpcMessage::Ready).unwrap();
        assert_eq!(a_rx.recv().await, Some(IpcMessage::Ready));
    }
}
