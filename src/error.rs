use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that is passed to [`EventHandler::on_shard_error`](crate::EventHandler::on_shard_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol or transport error
    WebSocket,
    /// Connection could not be established (timeout, refused, DNS)
    ConnectionFailed,
    /// The gateway closed the session with a code that must not be retried
    FatalClose,
    /// A bounded wait elapsed (hello, spawn, cross-worker request)
    Timeout,
    /// Malformed frame or payload
    Protocol,
    /// Manager or supervisor is shutting down
    ShuttingDown,
    /// Invalid shard layout or unknown shard
    Sharding,
    /// Worker process/task failure
    Worker,
    /// Other error
    Other,
}

/// Errors that can occur in gateway-shard-manager
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection attempt failed (transient)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Gateway URL cannot be used to connect
    #[error("Invalid gateway URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Gateway closed the connection with an unrecoverable close code
    #[error("Shard {shard_id} closed with fatal code {code}: {reason}")]
    FatalClose {
        shard_id: u32,
        code: u16,
        reason: &'static str,
    },

    /// No Hello frame arrived in time
    #[error("Shard {shard_id} did not receive Hello within {timeout_ms}ms")]
    HelloTimeout { shard_id: u32, timeout_ms: u64 },

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame did not match the gateway envelope
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Manager is shutting down or already stopped
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Manager was started twice
    #[error("Manager is already running")]
    AlreadyRunning,

    /// Shard is not owned by this manager
    #[error("Shard {0} not found")]
    ShardNotFound(u32),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// One or more shards failed a broadcast
    #[error("Broadcast failed on shards {failed:?}")]
    Broadcast { failed: Vec<u32> },

    /// Gateway info (URL / recommended shard count) could not be resolved
    #[error("Gateway info unavailable: {0}")]
    GatewayInfo(String),

    /// Invalid shard count / shard list
    #[error("Invalid shard configuration: {0}")]
    InvalidShardConfig(String),

    /// Worker id does not exist
    #[error("Worker {0} not found")]
    WorkerNotFound(u32),

    /// Worker exited before it answered or became ready
    #[error("Worker {worker_id} exited: {reason}")]
    WorkerExited { worker_id: u32, reason: String },

    /// Worker did not become ready within the spawn timeout
    #[error("Worker {worker_id} was not ready within {timeout_ms}ms")]
    SpawnTimeout { worker_id: u32, timeout_ms: u64 },

    /// Cross-worker request was not answered in time
    #[error("Request {nonce} to worker {worker_id} timed out")]
    RequestTimeout { worker_id: u32, nonce: String },

    /// Remote evaluation returned an error
    #[error("Eval error: {0}")]
    Eval(String),

    /// Worker process could not be spawned
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// IPC envelope could not be exchanged
    #[error("IPC error: {0}")]
    Ipc(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) | Error::InvalidUrl { .. } => ErrorKind::ConnectionFailed,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::HelloTimeout { .. }
            | Error::SpawnTimeout { .. }
            | Error::RequestTimeout { .. } => ErrorKind::Timeout,
            Error::Json(_) | Error::Protocol(_) | Error::Ipc(_) => ErrorKind::Protocol,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::ShardNotFound(_) | Error::InvalidShardConfig(_) | Error::Broadcast { .. } => {
                ErrorKind::Sharding
            }
            Error::WorkerNotFound(_)
            | Error::WorkerExited { .. }
            | Error::Spawn(_)
            | Error::Eval(_) => ErrorKind::Worker,
            Error::AlreadyRunning | Error::ChannelSend(_) | Error::GatewayInfo(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Returns `true` if the shard must not be reconnected after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalClose { .. } | Error::InvalidUrl { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let fatal = Error::FatalClose {
            shard_id: 0,
            code: 4004,
            reason: "Authentication failed",
        };
        assert!(fatal.is_fatal());
        assert_eq!(fatal.kind(), ErrorKind::FatalClose);

        let bad_url = Error::InvalidUrl {
            url: "nope".to_string(),
            reason: "relative URL without a base".to_string(),
        };
        assert!(bad_url.is_fatal());

        let transient = Error::ConnectionFailed("refused".to_string());
        assert!(!transient.is_fatal());
        assert_eq!(transient.kind(), ErrorKind::ConnectionFailed);
    }

    #[test]
    fn test_timeout_kinds() {
        let err = Error::RequestTimeout {
            worker_id: 2,
            nonce: "abc".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("worker 2"));
    }
}
