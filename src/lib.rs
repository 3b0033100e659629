//! # gateway-shard-manager
//!
//! Client core for a sharded real-time chat gateway.
//!
//! ## Features
//!
//! - **Shard state machine** driving Hello, Identify/Resume, READY and guild wait
//! - **Heartbeats** with jitter, zombie detection and ping tracking
//! - **Send queue** throttled to the gateway's rolling budget, with headroom for heartbeats
//! - **Session recovery** through Resume, re-identify or backoff depending on the close code
//! - **Shard manager** that spaces identifies and routes guild traffic to its shard
//! - **Sharding supervisor** that spreads shards over worker processes or tasks
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_manager::{
//!     DispatchEvent, EventHandler, GatewayConfig, GatewayManager, StaticGatewayInfo,
//! };
//!
//! struct Bot;
//!
//! impl EventHandler for Bot {
//!     async fn on_dispatch(&self, event: DispatchEvent) {
//!         println!("[{}] {}", event.shard_id, event.name);
//!     }
//! }
//!
//! let config = GatewayConfig::builder()
//!     .token(std::env::var("BOT_TOKEN")?)
//!     .intents(513)
//!     .build()?;
//!
//! let manager = GatewayManager::new(config, Bot);
//! manager.start(&StaticGatewayInfo::new("wss://gateway.example.com", 2)).await?;
//! ```

mod config;
mod connection;
mod error;
mod handler;
mod health;
mod identify;
mod ipc;
mod manager;
mod metrics;
mod protocol;
mod queue;
mod session;
mod shard;
mod supervisor;
mod worker;

#[cfg(test)]
mod test_gateway;

pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig, GatewayConfigBuilder,
    HeartbeatConfig, IdentifyConfig, IdentifyProperties, ProcessSpec, RateLimitConfig, ShardCount,
    ShardingConfig, SupervisorConfig, SupervisorConfigBuilder,
};
pub use error::{Error, ErrorKind};
pub use handler::{DispatchEvent, EventHandler};
pub use health::{HeartbeatAction, HeartbeatMonitor};
pub use identify::IdentifyLimiter;
pub use ipc::{spawn_line_bridge, IpcChannel, IpcMessage, RequestOutcome};
pub use manager::{GatewayInfo, GatewayInfoSource, GatewayManager, StaticGatewayInfo};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{close_action, close_reason, CloseAction, GatewayPayload, OpCode};
pub use queue::{QueuePoll, SendQueue};
pub use session::{Handshake, SessionState};
pub use shard::{shard_id_for_guild, ShardCommand, ShardHandle, ShardStatus};
pub use supervisor::{
    partition_shards, RespawnOptions, ShardingSupervisor, SupervisorHandler, WorkerLauncher,
    WorkerTask,
};
pub use worker::{
    parse_shard_list, EvalHandler, ReportingHandler, WorkerClient, WorkerMode, ENV_MANAGED,
    ENV_MODE, ENV_SHARDS, ENV_SHARD_COUNT, ENV_WORKER_ID,
};

/// Result type for gateway-shard-manager operations
pub type Result<T> = std::result::Result<T, Error>;
