//! Example: a sharded bot split over worker processes
//!
//! The same binary runs as supervisor and as worker. Started normally it
//! spawns one child per two shards; children find their shard range in the
//! environment and connect their own shards.
//!
//! Run with: BOT_TOKEN=... GATEWAY_URL=wss://... cargo run --example bot

use gateway_shard_manager::{
    DispatchEvent, EvalHandler, EventHandler, GatewayConfig, GatewayManager, IpcMessage,
    ShardCount, ShardingSupervisor, StaticGatewayInfo, SupervisorConfig, SupervisorHandler,
    WorkerClient, WorkerLauncher, ENV_MANAGED,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

const TOTAL_SHARDS: u32 = 4;

/// Counts dispatches of this worker
#[derive(Clone, Default)]
struct Bot {
    dispatches: Arc<AtomicU64>,
}

impl EventHandler for Bot {
    async fn on_dispatch(&self, event: DispatchEvent) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        if event.name == "MESSAGE_CREATE" {
            info!(
                "[SHARD-{}] {}",
                event.shard_id,
                event.data["content"].as_str().unwrap_or_default()
            );
        }
    }

    async fn on_all_ready(&self) {
        info!("Every shard of this worker is ready");
    }
}

impl EvalHandler for Bot {
    async fn eval(&self, script: String, _context: Option<Value>) -> Result<Value, String> {
        match script.as_str() {
            "dispatches" => Ok(json!(self.dispatches.load(Ordering::Relaxed))),
            other => Err(format!("unsupported script '{}'", other)),
        }
    }
}

struct Logger;

impl SupervisorHandler for Logger {
    async fn on_worker_ready(&self, worker_id: u32) {
        info!("[WORKER-{}] ready", worker_id);
    }

    async fn on_worker_death(&self, worker_id: u32, reason: &str) {
        info!("[WORKER-{}] died: {}", worker_id, reason);
    }

    async fn on_worker_message(&self, worker_id: u32, message: &IpcMessage) {
        info!("[WORKER-{}] {:?}", worker_id, message);
    }
}

async fn run_worker(url: String) -> Result<(), Box<dyn std::error::Error>> {
    let client = WorkerClient::from_env()?;
    let config = client
        .configure(GatewayConfig::builder().token(std::env::var("BOT_TOKEN")?).intents(513))
        .build()?;

    let bot = Bot::default();
    let manager = GatewayManager::new(config, client.reporting(bot.clone()));
    manager
        .start(&StaticGatewayInfo::new(url, client.total_shards()))
        .await?;

    client.serve(Arc::new(bot)).await?;
    manager.destroy().await?;
    Ok(())
}

async fn run_supervisor() -> Result<(), Box<dyn std::error::Error>> {
    let program = std::env::current_exe()?;
    let config = SupervisorConfig::builder()
        .total_shards(ShardCount::Fixed(TOTAL_SHARDS))
        .shards_per_worker(2)
        .build()?;

    let supervisor = ShardingSupervisor::new(config, WorkerLauncher::process(program, vec![]), Logger);
    supervisor
        .spawn(&StaticGatewayInfo::new("unused", TOTAL_SHARDS))
        .await?;

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let counts = supervisor.broadcast_eval("dispatches", None).await?;
    info!("Dispatches per worker: {:?}", counts);

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries IPC in worker processes, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if std::env::var(ENV_MANAGED).is_ok() {
        let url = std::env::var("GATEWAY_URL")?;
        run_worker(url).await
    } else {
        run_supervisor().await
    }
}
