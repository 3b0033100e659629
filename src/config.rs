use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a gateway shard manager
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Credentials and identify payload fields
    pub identify: IdentifyConfig,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Outbound command budget
    pub rate_limit: RateLimitConfig,
    /// Shard count and spawn pacing
    pub sharding: ShardingConfig,
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the authentication token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.identify.token = token.into();
        self
    }

    /// Set the gateway intents bitfield
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.identify.intents = intents;
        self
    }

    /// Set identify configuration
    pub fn identify(mut self, config: IdentifyConfig) -> Self {
        self.config.identify = config;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set heartbeat configuration
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.config.heartbeat = config;
        self
    }

    /// Set the outbound rate limit
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set sharding configuration
    pub fn sharding(mut self, config: ShardingConfig) -> Self {
        self.config.sharding = config;
        self
    }

    /// Set the total shard count
    pub fn shard_count(mut self, count: ShardCount) -> Self {
        self.config.sharding.shard_count = count;
        self
    }

    /// Run only these shard ids in this process
    pub fn shard_ids(mut self, ids: Vec<u32>) -> Self {
        self.config.sharding.shard_ids = Some(ids);
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let config = self.config;

        if config.identify.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        config.backoff.validate()?;

        let rate = &config.rate_limit;
        if rate.limit == 0 || rate.window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "limit and window must be > 0".to_string(),
            ));
        }
        if rate.reserved >= rate.limit {
            return Err(ConfigError::InvalidRateLimit(
                "reserved must be < limit".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&config.heartbeat.jitter) {
            return Err(ConfigError::InvalidHeartbeat(
                "jitter must be within 0.0..=1.0".to_string(),
            ));
        }

        let conn = &config.connection;
        if conn.invalid_session_delay_min > conn.invalid_session_delay_max {
            return Err(ConfigError::InvalidConnection(
                "invalid_session_delay_min must be <= invalid_session_delay_max".to_string(),
            ));
        }
        if conn.hello_timeout.is_zero() {
            return Err(ConfigError::InvalidConnection(
                "hello_timeout must be > 0".to_string(),
            ));
        }

        config.sharding.validate()?;

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token was configured
    #[error("A token is required")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid rate limit configuration
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid shard layout
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
}

/// Client properties reported in the identify payload
#[derive(Debug, Clone)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        let name = env!("CARGO_PKG_NAME").to_string();
        Self {
            os: std::env::consts::OS.to_string(),
            browser: name.clone(),
            device: name,
        }
    }
}

/// Identify payload settings
#[derive(Clone)]
pub struct IdentifyConfig {
    /// Authentication token
    pub token: String,
    /// Gateway intents bitfield
    pub intents: u64,
    /// Client properties
    pub properties: IdentifyProperties,
    /// Member count above which a guild's offline members are not sent
    pub large_threshold: u32,
    /// Initial presence sent with identify
    pub presence: Option<Value>,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: 0,
            properties: IdentifyProperties::default(),
            large_threshold: 50,
            presence: None,
        }
    }
}

impl fmt::Debug for IdentifyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifyConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("properties", &self.properties)
            .field("large_threshold", &self.large_threshold)
            .field("presence", &self.presence)
            .finish()
    }
}

impl IdentifyConfig {
    /// Build the `d` field of an identify frame for one shard.
    pub fn payload(&self, shard_id: u32, total_shards: u32) -> Value {
        let mut d = json!({
            "token": self.token,
            "intents": self.intents,
            "properties": {
                "os": self.properties.os,
                "browser": self.properties.browser,
                "device": self.properties.device,
            },
            "compress": false,
            "large_threshold": self.large_threshold,
            "shard": [shard_id, total_shards],
        });
        if let (Some(presence), Some(map)) = (&self.presence, d.as_object_mut()) {
            map.insert("presence".to_string(), presence.clone());
        }
        d
    }
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// How long to wait for Hello after the socket opens
    pub hello_timeout: Duration,
    /// How long to wait for the next GUILD_CREATE before declaring the rest unavailable
    pub wait_guild_timeout: Duration,
    /// Lower bound of the random delay before re-identifying after an invalid session
    pub invalid_session_delay_min: Duration,
    /// Upper bound of the random delay before re-identifying after an invalid session
    pub invalid_session_delay_max: Duration,
    /// Gateway API version appended to the URL
    pub api_version: u8,
    /// Low-latency mode: disable panic protection for handler callbacks.
    /// When enabled, handler panics will crash the shard task.
    pub low_latency_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(20),
            wait_guild_timeout: Duration::from_secs(15),
            invalid_session_delay_min: Duration::from_secs(1),
            invalid_session_delay_max: Duration::from_secs(5),
            api_version: 9,
            low_latency_mode: false,
        }
    }
}

impl ConnectionConfig {
    /// Pick a random delay within the invalid-session bounds.
    pub fn invalid_session_delay(&self) -> Duration {
        let min = self.invalid_session_delay_min;
        let spread = self.invalid_session_delay_max.saturating_sub(min);
        min + spread.mul_f64(rand::random::<f64>())
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        if self.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Fraction of the interval by which the first beat of a connection is
    /// randomly pulled forward
    pub jitter: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { jitter: 0.1 }
    }
}

/// Outbound command budget per shard
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Commands allowed per window
    pub limit: u32,
    /// Rolling window length
    pub window: Duration,
    /// Slots only important payloads may use
    pub reserved: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 120,
            window: Duration::from_secs(60),
            reserved: 5,
        }
    }
}

/// Total shard count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Use the count recommended by the gateway info source
    #[default]
    Auto,
    /// Use exactly this many shards
    Fixed(u32),
}

/// Sharding configuration
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Total number of shards across every process
    pub shard_count: ShardCount,
    /// Shards run by this process (all of `0..total` when `None`)
    pub shard_ids: Option<Vec<u32>>,
    /// Minimum spacing between two identifies of this manager
    pub identify_delay: Duration,
    /// How long `start` waits for each shard to establish its session
    pub spawn_timeout: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: ShardCount::Auto,
            shard_ids: None,
            identify_delay: Duration::from_secs(5),
            spawn_timeout: Duration::from_secs(30),
        }
    }
}

impl ShardingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == ShardCount::Fixed(0) {
            return Err(ConfigError::InvalidSharding(
                "shard count must be > 0".to_string(),
            ));
        }
        if let Some(ids) = &self.shard_ids {
            if ids.is_empty() {
                return Err(ConfigError::InvalidSharding(
                    "shard_ids cannot be empty".to_string(),
                ));
            }
            if let ShardCount::Fixed(total) = self.shard_count {
                if let Some(bad) = ids.iter().find(|&&id| id >= total) {
                    return Err(ConfigError::InvalidSharding(format!(
                        "shard id {} is out of range for {} shards",
                        bad, total
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Configuration for a sharding supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Total number of shards to distribute
    pub total_shards: ShardCount,
    /// Contiguous shard ids per worker
    pub shards_per_worker: u32,
    /// Respawn workers that exit
    pub respawn: bool,
    /// How long to wait for a worker's ready message
    pub spawn_timeout: Duration,
    /// Pause between starting two workers
    pub spawn_delay: Duration,
    /// Pause before respawning an exited worker
    pub respawn_delay: Duration,
    /// Deadline for cross-worker requests
    pub request_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            total_shards: ShardCount::Auto,
            shards_per_worker: 1,
            respawn: true,
            spawn_timeout: Duration::from_secs(30),
            spawn_delay: Duration::from_millis(5500),
            respawn_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    /// Create a new builder for configuration
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }
}

/// Builder for SupervisorConfig
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfigBuilder {
    config: SupervisorConfig,
}

impl SupervisorConfigBuilder {
    pub fn total_shards(mut self, count: ShardCount) -> Self {
        self.config.total_shards = count;
        self
    }

    pub fn shards_per_worker(mut self, n: u32) -> Self {
        self.config.shards_per_worker = n;
        self
    }

    pub fn respawn(mut self, enabled: bool) -> Self {
        self.config.respawn = enabled;
        self
    }

    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.config.spawn_timeout = timeout;
        self
    }

    pub fn spawn_delay(mut self, delay: Duration) -> Self {
        self.config.spawn_delay = delay;
        self
    }

    pub fn respawn_delay(mut self, delay: Duration) -> Self {
        self.config.respawn_delay = delay;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<SupervisorConfig, ConfigError> {
        if self.config.shards_per_worker == 0 {
            return Err(ConfigError::InvalidSharding(
                "shards_per_worker must be > 0".to_string(),
            ));
        }
        if self.config.total_shards == ShardCount::Fixed(0) {
            return Err(ConfigError::InvalidSharding(
                "total shard count must be > 0".to_string(),
            ));
        }
        Ok(self.config)
    }
}

/// Program launched for each worker in process mode
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}
