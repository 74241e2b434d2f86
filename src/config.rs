use std::time::Duration;

/// Default REST base endpoint
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Default gateway API version
pub const DEFAULT_API_VERSION: u8 = 10;

/// Configuration for shards and the coordinator
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bot token sent in identify/resume payloads
    pub token: String,
    /// Explicit gateway endpoint (skips the metadata endpoint for the URL)
    pub gateway_url: Option<String>,
    /// Gateway API version appended to the endpoint
    pub api_version: u8,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for failed connection attempts
    pub backoff: BackoffConfig,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Shard count and identify pacing
    pub sharding: ShardingConfig,
    /// Identify payload contents
    pub identify: IdentifyConfig,
    /// Outbound gateway command budget for application sends
    pub command_limit: CommandLimitConfig,
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: GatewayConfig {
                token: token.into(),
                gateway_url: None,
                api_version: DEFAULT_API_VERSION,
                connection: ConnectionConfig::default(),
                backoff: BackoffConfig::default(),
                heartbeat: HeartbeatConfig::default(),
                sharding: ShardingConfig::default(),
                identify: IdentifyConfig::default(),
                command_limit: CommandLimitConfig::default(),
            },
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Use a fixed gateway endpoint instead of the one returned by the API
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    /// Set the gateway API version
    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
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

    /// Set sharding configuration
    pub fn sharding(mut self, config: ShardingConfig) -> Self {
        self.config.sharding = config;
        self
    }

    /// Set identify configuration
    pub fn identify(mut self, config: IdentifyConfig) -> Self {
        self.config.identify = config;
        self
    }

    /// Set the gateway intents bitfield
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.identify.intents = intents;
        self
    }

    /// Force a shard count instead of the recommended one
    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.sharding.shard_count = Some(count);
        self
    }

    /// Set the outbound command budget
    pub fn command_limit(mut self, config: CommandLimitConfig) -> Self {
        self.config.command_limit = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        validate_backoff(&self.config.backoff)?;

        if self.config.heartbeat.max_missed == 0 {
            return Err(ConfigError::InvalidHeartbeat(
                "max_missed must be > 0".to_string(),
            ));
        }

        if !(50..=250).contains(&self.config.identify.large_threshold) {
            return Err(ConfigError::InvalidIdentify(format!(
                "large_threshold must be within 50..=250, got {}",
                self.config.identify.large_threshold
            )));
        }

        if let Some(0) = self.config.sharding.shard_count {
            return Err(ConfigError::InvalidSharding(
                "shard_count cannot be 0".to_string(),
            ));
        }

        if let Some(0) = self.config.sharding.max_concurrency {
            return Err(ConfigError::InvalidSharding(
                "max_concurrency cannot be 0".to_string(),
            ));
        }

        if self.config.connection.event_buffer == 0 {
            return Err(ConfigError::InvalidConnection(
                "event_buffer cannot be 0".to_string(),
            ));
        }

        if self.config.command_limit.limit == 0 {
            return Err(ConfigError::InvalidConnection(
                "command limit cannot be 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

fn validate_backoff(backoff: &BackoffConfig) -> Result<(), ConfigError> {
    if backoff.max_delay < backoff.initial_delay {
        return Err(ConfigError::InvalidBackoff(
            "max_delay must be >= initial_delay".to_string(),
        ));
    }

    if backoff.multiplier <= 0.0 {
        return Err(ConfigError::InvalidBackoff(
            "multiplier must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token supplied
    #[error("Token must not be empty")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid identify configuration
    #[error("Invalid identify configuration: {0}")]
    InvalidIdentify(String),
    /// Invalid sharding configuration
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid REST configuration
    #[error("Invalid REST configuration: {0}")]
    InvalidRest(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Maximum consecutive failed connection attempts before the shard gives up.
    /// `None` keeps retrying forever (with backoff).
    pub max_reconnect_attempts: Option<u32>,
    /// Pause before re-identifying after a non-resumable invalid session
    pub invalid_session_delay: Duration,
    /// Capacity of the merged event channel
    pub event_buffer: usize,
    /// How long the coordinator waits for a shard in a batch to become ready
    pub ready_timeout: Duration,
    /// Upper bound for one reassembled inbound message
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: None,
            invalid_session_delay: Duration::from_secs(1),
            event_buffer: 1024,
            ready_timeout: Duration::from_secs(15),
            max_message_size: 16 * 1024 * 1024,
        }
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
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true, // Full jitter
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
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Consecutive unacknowledged heartbeats before the connection is declared dead
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { max_missed: 3 }
    }
}

/// Shard count and identify pacing
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Override the recommended shard count
    pub shard_count: Option<u32>,
    /// Override the permitted identify burst
    pub max_concurrency: Option<u32>,
    /// Pause between identify batches
    pub batch_delay: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: None,
            max_concurrency: None,
            batch_delay: Duration::from_secs(5),
        }
    }
}

/// Client metadata sent with identify
#[derive(Debug, Clone)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify payload contents
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    /// Capability flags (gateway intents)
    pub intents: u64,
    /// Member count above which a guild is considered large (50..=250)
    pub large_threshold: u16,
    /// Client metadata
    pub properties: ClientProperties,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            intents: 0,
            large_threshold: 250,
            properties: ClientProperties::default(),
        }
    }
}

/// Outbound command budget per connection
#[derive(Debug, Clone)]
pub struct CommandLimitConfig {
    /// Commands allowed per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
}

impl Default for CommandLimitConfig {
    fn default() -> Self {
        Self {
            limit: 120,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for the rate-limited REST transport
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base endpoint every route is appended to
    pub base_url: String,
    /// Token for the `Authorization` header
    pub token: String,
    /// Scheme placed before the token (`Bot`, `Bearer`)
    pub auth_scheme: String,
    /// `User-Agent` header value
    pub user_agent: String,
    /// Global request ceiling per window
    pub global_limit: u32,
    /// Global window length
    pub global_window: Duration,
    /// Timeout for a single HTTP exchange
    pub request_timeout: Duration,
}

impl RestConfig {
    /// Create a REST configuration with defaults for everything except the token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            auth_scheme: "Bot".to_string(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            global_limit: 50,
            global_window: Duration::from_secs(1),
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Set the base endpoint
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the authorization scheme
    pub fn auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = scheme.into();
        self
    }

    /// Set the global ceiling
    pub fn global_limit(mut self, limit: u32, window: Duration) -> Self {
        self.global_limit = limit;
        self.global_window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.global_limit == 0 {
            return Err(ConfigError::InvalidRest(
                "global_limit cannot be 0".to_string(),
            ));
        }
        if url::Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::InvalidRest(format!(
                "invalid base_url: {}",
                self.base_url
            )));
        }
        Ok(())
    }
}
