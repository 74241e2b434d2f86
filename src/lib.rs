//! # ws-gateway
//!
//! A sharded realtime gateway client with heartbeat/resume handling and a
//! bucket-aware, rate-limited REST transport.
//!
//! ## Features
//!
//! - **Sharding** with identify batches paced by the server's concurrency limit
//! - **Session resume** after drops, falling back to a fresh identify when the
//!   session is invalidated
//! - **Heartbeats** with zombie-connection detection
//! - **Rate limiting** for REST calls (global and per-route buckets, 429 retry)
//!   and for outbound gateway commands
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ws_gateway::{GatewayConfig, RestClient, RestConfig, ShardCoordinator};
//!
//! let rest = Arc::new(RestClient::new(RestConfig::new(token.clone()))?);
//! let config = GatewayConfig::builder(token).intents(1 << 9).build()?;
//!
//! let coordinator = ShardCoordinator::new(config, rest);
//! let mut events = coordinator.events().unwrap();
//! coordinator.start().await?;
//!
//! while let Some(event) = events.next_event().await {
//!     println!("[{}] {:?}", event.shard_id, event.event_name);
//! }
//! ```

mod bucket;
mod config;
mod connection;
mod coordinator;
mod dispatcher;
mod error;
mod frame;
mod heartbeat;
mod metrics;
mod protocol;
mod ratelimit;
mod rest;
mod session;
mod shard;

pub use bucket::{BucketSnapshot, RateLimitBucket, GLOBAL_BUCKET, MAX_RATE_LIMIT_WAIT};
pub use config::{
    BackoffConfig, ClientProperties, CommandLimitConfig, ConfigError, ConnectionConfig, GatewayConfig,
    GatewayConfigBuilder, HeartbeatConfig, IdentifyConfig, RestConfig, ShardingConfig, DEFAULT_API_BASE,
    DEFAULT_API_VERSION,
};
pub use coordinator::ShardCoordinator;
pub use dispatcher::{Dispatcher, EventHandler};
pub use error::{Error, ErrorKind};
pub use frame::{FrameAssembler, FrameError};
pub use heartbeat::HeartbeatMonitor;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{CloseAction, EventEnvelope, GatewayFrame, Opcode};
pub use ratelimit::{RateLimitHeaders, RateLimitScope, RateLimiter, Route};
pub use rest::{GatewayBotInfo, GatewayInfo, RestClient, RestResponse, SessionStartLimit};
pub use session::{ConnectionState, Handshake, Session};
pub use shard::{plan_batches, Shard, ShardFailure};

// Re-export http types used by RestClient::send
pub use http::{Method, StatusCode};

/// Result type for ws-gateway operations
pub type Result<T> = std::result::Result<T, Error>;
