use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be carried on failure channels and in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// HTTP transport error (DNS, TLS, timeout)
    Http,
    /// Payload could not be encoded or decoded
    Decode,
    /// Connection failed (timeout, refused, etc.)
    ConnectionFailed,
    /// Gateway rejected the token
    Authentication,
    /// Gateway closed with a non-recoverable code
    FatalClose,
    /// REST API answered with an error status
    Api,
    /// Invalid configuration
    Config,
    /// Coordinator or shard is shutting down
    ShuttingDown,
    /// Other error
    Other,
}

/// Errors that can occur in ws-gateway
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Connection failed after all retry attempts
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionFailed { attempts: u32, last_error: String },

    /// Gateway rejected the token
    #[error("Authentication failed (close code {code}): {reason}")]
    AuthenticationFailed { code: u16, reason: String },

    /// Gateway closed with a code that must not be retried
    #[error("Gateway closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// The REST API returned an error status (the server's own error)
    #[error("API error {status}{}: {message}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    Api {
        status: u16,
        code: Option<u64>,
        message: String,
    },

    /// A shard exited before it became ready
    #[error("Shard {shard_id} failed: {reason}")]
    ShardFailed { shard_id: u32, reason: String },

    /// The shard already has a running connection task
    #[error("Shard {0} is already connected")]
    AlreadyConnected(u32),

    /// The shard has no open connection to send on
    #[error("Shard {0} is not connected")]
    NotConnected(u32),

    /// The coordinator was already started
    #[error("Coordinator is already running")]
    AlreadyRunning,

    /// Coordinator is shutting down
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Http(_) => ErrorKind::Http,
            Error::Json(_) => ErrorKind::Decode,
            Error::Config(_) => ErrorKind::Config,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::AuthenticationFailed { .. } => ErrorKind::Authentication,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::Api { .. } => ErrorKind::Api,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::ShardFailed { .. }
            | Error::AlreadyConnected(_)
            | Error::NotConnected(_)
            | Error::AlreadyRunning
            | Error::ChannelSend(_) => ErrorKind::Other,
        }
    }

    /// Whether a shard must stop instead of reconnecting after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Authentication | ErrorKind::FatalClose | ErrorKind::Config
        )
    }
}
