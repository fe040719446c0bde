//! Error handling for the Quai mining client
//!
//! Error types covering work discovery, proxy framing, solution classification
//! and submission, with retry classification for the feed's backoff loops.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Result type alias for mining client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining client
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport errors talking to a node
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Dial or subscribe failures
    #[error("Connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    /// JSON-RPC error object returned by a node
    #[error("RPC error from {endpoint}: {message}")]
    Rpc { endpoint: String, message: String },

    /// Error reported by the mining proxy
    #[error("Proxy error: {message}")]
    Proxy { message: String },

    /// Malformed or oversized data on the proxy socket
    #[error("Framing error: {message}")]
    Framing { message: String },

    /// Solved header satisfies no tier difficulty
    #[error("Invalid order: {message}")]
    InvalidOrder { message: String },

    /// Hashing engine rejected a header
    #[error("Sealing failed: {message}")]
    Seal { message: String },

    /// Header decoding errors
    #[error("Invalid header: {message}")]
    Header { message: String },

    /// Channel closed by its peer
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    /// Cancellation of an async operation
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a proxy error
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Create a framing error
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Create an invalid order error
    pub fn invalid_order(message: impl Into<String>) -> Self {
        Self::InvalidOrder {
            message: message.into(),
        }
    }

    /// Create a sealing error
    pub fn seal(message: impl Into<String>) -> Self {
        Self::Seal {
            message: message.into(),
        }
    }

    /// Create a header error
    pub fn header(message: impl Into<String>) -> Self {
        Self::Header {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Check if error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => match e.status() {
                Some(status) => {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                }
                None => e.is_timeout() || e.is_connect() || e.is_request(),
            },
            Error::Io(_) => true,
            Error::Connection { .. } => true,
            Error::Rpc { .. } => true,
            Error::Proxy { .. } => true,
            Error::Framing { .. } => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Connection { .. } => "connection",
            Error::Rpc { .. } => "rpc",
            Error::Proxy { .. } => "proxy",
            Error::Framing { .. } => "framing",
            Error::InvalidOrder { .. } => "invalid_order",
            Error::Seal { .. } => "seal",
            Error::Header { .. } => "header",
            Error::ChannelClosed { .. } => "channel_closed",
            Error::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<LinesCodecError> for Error {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                Error::framing("line exceeds maximum request size")
            }
            LinesCodecError::Io(e) => Error::Io(e),
        }
    }
}
