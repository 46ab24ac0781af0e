//! Error types for the NSQ client library

/// Main error type for NSQ client operations
#[derive(Debug, thiserror::Error)]
pub enum NsqError {
    /// Remote configuration service unreachable or returned malformed data
    #[error("config access error: {message}")]
    ConfigAccess { message: String },

    /// Lookup service unreachable or returned malformed data
    #[error("lookup error: {message}")]
    Lookup { message: String },

    /// No connection available for an endpoint within the acquire timeout
    #[error("connection pool exhausted for {endpoint} after {waited_ms}ms")]
    PoolExhausted { endpoint: String, waited_ms: u64 },

    /// No broker reply to a publish within the query timeout
    #[error("publish timed out after {timeout_ms}ms")]
    PublishTimeout { timeout_ms: u64 },

    /// Transport failure on a broker connection
    #[error("connection error: {message}")]
    Connection { message: String },

    /// A tag-bearing operation was attempted against a broker that did not
    /// negotiate extension support
    #[error("feature unsupported by broker: {message}")]
    FeatureUnsupported { message: String },

    /// Malformed tag or configuration
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Unexpected or malformed wire data
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a closed producer, consumer, or pool
    #[error("client is closed")]
    Closed,
}

impl NsqError {
    /// Create a new config access error
    pub fn config_access<S: Into<String>>(message: S) -> Self {
        Self::ConfigAccess {
            message: message.into(),
        }
    }

    /// Create a new lookup error
    pub fn lookup<S: Into<String>>(message: S) -> Self {
        Self::Lookup {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new feature-unsupported error
    pub fn feature_unsupported<S: Into<String>>(message: S) -> Self {
        Self::FeatureUnsupported {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Transport-level failures are transient and retried with backoff;
    /// validation, protocol, and feature-negotiation failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io(_) | Self::PoolExhausted { .. } | Self::Lookup { .. }
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PublishTimeout { .. })
    }
}
