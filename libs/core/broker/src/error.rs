//! Broker error types and handler failure categorization
//!
//! Handler failures are categorized to decide what happens to the message:
//! - **Transient**: redeliver until the reconsume budget is spent
//! - **Permanent**: acknowledge and abandon right away (bad payload, unroutable name)

use thiserror::Error;

/// Category of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure, worth another attempt.
    Transient,
    /// Unrecoverable, redelivery would fail the same way.
    Permanent,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

/// Outcome of a failed handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// No handler is registered under the message name. A routing bug, never retried.
    #[error("no handler registered for message '{0}'")]
    NotFound(String),

    /// The handler panicked. Recovered by the core and treated as transient.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler reported a failure.
    #[error("{message}")]
    Failed {
        message: String,
        category: ErrorCategory,
    },
}

impl HandlerError {
    /// A failure that should be retried.
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// A failure that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HandlerError::NotFound(_) => ErrorCategory::Permanent,
            HandlerError::Panicked(_) => ErrorCategory::Transient,
            HandlerError::Failed { category, .. } => *category,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().should_retry()
    }
}

// A payload that does not decode will not decode on the next attempt either.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::permanent(format!("payload decode failed: {err}"))
    }
}

/// Errors raised by a transport adapter.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection to the backend is down or could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend cannot provide the requested capability.
    #[error("unsupported capability: {0}")]
    Unsupported(&'static str),

    /// A message could not be encoded or decoded for the wire.
    #[error("codec error: {0}")]
    Codec(String),

    /// Ack/nack for a delivery the adapter does not know about.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    /// The adapter has been closed.
    #[error("transport closed")]
    Closed,

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl TransportError {
    /// Whether the error means the link is gone and a reconnect is needed.
    ///
    /// A response timeout is not a lost link: the server may just be slow.
    pub fn is_connection(&self) -> bool {
        match self {
            TransportError::Connection(_) => true,
            #[cfg(feature = "redis")]
            TransportError::Redis(e) => {
                !e.is_timeout()
                    && (e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal())
            }
            _ => false,
        }
    }

    /// Whether a command ran out of time waiting for its response.
    pub fn is_timeout(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            TransportError::Redis(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Misuse of the broker lifecycle. Never transient.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("broker is not running, call worker() first")]
    NotRunning,

    #[error("broker worker is already running")]
    AlreadyRunning,

    #[error("broker is closed")]
    Closed,

    #[error("middleware cannot be added after the worker has started")]
    MiddlewareFrozen,
}

/// Errors returned by the broker facade.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("handler already registered for message '{0}'")]
    DuplicateHandler(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The link is being re-established; publishing fails fast instead of buffering.
    #[error("transport disconnected, reconnect in progress")]
    Disconnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid delay: {0}")]
    InvalidDelay(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Transient errors may succeed if the caller retries later.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Disconnected => true,
            BrokerError::Transport(e) => e.is_connection() || e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, BrokerError::Lifecycle(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<core_config::ConfigError> for BrokerError {
    fn from(err: core_config::ConfigError) -> Self {
        BrokerError::Config(err.to_string())
    }
}
