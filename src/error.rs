//! Error taxonomy for the sliding-window throttler
//!
//! Three kinds, matching the external contract: a caller-side contract
//! violation (`Configuration`), an unreachable store (`RedisConnection`), and
//! everything else that can go wrong talking to the store (`Operation`). Each
//! carries a closed-enum `code` so callers can match on stable strings
//! instead of matching error variants/messages.

use std::fmt;
use thiserror::Error;

/// Result type for every fallible operation in this crate.
pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed enumeration of error codes. Stable across versions; match on this,
/// not on the `ThrottlerError` variant name or message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidConfiguration,
    MissingRequiredConfig,
    RedisConnectionFailed,
    RedisOperationFailed,
    RedisFunctionsLoadFailed,
    StorageOperationFailed,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorCode::MissingRequiredConfig => "MISSING_REQUIRED_CONFIG",
            ErrorCode::RedisConnectionFailed => "REDIS_CONNECTION_FAILED",
            ErrorCode::RedisOperationFailed => "REDIS_OPERATION_FAILED",
            ErrorCode::RedisFunctionsLoadFailed => "REDIS_FUNCTIONS_LOAD_FAILED",
            ErrorCode::StorageOperationFailed => "STORAGE_OPERATION_FAILED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sum type of the three error kinds the core can raise.
#[derive(Debug, Error)]
pub enum ThrottlerError {
    /// Caller-side contract violation: missing/out-of-range config, or an
    /// invalid argument to `increment`/`reset`. Never retried by the core.
    #[error("[{code}] {message}")]
    Configuration {
        code: ErrorCode,
        message: String,
        /// Name of the offending field, when known.
        field: Option<String>,
        #[source]
        source: Option<BoxedSource>,
    },

    /// The store is unreachable, timed out, refused, or the network failed.
    #[error("[{code}] {message}")]
    RedisConnection {
        code: ErrorCode,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Protocol, server-side script, or other store-level failure.
    #[error("[{code}] {message}")]
    Operation {
        code: ErrorCode,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl ThrottlerError {
    pub fn configuration(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
            field: None,
            source: None,
        }
    }

    pub fn configuration_field(
        code: ErrorCode,
        message: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
            field: Some(field.into()),
            source: None,
        }
    }

    pub fn redis_connection(message: impl Into<String>) -> Self {
        Self::RedisConnection {
            code: ErrorCode::RedisConnectionFailed,
            message: message.into(),
            source: None,
        }
    }

    pub fn redis_connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::RedisConnection {
            code: ErrorCode::RedisConnectionFailed,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn operation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Operation {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn operation_with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Operation {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Code of this error, regardless of variant.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { code, .. } => *code,
            Self::RedisConnection { code, .. } => *code,
            Self::Operation { code, .. } => *code,
        }
    }

    /// Offending field name, when this is a `Configuration` error.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Configuration { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    pub fn is_throttler(&self) -> bool {
        true
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_redis_connection(&self) -> bool {
        matches!(self, Self::RedisConnection { .. })
    }

    pub fn is_operation(&self) -> bool {
        matches!(self, Self::Operation { .. })
    }

    /// True when `increment`'s failure strategy should handle this instead of
    /// propagating it: our own `RedisConnection` classification, or an
    /// `Operation` whose message matches a connection-failure pattern
    /// (belt-and-braces for errors that slip through as `Operation` because
    /// the underlying client didn't classify them as an io/connection
    /// error).
    pub fn is_connection_like(&self) -> bool {
        if self.is_redis_connection() {
            return true;
        }
        let message = match self {
            Self::Operation { message, .. } => message.to_lowercase(),
            _ => return false,
        };
        ["connection", "econnrefused", "timeout", "network", "redis"]
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;

        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            return ThrottlerError::RedisConnection {
                code: ErrorCode::RedisConnectionFailed,
                message: err.to_string(),
                source: Some(Box::new(err)),
            };
        }

        let message = err.to_string();
        if message.contains("NOSCRIPT")
            || message.contains("unknown function")
            || message.contains("Function not found")
            || message.contains("unknown command")
        {
            return ThrottlerError::Operation {
                code: ErrorCode::RedisFunctionsLoadFailed,
                message,
                source: Some(Box::new(err)),
            };
        }

        let code = match err.kind() {
            ErrorKind::ResponseError | ErrorKind::TypeError | ErrorKind::ExecAbortError => {
                ErrorCode::RedisOperationFailed
            }
            _ => ErrorCode::StorageOperationFailed,
        };

        ThrottlerError::Operation {
            code,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
