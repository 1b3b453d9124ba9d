//! Configuration: a flat, typed record with bounded-range validation.
//!
//! Every recognized field is an explicit struct member — unknown fields are
//! a compile error here, not a silently ignored key in an open map.

use crate::error::{ErrorCode, ThrottlerError, ThrottlerResult};
use crate::keys::KeyLayout;
use std::env;

const DEFAULT_KEY_PREFIX: &str = "throttle";
const DEFAULT_MAX_WINDOW_SIZE: u32 = 1000;
const MAX_WINDOW_SIZE_SOFT_CEILING: u32 = 5000;

/// What `increment` returns when the store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStrategy {
    /// Admit by default.
    FailOpen,
    /// Deny by default.
    FailClosed,
}

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: Option<String>,
    pub key_prefix: Option<String>,
}

impl RedisConfig {
    /// Render as a `redis://` URL suitable for `redis::Client::open`.
    pub fn to_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{host}:{port}/{db}",
                password = password,
                host = self.host,
                port = self.port,
                db = self.db
            ),
            None => format!("redis://{host}:{port}/{db}", host = self.host, port = self.port, db = self.db),
        }
    }
}

/// Throttler behavior settings.
#[derive(Debug, Clone)]
pub struct ThrottlerSettings {
    pub failure_strategy: FailureStrategy,
    pub key_prefix: String,
    pub enable_debug_logging: bool,
    pub max_window_size: u32,
    pub enable_redis_functions: bool,
    pub key_layout: KeyLayout,
}

impl Default for ThrottlerSettings {
    fn default() -> Self {
        Self {
            failure_strategy: FailureStrategy::FailOpen,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            enable_debug_logging: false,
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
            enable_redis_functions: true,
            key_layout: KeyLayout::Clustered,
        }
    }
}

/// Complete, validated configuration.
#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    pub redis: RedisConfig,
    pub throttler: ThrottlerSettings,
}

impl ThrottlerConfig {
    pub fn builder() -> ThrottlerConfigBuilder {
        ThrottlerConfigBuilder::new()
    }

    /// Bounded-range validation over every recognized field. `host`/`port`
    /// missing is caught by the builder before this point is ever reached
    /// via `from_env`; this also re-validates a config
    /// assembled by hand.
    pub fn validate(&self) -> ThrottlerResult<()> {
        if self.redis.host.trim().is_empty() {
            return Err(ThrottlerError::configuration_field(
                ErrorCode::MissingRequiredConfig,
                "redis.host must not be empty",
                "redis.host",
            ));
        }
        if self.redis.port == 0 {
            return Err(ThrottlerError::configuration_field(
                ErrorCode::InvalidConfiguration,
                "redis.port must be in 1..=65535",
                "redis.port",
            ));
        }
        if self.redis.db > 15 {
            return Err(ThrottlerError::configuration_field(
                ErrorCode::InvalidConfiguration,
                "redis.db must be in 0..=15",
                "redis.db",
            ));
        }
        if self.throttler.key_prefix.trim().is_empty() {
            return Err(ThrottlerError::configuration_field(
                ErrorCode::InvalidConfiguration,
                "throttler.keyPrefix must not be empty",
                "throttler.keyPrefix",
            ));
        }
        if !(100..=10_000).contains(&self.throttler.max_window_size) {
            return Err(ThrottlerError::configuration_field(
                ErrorCode::InvalidConfiguration,
                "throttler.maxWindowSize must be in 100..=10000",
                "throttler.maxWindowSize",
            ));
        }
        Ok(())
    }

    /// Non-fatal warnings about risky-but-legal configurations. Never
    /// returned as an error.
    pub fn advisory_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.throttler.failure_strategy == FailureStrategy::FailOpen {
            warnings.push(
                "throttler.failureStrategy is fail-open: the store being unreachable admits \
                 every request by default"
                    .to_string(),
            );
        }

        if self.throttler.enable_debug_logging && is_production_environment() {
            warnings.push(
                "throttler.enableDebugLogging is on while the environment looks like \
                 production"
                    .to_string(),
            );
        }

        if !is_local_host(&self.redis.host) && self.redis.password.is_none() {
            warnings.push(
                "redis.host is non-local and redis.password is unset".to_string(),
            );
        }

        if self.throttler.max_window_size > MAX_WINDOW_SIZE_SOFT_CEILING {
            warnings.push(format!(
                "throttler.maxWindowSize ({}) is above the soft threshold of {}",
                self.throttler.max_window_size, MAX_WINDOW_SIZE_SOFT_CEILING
            ));
        }

        warnings
    }

    /// Build a validated config from environment variables. Fails with
    /// `MissingRequiredConfig` when host/port are absent, `InvalidConfiguration`
    /// on any other validation breach.
    pub fn from_env() -> ThrottlerResult<Self> {
        let host = env::var("THROTTLE_REDIS_HOST").map_err(|_| {
            ThrottlerError::configuration_field(
                ErrorCode::MissingRequiredConfig,
                "THROTTLE_REDIS_HOST is required",
                "redis.host",
            )
        })?;
        let port_str = env::var("THROTTLE_REDIS_PORT").map_err(|_| {
            ThrottlerError::configuration_field(
                ErrorCode::MissingRequiredConfig,
                "THROTTLE_REDIS_PORT is required",
                "redis.port",
            )
        })?;
        let port: u16 = port_str.parse().map_err(|_| {
            ThrottlerError::configuration_field(
                ErrorCode::InvalidConfiguration,
                format!("THROTTLE_REDIS_PORT is not a valid port: {port_str}"),
                "redis.port",
            )
        })?;

        let db = env::var("THROTTLE_REDIS_DB")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(0);
        let password = env::var("THROTTLE_REDIS_PASSWORD").ok();
        let redis_key_prefix = env::var("THROTTLE_REDIS_KEY_PREFIX").ok();

        let key_prefix =
            env::var("THROTTLE_KEY_PREFIX").unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string());
        let failure_strategy = match env::var("THROTTLE_FAILURE_STRATEGY").ok().as_deref() {
            Some("fail-closed") => FailureStrategy::FailClosed,
            _ => FailureStrategy::FailOpen,
        };
        let enable_debug_logging = parse_bool_env("THROTTLE_DEBUG_LOGGING", false);
        let max_window_size = env::var("THROTTLE_MAX_WINDOW_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_WINDOW_SIZE);
        let enable_redis_functions = parse_bool_env("THROTTLE_ENABLE_REDIS_FUNCTIONS", true);

        let config = ThrottlerConfig {
            redis: RedisConfig {
                host,
                port,
                db,
                password,
                key_prefix: redis_key_prefix,
            },
            throttler: ThrottlerSettings {
                failure_strategy,
                key_prefix,
                enable_debug_logging,
                max_window_size,
                enable_redis_functions,
                key_layout: KeyLayout::Clustered,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

/// Parse `true/false/1/0/yes/no`, case-insensitive. Anything else (including
/// an unset variable) falls back to `default`.
fn parse_bool_env(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn is_production_environment() -> bool {
    matches!(
        env::var("NODE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .or_else(|_| env::var("ENVIRONMENT"))
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "production" | "prod"
    )
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Fluent builder for [`ThrottlerConfig`], mirroring the rest of the crate's
/// builder style.
pub struct ThrottlerConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    db: u8,
    password: Option<String>,
    redis_key_prefix: Option<String>,
    key_prefix: String,
    failure_strategy: FailureStrategy,
    enable_debug_logging: bool,
    max_window_size: u32,
    enable_redis_functions: bool,
    key_layout: KeyLayout,
}

impl ThrottlerConfigBuilder {
    pub fn new() -> Self {
        let defaults = ThrottlerSettings::default();
        Self {
            host: None,
            port: None,
            db: 0,
            password: None,
            redis_key_prefix: None,
            key_prefix: defaults.key_prefix,
            failure_strategy: defaults.failure_strategy,
            enable_debug_logging: defaults.enable_debug_logging,
            max_window_size: defaults.max_window_size,
            enable_redis_functions: defaults.enable_redis_functions,
            key_layout: defaults.key_layout,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn db(mut self, db: u8) -> Self {
        self.db = db;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn redis_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.redis_key_prefix = Some(prefix.into());
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn enable_debug_logging(mut self, enabled: bool) -> Self {
        self.enable_debug_logging = enabled;
        self
    }

    pub fn max_window_size(mut self, size: u32) -> Self {
        self.max_window_size = size;
        self
    }

    pub fn enable_redis_functions(mut self, enabled: bool) -> Self {
        self.enable_redis_functions = enabled;
        self
    }

    pub fn key_layout(mut self, layout: KeyLayout) -> Self {
        self.key_layout = layout;
        self
    }

    pub fn build(self) -> ThrottlerResult<ThrottlerConfig> {
        let host = self.host.ok_or_else(|| {
            ThrottlerError::configuration_field(
                ErrorCode::MissingRequiredConfig,
                "redis.host is required",
                "redis.host",
            )
        })?;
        let port = self.port.ok_or_else(|| {
            ThrottlerError::configuration_field(
                ErrorCode::MissingRequiredConfig,
                "redis.port is required",
                "redis.port",
            )
        })?;

        let config = ThrottlerConfig {
            redis: RedisConfig {
                host,
                port,
                db: self.db,
                password: self.password,
                key_prefix: self.redis_key_prefix,
            },
            throttler: ThrottlerSettings {
                failure_strategy: self.failure_strategy,
                key_prefix: self.key_prefix,
                enable_debug_logging: self.enable_debug_logging,
                max_window_size: self.max_window_size,
                enable_redis_functions: self.enable_redis_functions,
                key_layout: self.key_layout,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

impl Default for ThrottlerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
