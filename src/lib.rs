//! # Sliding Window Throttler
//!
//! A distributed, Redis-backed sliding-window rate limiter with an explicit
//! block/cool-off phase: once a caller exceeds its limit, it is rejected
//! outright for a configured duration instead of being re-evaluated against
//! the window on every subsequent call.
//!
//! The admission decision is made atomically on the server, either through
//! an installed Redis Function (`FCALL`) or, when Functions are disabled or
//! unavailable, through an inline `EVAL` of the exact same algorithm — see
//! [`script`] for why the two never drift apart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sliding_window_throttler::{SlidingWindowThrottler, ThrottlerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ThrottlerConfig::builder()
//!     .host("localhost")
//!     .port(6379)
//!     .build()?;
//!
//! let throttler = SlidingWindowThrottler::connect(config).await?;
//!
//! let decision = throttler
//!     .increment("user_123", 60_000, 100, 30_000, "api")
//!     .await?;
//!
//! if decision.is_blocked {
//!     println!("blocked for {} more seconds", decision.time_to_block_expire);
//! } else {
//!     println!("{} of the window used", decision.total_hits);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Installing the admission procedure ahead of time
//!
//! `increment` installs the Redis Function library lazily on first use when
//! it isn't already present, but a long-running service should install it at
//! startup so the very first request doesn't pay that cost:
//!
//! ```rust,no_run
//! # use sliding_window_throttler::{SlidingWindowThrottler, ThrottlerConfig};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! # let config = ThrottlerConfig::builder().host("localhost").port(6379).build()?;
//! let throttler = SlidingWindowThrottler::connect(config).await?;
//! throttler.install().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod loader;
pub mod member;
pub mod script;
pub mod storage;

pub use client::{RedisStoreClient, ScriptReply, StoreClient};
pub use config::{FailureStrategy, RedisConfig, ThrottlerConfig, ThrottlerConfigBuilder, ThrottlerSettings};
pub use error::{ErrorCode, ThrottlerError, ThrottlerResult};
pub use keys::{KeyLayout, ThrottleKeys};
pub use loader::Loader;
pub use storage::{DecisionRecord, ThrottlerStorage};

use std::sync::Arc;
use tracing::debug;

/// Convenience facade pairing a [`ThrottlerStorage`] with a live Redis
/// connection, for callers who don't need to swap the store client for a
/// fake (see `storage::tests::FakeStoreClient` for that case).
pub struct SlidingWindowThrottler {
    storage: ThrottlerStorage<RedisStoreClient>,
}

impl SlidingWindowThrottler {
    /// Connect to Redis and build the adapter. Does not install the
    /// admission procedure; call [`Self::install`] to do that eagerly, or
    /// let the first [`Self::increment`] discover it's missing.
    pub async fn connect(config: ThrottlerConfig) -> ThrottlerResult<Self> {
        config.validate()?;
        for warning in config.advisory_warnings() {
            tracing::warn!(warning = %warning, "sliding-window throttler configuration advisory");
        }
        let url = config.redis.to_url();
        let client = Arc::new(RedisStoreClient::connect(&url, config.redis.key_prefix.clone()).await?);
        debug!("sliding-window throttler connected");
        Ok(Self {
            storage: ThrottlerStorage::new(client, &config),
        })
    }

    /// Install (or reinstall) the admission procedure's Redis Function
    /// library. Idempotent; safe to call at startup and again after a
    /// `FUNCTION FLUSH` on the server.
    pub async fn install(&self) -> ThrottlerResult<()> {
        self.storage.loader().install().await
    }

    /// See [`ThrottlerStorage::increment`].
    pub async fn increment(
        &self,
        identity: &str,
        ttl_ms: u64,
        limit: u64,
        block_duration_ms: u64,
        policy_name: &str,
    ) -> ThrottlerResult<DecisionRecord> {
        self.storage
            .increment(identity, ttl_ms, limit, block_duration_ms, policy_name)
            .await
    }

    /// See [`ThrottlerStorage::reset`].
    pub async fn reset(&self, identity: &str) -> ThrottlerResult<()> {
        self.storage.reset(identity).await
    }
}
