//! Storage adapter: the public `increment`/`reset` contract.
//!
//! Routes each admission call to the installed stored procedure when
//! available, falling back to an inline script otherwise, retries once on
//! an unloaded procedure, and applies the configured failure strategy when
//! the store is unreachable.

use crate::client::{ScriptReply, StoreClient};
use crate::config::{FailureStrategy, ThrottlerConfig};
use crate::error::{ErrorCode, ThrottlerError, ThrottlerResult};
use crate::keys::{self, KeyLayout, ThrottleKeys};
use crate::loader::Loader;
use crate::member;
use crate::script;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// The 4-field answer to one admission call.
///
/// `time_to_expire` is in seconds on the normal (script-backed) path. On the
/// failure-strategy path the raw `ttlMs` value is returned unconverted — a
/// deliberate unit mismatch, preserved here rather than "fixed" out from
/// under callers who may already depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionRecord {
    pub total_hits: u64,
    pub time_to_expire: u64,
    pub is_blocked: bool,
    /// Seconds until the ban lifts, or `-1` if no ban is in effect.
    pub time_to_block_expire: i64,
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// Mask an identifier before it reaches a log line:
/// `first4 + '*' * (len - 8) + last4`.
fn mask_key(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    if len <= 8 {
        return "*".repeat(len);
    }
    let first: String = chars[..4].iter().collect();
    let last: String = chars[len - 4..].iter().collect();
    format!("{first}{}{last}", "*".repeat(len - 8))
}

fn validate_increment_args(
    identity: &str,
    policy_name: &str,
    ttl_ms: u64,
) -> ThrottlerResult<()> {
    if identity.trim().is_empty() {
        return Err(ThrottlerError::configuration_field(
            ErrorCode::InvalidConfiguration,
            "identity must not be empty",
            "identity",
        ));
    }
    if policy_name.trim().is_empty() {
        return Err(ThrottlerError::configuration_field(
            ErrorCode::InvalidConfiguration,
            "policyName must not be empty",
            "policyName",
        ));
    }
    if ttl_ms == 0 {
        return Err(ThrottlerError::configuration_field(
            ErrorCode::InvalidConfiguration,
            "ttlMs must be a positive integer",
            "ttlMs",
        ));
    }
    Ok(())
}

fn parse_reply(reply: ScriptReply) -> DecisionRecord {
    let (total_hits, time_to_expire, is_blocked, time_to_block_expire) = reply;
    DecisionRecord {
        total_hits: total_hits.max(0) as u64,
        time_to_expire: time_to_expire.max(0) as u64,
        is_blocked: is_blocked != 0,
        time_to_block_expire: if time_to_block_expire < 0 { -1 } else { time_to_block_expire },
    }
}

/// Public storage adapter. Generic over [`StoreClient`] so production code
/// uses [`crate::client::RedisStoreClient`] while tests use an in-process
/// fake.
pub struct ThrottlerStorage<C: StoreClient> {
    client: Arc<C>,
    loader: Loader<C>,
    key_prefix: String,
    key_layout: KeyLayout,
    failure_strategy: FailureStrategy,
    enable_debug_logging: bool,
    max_window_size: u32,
    enable_redis_functions: bool,
}

impl<C: StoreClient> ThrottlerStorage<C> {
    pub fn new(client: Arc<C>, config: &ThrottlerConfig) -> Self {
        let loader = Loader::new(client.clone(), config.throttler.max_window_size);
        Self {
            client,
            loader,
            key_prefix: config.throttler.key_prefix.clone(),
            key_layout: config.throttler.key_layout,
            failure_strategy: config.throttler.failure_strategy,
            enable_debug_logging: config.throttler.enable_debug_logging,
            max_window_size: config.throttler.max_window_size,
            enable_redis_functions: config.throttler.enable_redis_functions,
        }
    }

    /// The loader backing this adapter, for callers that want to install the
    /// library eagerly at startup (`loader().install().await`) instead of
    /// relying on the first `increment` call to discover it's missing.
    pub fn loader(&self) -> &Loader<C> {
        &self.loader
    }

    /// `limit = 0` is treated as "disabled": the call never touches the
    /// store and always reports an unblocked admission with zero hits,
    /// modeled here at the adapter rather than inside the script.
    pub async fn increment(
        &self,
        identity: &str,
        ttl_ms: u64,
        limit: u64,
        block_duration_ms: u64,
        policy_name: &str,
    ) -> ThrottlerResult<DecisionRecord> {
        validate_increment_args(identity, policy_name, ttl_ms)?;

        if limit == 0 {
            return Ok(DecisionRecord {
                total_hits: 0,
                time_to_expire: 0,
                is_blocked: false,
                time_to_block_expire: -1,
            });
        }

        let started = Instant::now();
        let keys = keys::derive_keys(identity, policy_name, &self.key_prefix, self.key_layout)?;
        let now_ms = current_millis();
        let member = member::generate(now_ms);

        let outcome = self
            .run_admission(&keys, ttl_ms, limit, block_duration_ms, now_ms, &member)
            .await;

        let record = match outcome {
            Ok(record) => record,
            Err(err) if err.is_connection_like() => {
                warn!(
                    identity = %mask_key(identity),
                    policy = policy_name,
                    strategy = ?self.failure_strategy,
                    error = %err,
                    "redis unreachable during increment, applying failure strategy"
                );
                self.synthesize_failure_record(ttl_ms, block_duration_ms)
            }
            Err(err) => return Err(err),
        };

        if record.is_blocked {
            warn!(
                identity = %mask_key(identity),
                policy = policy_name,
                time_to_block_expire = record.time_to_block_expire,
                "caller is blocked"
            );
        }
        if self.enable_debug_logging {
            debug!(
                identity = %mask_key(identity),
                policy = policy_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                total_hits = record.total_hits,
                "increment completed"
            );
        }

        Ok(record)
    }

    async fn run_admission(
        &self,
        keys: &ThrottleKeys,
        ttl_ms: u64,
        limit: u64,
        block_duration_ms: u64,
        now_ms: u64,
        member: &str,
    ) -> ThrottlerResult<DecisionRecord> {
        let key_list = vec![keys.counter_key.clone(), keys.block_key.clone()];
        let arg_list = vec![
            ttl_ms.to_string(),
            limit.to_string(),
            block_duration_ms.to_string(),
            now_ms.to_string(),
            member.to_string(),
        ];

        if self.enable_redis_functions {
            // Try the installed procedure even before we've ever seen it
            // confirmed present: this is what makes `increment` install the
            // library lazily on first use instead of requiring a caller to
            // call `install()`/`probe()` up front. Once a call round-trips
            // successfully, mark it loaded so later calls skip straight to
            // `fcall` without this optimistic first attempt being wasted.
            match self
                .client
                .fcall(script::FUNCTION_NAME, &key_list, &arg_list)
                .await
            {
                Ok(reply) => {
                    self.loader.mark_loaded();
                    return Ok(parse_reply(reply));
                }
                Err(ThrottlerError::Operation {
                    code: ErrorCode::RedisFunctionsLoadFailed,
                    ..
                }) => {
                    // Reload and retry once; any further failure (including
                    // the reload itself failing) falls through to the inline
                    // path rather than propagating, so a single eviction —
                    // or a library that was simply never installed — never
                    // surfaces to the caller as an error.
                    let _ = self.loader.reload().await;
                    if let Ok(reply) = self
                        .client
                        .fcall(script::FUNCTION_NAME, &key_list, &arg_list)
                        .await
                    {
                        return Ok(parse_reply(reply));
                    }
                }
                Err(other) => return Err(other),
            }
        }

        let script_body = script::render_inline_eval(self.max_window_size);
        let reply = self.client.eval(&script_body, &key_list, &arg_list).await?;
        Ok(parse_reply(reply))
    }

    fn synthesize_failure_record(&self, ttl_ms: u64, block_duration_ms: u64) -> DecisionRecord {
        match self.failure_strategy {
            FailureStrategy::FailOpen => DecisionRecord {
                total_hits: 1,
                time_to_expire: ttl_ms,
                is_blocked: false,
                time_to_block_expire: 0,
            },
            FailureStrategy::FailClosed => DecisionRecord {
                total_hits: 999_999,
                time_to_expire: ttl_ms,
                is_blocked: true,
                time_to_block_expire: if block_duration_ms > 0 {
                    block_duration_ms as i64
                } else {
                    ttl_ms as i64
                },
            },
        }
    }

    /// Connection errors are swallowed (reset is advisory, not
    /// safety-critical); configuration errors and any other store-level
    /// failure propagate.
    pub async fn reset(&self, identity: &str) -> ThrottlerResult<()> {
        if identity.trim().is_empty() {
            return Err(ThrottlerError::configuration_field(
                ErrorCode::InvalidConfiguration,
                "identity must not be empty",
                "identity",
            ));
        }

        let pattern = keys::scan_pattern(identity, &self.key_prefix, self.key_layout);
        match self.run_reset(&pattern).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_connection_like() => {
                debug!(identity = %mask_key(identity), error = %err, "reset skipped: redis unreachable");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_reset(&self, pattern: &str) -> ThrottlerResult<()> {
        let found = self.client.scan_keys(pattern).await?;
        if found.is_empty() {
            return Ok(());
        }
        self.client.delete(&found).await
    }
}

#[cfg(test)]
mod tests {
    //! An in-process stand-in for Redis that replicates the admission
    //! algorithm in `script::BODY_TEMPLATE` line-for-line, so the adapter's
    //! decision logic can be asserted without a live Redis. This is
    //! test-only scaffolding behind the same `StoreClient` trait, not a
    //! production backend — there's exactly one of those, Redis.
    use super::*;
    use crate::config::ThrottlerConfigBuilder;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct ZSet {
        members: Vec<(i64, String)>,
        expires_at_ms: Option<i64>,
    }

    #[derive(Default)]
    struct FakeState {
        zsets: HashMap<String, ZSet>,
        blocks: HashMap<String, i64>,
    }

    pub struct FakeStoreClient {
        state: Mutex<FakeState>,
        max_window_size: i64,
        library_loaded: AtomicBool,
        force_connection_error: AtomicBool,
        force_function_load_error: AtomicBool,
    }

    impl FakeStoreClient {
        pub fn new(max_window_size: u32) -> Self {
            Self {
                state: Mutex::new(FakeState::default()),
                max_window_size: max_window_size as i64,
                library_loaded: AtomicBool::new(false),
                force_connection_error: AtomicBool::new(false),
                force_function_load_error: AtomicBool::new(false),
            }
        }

        pub fn force_connection_error(&self, force: bool) {
            self.force_connection_error.store(force, Ordering::SeqCst);
        }

        /// Simulate `FUNCTION LOAD` failing for a non-connection reason
        /// (e.g. a malformed library), distinct from `force_connection_error`.
        pub fn force_function_load_error(&self, force: bool) {
            self.force_function_load_error.store(force, Ordering::SeqCst);
        }

        pub fn is_library_loaded(&self) -> bool {
            self.library_loaded.load(Ordering::SeqCst)
        }

        /// The same algorithm as `script::BODY_TEMPLATE`, line-for-line.
        fn execute(&self, keys: &[String], args: &[String]) -> ThrottlerResult<ScriptReply> {
            if self.force_connection_error.load(Ordering::SeqCst) {
                return Err(ThrottlerError::redis_connection("connection refused (fake)"));
            }

            let z_key = &keys[0];
            let block_key = &keys[1];
            let ttl_ms: i64 = args[0].parse().unwrap();
            let limit: i64 = args[1].parse().unwrap();
            let block_duration_ms: i64 = args[2].parse().unwrap();
            let now_ms: i64 = args[3].parse().unwrap();
            let member = &args[4];

            if ttl_ms <= 0 {
                return Err(ThrottlerError::operation(ErrorCode::RedisOperationFailed, "ttlMs must be > 0"));
            }
            if limit <= 0 {
                return Err(ThrottlerError::operation(ErrorCode::RedisOperationFailed, "limit must be > 0"));
            }
            if block_duration_ms < 0 {
                return Err(ThrottlerError::operation(
                    ErrorCode::RedisOperationFailed,
                    "blockDurationMs must be >= 0",
                ));
            }
            if now_ms <= 0 {
                return Err(ThrottlerError::operation(ErrorCode::RedisOperationFailed, "nowMs must be > 0"));
            }
            if member.is_empty() {
                return Err(ThrottlerError::operation(ErrorCode::RedisOperationFailed, "member must be non-empty"));
            }

            let ceil_to_sec = |ms: i64| -> i64 {
                let ms = ms.max(0);
                (ms + 999) / 1000
            };

            let mut state = self.state.lock().unwrap();

            let block_exists = state.blocks.get(block_key).map(|exp| *exp > now_ms).unwrap_or(false);

            if block_exists {
                let mut block_ttl_ms = state.blocks[block_key] - now_ms;
                if block_ttl_ms == -1 && block_duration_ms > 1 {
                    state.blocks.insert(block_key.clone(), now_ms + block_duration_ms);
                    block_ttl_ms = block_duration_ms;
                }
                let z_ttl_ms = state
                    .zsets
                    .get(z_key)
                    .and_then(|z| z.expires_at_ms)
                    .map(|exp| exp - now_ms)
                    .unwrap_or(-1)
                    .max(0);
                let expire_basis = z_ttl_ms.max(ttl_ms);
                let block_basis = block_ttl_ms.max(0);
                return Ok((-1, ceil_to_sec(expire_basis), 1, ceil_to_sec(block_basis)));
            }

            let cutoff = now_ms - ttl_ms;
            let entry = state.zsets.entry(z_key.clone()).or_default();
            entry.members.retain(|(score, _)| *score > cutoff);
            let count = entry.members.len() as i64;

            if count + 1 > limit {
                if block_duration_ms > 1 {
                    state.blocks.insert(block_key.clone(), now_ms + block_duration_ms);
                    return Ok((count + 1, ceil_to_sec(ttl_ms), 1, ceil_to_sec(block_duration_ms)));
                }
                return Ok((count + 1, ceil_to_sec(ttl_ms), 1, -1));
            }

            let entry = state.zsets.entry(z_key.clone()).or_default();
            entry.members.push((now_ms, member.clone()));
            entry.expires_at_ms = Some(now_ms + ttl_ms);

            if entry.members.len() as i64 > self.max_window_size {
                entry.members.sort_by_key(|(score, _)| *score);
                let excess = entry.members.len() - self.max_window_size as usize;
                entry.members.drain(0..excess);
            }

            let card = entry.members.len() as i64;
            let z_ttl_ms = entry.expires_at_ms.map(|exp| exp - now_ms).unwrap_or(-1).max(0);
            let expire_basis = z_ttl_ms.max(ttl_ms);
            Ok((card, ceil_to_sec(expire_basis), 0, -1))
        }
    }

    fn glob_match(pattern: &str, text: &str) -> bool {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == text;
        }
        let mut idx = 0usize;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if i == 0 {
                if !text[idx..].starts_with(part) {
                    return false;
                }
                idx += part.len();
            } else if i == parts.len() - 1 {
                return text[idx..].ends_with(part);
            } else {
                match text[idx..].find(part) {
                    Some(pos) => idx += pos + part.len(),
                    None => return false,
                }
            }
        }
        true
    }

    #[async_trait]
    impl StoreClient for FakeStoreClient {
        async fn fcall(&self, _function_name: &str, keys: &[String], args: &[String]) -> ThrottlerResult<ScriptReply> {
            if self.force_connection_error.load(Ordering::SeqCst) {
                return Err(ThrottlerError::redis_connection("connection refused (fake)"));
            }
            if !self.is_library_loaded() {
                return Err(ThrottlerError::operation(ErrorCode::RedisFunctionsLoadFailed, "Function not found"));
            }
            self.execute(keys, args)
        }

        async fn eval(&self, _script: &str, keys: &[String], args: &[String]) -> ThrottlerResult<ScriptReply> {
            self.execute(keys, args)
        }

        async fn function_load(&self, _library_source: &str) -> ThrottlerResult<()> {
            if self.force_connection_error.load(Ordering::SeqCst) {
                return Err(ThrottlerError::redis_connection("connection refused (fake)"));
            }
            if self.force_function_load_error.load(Ordering::SeqCst) {
                return Err(ThrottlerError::operation(
                    ErrorCode::RedisFunctionsLoadFailed,
                    "FUNCTION LOAD rejected (fake)",
                ));
            }
            self.library_loaded.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn scan_keys(&self, pattern: &str) -> ThrottlerResult<Vec<String>> {
            if self.force_connection_error.load(Ordering::SeqCst) {
                return Err(ThrottlerError::redis_connection("connection refused (fake)"));
            }
            let state = self.state.lock().unwrap();
            let mut found: Vec<String> = state
                .zsets
                .keys()
                .chain(state.blocks.keys())
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            found.sort();
            found.dedup();
            Ok(found)
        }

        async fn delete(&self, keys: &[String]) -> ThrottlerResult<()> {
            let mut state = self.state.lock().unwrap();
            for key in keys {
                state.zsets.remove(key);
                state.blocks.remove(key);
            }
            Ok(())
        }
    }

    fn config_with(max_window_size: u32) -> ThrottlerConfig {
        ThrottlerConfigBuilder::new()
            .host("localhost")
            .port(6379)
            .max_window_size(max_window_size)
            .enable_redis_functions(false)
            .build()
            .unwrap()
    }

    #[test]
    fn mask_key_hides_middle_for_long_keys() {
        // "alice@example.com" is 17 chars: first4 "alic" + 9 stars + last4 ".com".
        assert_eq!(mask_key("alice@example.com"), "alic*********.com");
    }

    #[test]
    fn mask_key_masks_entirely_for_short_keys() {
        assert_eq!(mask_key("bob"), "***");
    }

    #[tokio::test]
    async fn first_call_admits_and_reports_one_hit() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        let record = storage.increment("alice", 60_000, 5, 0, "api").await.unwrap();
        assert_eq!(record.total_hits, 1);
        assert!(!record.is_blocked);
        assert_eq!(record.time_to_block_expire, -1);
    }

    #[tokio::test]
    async fn exceeding_limit_blocks_and_sets_block_ttl() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        for _ in 0..3 {
            storage.increment("alice", 60_000, 3, 30_000, "api").await.unwrap();
        }
        let record = storage.increment("alice", 60_000, 3, 30_000, "api").await.unwrap();
        assert!(record.is_blocked);
        assert_eq!(record.total_hits, 4);
        assert!(record.time_to_block_expire > 0);
    }

    #[tokio::test]
    async fn while_blocked_total_hits_is_clamped_to_zero_not_negative_one() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        for _ in 0..2 {
            storage.increment("alice", 60_000, 1, 30_000, "api").await.unwrap();
        }
        let record = storage.increment("alice", 60_000, 1, 30_000, "api").await.unwrap();
        assert!(record.is_blocked);
        assert_eq!(record.total_hits, 0, "the script's -1 sentinel is clamped to 0 at the adapter boundary");
    }

    #[tokio::test]
    async fn block_duration_of_zero_never_sets_a_ban() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        let a = storage.increment("alice", 60_000, 1, 0, "api").await.unwrap();
        assert!(!a.is_blocked);
        let b = storage.increment("alice", 60_000, 1, 0, "api").await.unwrap();
        assert!(b.is_blocked);
        assert_eq!(b.time_to_block_expire, -1);
    }

    #[tokio::test]
    async fn limit_zero_short_circuits_without_touching_the_store() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client.clone(), &config_with(1000));
        let record = storage.increment("alice", 60_000, 0, 0, "api").await.unwrap();
        assert_eq!(record.total_hits, 0);
        assert!(!record.is_blocked);
        let scanned = client.scan_keys("*").await.unwrap();
        assert!(scanned.is_empty(), "disabled limit must never write to the store");
    }

    #[tokio::test]
    async fn different_identities_do_not_share_state() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        storage.increment("alice", 60_000, 1, 0, "api").await.unwrap();
        let bob = storage.increment("bob", 60_000, 1, 0, "api").await.unwrap();
        assert_eq!(bob.total_hits, 1);
        assert!(!bob.is_blocked);
    }

    #[tokio::test]
    async fn different_policies_for_the_same_identity_do_not_share_state() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        storage.increment("alice", 60_000, 1, 0, "login").await.unwrap();
        let api = storage.increment("alice", 60_000, 1, 0, "api").await.unwrap();
        assert_eq!(api.total_hits, 1);
    }

    #[tokio::test]
    async fn fail_open_admits_when_store_is_unreachable() {
        let client = Arc::new(FakeStoreClient::new(1000));
        client.force_connection_error(true);
        let config = ThrottlerConfigBuilder::new()
            .host("localhost")
            .port(6379)
            .failure_strategy(FailureStrategy::FailOpen)
            .enable_redis_functions(false)
            .build()
            .unwrap();
        let storage = ThrottlerStorage::new(client, &config);
        let record = storage.increment("alice", 60_000, 5, 0, "api").await.unwrap();
        assert!(!record.is_blocked);
        assert_eq!(record.total_hits, 1);
        assert_eq!(record.time_to_expire, 60_000);
    }

    #[tokio::test]
    async fn fail_closed_denies_when_store_is_unreachable() {
        let client = Arc::new(FakeStoreClient::new(1000));
        client.force_connection_error(true);
        let config = ThrottlerConfigBuilder::new()
            .host("localhost")
            .port(6379)
            .failure_strategy(FailureStrategy::FailClosed)
            .enable_redis_functions(false)
            .build()
            .unwrap();
        let storage = ThrottlerStorage::new(client, &config);
        let record = storage.increment("alice", 60_000, 5, 30_000, "api").await.unwrap();
        assert!(record.is_blocked);
        assert_eq!(record.total_hits, 999_999);
        assert_eq!(record.time_to_block_expire, 30_000);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_caught_by_the_failure_strategy() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        let err = storage.increment("", 60_000, 5, 0, "api").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn increment_lazily_installs_the_function_library_on_first_use() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let config = ThrottlerConfigBuilder::new()
            .host("localhost")
            .port(6379)
            .enable_redis_functions(true)
            .build()
            .unwrap();
        let storage = ThrottlerStorage::new(client.clone(), &config);
        // Nobody called `install()`/`probe()` up front. The first `increment`
        // should still discover the missing library itself (an `FCALL`
        // miss), install it, retry, and succeed — without the caller ever
        // seeing an error.
        assert!(!storage.loader().is_loaded());
        let record = storage.increment("alice", 60_000, 5, 0, "api").await.unwrap();
        assert_eq!(record.total_hits, 1);
        assert!(client.is_library_loaded());
        assert!(storage.loader().is_loaded());

        // And the second call goes straight through `FCALL` using the
        // library installed by the first one.
        let second = storage.increment("alice", 60_000, 5, 0, "api").await.unwrap();
        assert_eq!(second.total_hits, 2);
    }

    #[tokio::test]
    async fn increment_falls_back_to_inline_when_the_library_cannot_be_installed() {
        let client = Arc::new(FakeStoreClient::new(1000));
        client.force_function_load_error(true);
        let config = ThrottlerConfigBuilder::new()
            .host("localhost")
            .port(6379)
            .enable_redis_functions(true)
            .build()
            .unwrap();
        let storage = ThrottlerStorage::new(client.clone(), &config);
        // The first `FCALL` misses, the resulting install attempt fails (not
        // a connection error, just a rejected library), and the call must
        // still succeed via the inline `EVAL` path rather than propagating.
        let record = storage.increment("alice", 60_000, 5, 0, "api").await.unwrap();
        assert_eq!(record.total_hits, 1);
        assert!(!client.is_library_loaded());
    }

    #[tokio::test]
    async fn increment_reloads_and_recovers_when_the_installed_library_is_evicted() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let config = ThrottlerConfigBuilder::new()
            .host("localhost")
            .port(6379)
            .enable_redis_functions(true)
            .build()
            .unwrap();
        let storage = ThrottlerStorage::new(client.clone(), &config);
        // Force the loader to believe the library is present (simulating an
        // install that happened before an eviction), even though the fake
        // backend hasn't actually loaded it yet.
        storage.loader().install().await.unwrap();
        client.library_loaded.store(false, Ordering::SeqCst);
        assert!(storage.loader().is_loaded());

        let record = storage.increment("alice", 60_000, 5, 0, "api").await.unwrap();
        assert_eq!(record.total_hits, 1);
        assert!(client.is_library_loaded(), "reload should have reinstalled the library");
    }

    #[tokio::test]
    async fn reset_removes_every_key_for_an_identity_across_policies() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        storage.increment("alice", 60_000, 1, 30_000, "api").await.unwrap();
        storage.increment("alice", 60_000, 1, 30_000, "api").await.unwrap();
        storage.increment("alice", 60_000, 5, 0, "login").await.unwrap();

        storage.reset("alice").await.unwrap();

        let fresh = storage.increment("alice", 60_000, 1, 30_000, "api").await.unwrap();
        assert!(!fresh.is_blocked, "reset should have cleared the ban");
        assert_eq!(fresh.total_hits, 1);
    }

    #[tokio::test]
    async fn reset_on_an_identity_with_no_keys_is_a_no_op() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        storage.reset("nobody-has-ever-called-this").await.unwrap();
    }

    #[tokio::test]
    async fn reset_rejects_an_empty_identity() {
        let client = Arc::new(FakeStoreClient::new(1000));
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        let err = storage.reset("").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn reset_swallows_a_disconnected_store() {
        let client = Arc::new(FakeStoreClient::new(1000));
        client.force_connection_error(true);
        let storage = ThrottlerStorage::new(client, &config_with(1000));
        storage.reset("alice").await.unwrap();
    }

    #[tokio::test]
    async fn window_is_capped_at_max_window_size() {
        // `ThrottlerConfigBuilder::build` enforces the 100..=10000 range, so
        // a tiny window for this test is built directly rather than
        // through the builder's validation.
        let mut config = config_with(1000);
        config.throttler.max_window_size = 3;
        let client = Arc::new(FakeStoreClient::new(3));
        let storage = ThrottlerStorage::new(client, &config);
        for _ in 0..3 {
            storage.increment("alice", 60_000, 1000, 0, "api").await.unwrap();
        }
        let record = storage.increment("alice", 60_000, 1000, 0, "api").await.unwrap();
        assert_eq!(record.total_hits, 3, "cardinality must never exceed maxWindowSize");
    }
}
