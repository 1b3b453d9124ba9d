//! Script/library loader: installs the admission procedure, probes whether
//! it's present, and recovers from eviction.
//!
//! Presence is tracked with a single `AtomicBool` rather than a cached
//! script SHA, since a Redis Function library is addressed by name, not by
//! hash — unlike a plain `EVAL`/`EVALSHA` script.

use crate::client::StoreClient;
use crate::error::{ErrorCode, ThrottlerError, ThrottlerResult};
use crate::script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keys/args that deliberately fail the script's own argument validation
/// (`ttlMs must be > 0`), used by [`Loader::probe`] to distinguish "the
/// function exists and rejected bogus input" from "the function doesn't
/// exist at all."
const PROBE_KEYS: [&str; 2] = ["__throttler_probe__:{probe}:z", "__throttler_probe__:{probe}:block"];
const PROBE_ARGS: [&str; 5] = ["0", "1", "0", "1", "probe"];

/// Installs and tracks availability of the admission procedure. Multiple
/// `Loader`s (e.g. one per `ThrottlerStorage` instance) sharing the same
/// client and library name may call `reload()` concurrently; the operation
/// is idempotent (`FUNCTION LOAD REPLACE`), so redundant reloads are
/// harmless.
pub struct Loader<C: StoreClient> {
    client: Arc<C>,
    loaded: AtomicBool,
    max_window_size: u32,
}

impl<C: StoreClient> Loader<C> {
    pub fn new(client: Arc<C>, max_window_size: u32) -> Self {
        Self {
            client,
            loaded: AtomicBool::new(false),
            max_window_size,
        }
    }

    /// Install the library with replace-if-exists semantics. Connection
    /// errors propagate as `RedisConnection`; any other failure is reported
    /// as `Operation(REDIS_FUNCTIONS_LOAD_FAILED)`.
    pub async fn install(&self) -> ThrottlerResult<()> {
        let source = script::render_library(self.max_window_size);
        match self.client.function_load(&source).await {
            Ok(()) => {
                self.loaded.store(true, Ordering::SeqCst);
                debug!(library = script::LIBRARY_NAME, "installed admission function library");
                Ok(())
            }
            Err(err @ ThrottlerError::RedisConnection { .. }) => {
                self.loaded.store(false, Ordering::SeqCst);
                Err(err)
            }
            Err(err) => {
                self.loaded.store(false, Ordering::SeqCst);
                warn!(error = %err, "failed to install admission function library");
                Err(ThrottlerError::operation_with_source(
                    ErrorCode::RedisFunctionsLoadFailed,
                    format!("failed to install {}: {err}", script::LIBRARY_NAME),
                    err,
                ))
            }
        }
    }

    /// Probe by invoking the function once with arguments that trip its own
    /// validation. A validation-error reply still means the function is
    /// present; a not-found reply means it isn't. Never returns an `Err` —
    /// the result collapses into the `loaded` flag.
    pub async fn probe(&self) -> bool {
        let keys: Vec<String> = PROBE_KEYS.iter().map(|s| s.to_string()).collect();
        let args: Vec<String> = PROBE_ARGS.iter().map(|s| s.to_string()).collect();

        let present = match self.client.fcall(script::FUNCTION_NAME, &keys, &args).await {
            Ok(_) => true,
            Err(ThrottlerError::Operation { code, .. }) => code != ErrorCode::RedisFunctionsLoadFailed,
            Err(_) => false,
        };

        self.loaded.store(present, Ordering::SeqCst);
        present
    }

    /// Whether the last install/probe/reload/successful call observed the
    /// library present. Eventual consistency is acceptable here: the worst
    /// case of a stale `true` is one extra failed `FCALL` that falls back to
    /// reload-and-retry, and the worst case of a stale `false` is one extra
    /// optimistic `FCALL` attempt before that's discovered.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Record that the library was observed present without performing any
    /// I/O — used when a caller's own round-trip (e.g. a successful
    /// `FCALL`) already proves it, so there's no need to probe again.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    /// Force a reinstall, e.g. after observing a not-found reply on a live
    /// `increment` call.
    pub async fn reload(&self) -> ThrottlerResult<()> {
        self.install().await
    }
}
