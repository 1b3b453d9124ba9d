//! Key derivation — pure functions from (identity, policy) to the two Redis
//! keys an admission decision touches. No I/O, no randomness.

use crate::error::{ErrorCode, ThrottlerError, ThrottlerResult};

const MAX_TOKEN_BYTES: usize = 100;
const MAX_KEY_BYTES: usize = 512;
const FORBIDDEN_CHARS: [char; 4] = ['\r', '\n', '\t', '\0'];

/// Whether the two keys for an (identity, policy) pair share a cluster hash
/// tag (required for the admission script's multi-key atomicity on a sharded
/// deployment) or use the simple, non-clustered template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyLayout {
    #[default]
    Clustered,
    Simple,
}

/// The two keys backing one (identity, policy) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleKeys {
    /// Ordered set of admission markers (the counter).
    pub counter_key: String,
    /// String key whose existence means "blocked".
    pub block_key: String,
}

/// Sanitize one path component before it becomes part of a key:
/// strip forbidden control characters, replace `: whitespace @ #` with
/// `_ _at_ _hash_` respectively, lowercase, truncate to 100 bytes, and
/// substitute the literal `sanitized` if the result is empty.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if FORBIDDEN_CHARS.contains(&ch) {
            continue;
        }
        match ch {
            ':' => out.push('_'),
            '@' => out.push_str("_at_"),
            '#' => out.push_str("_hash_"),
            c if c.is_whitespace() => out.push('_'),
            c => out.push(c),
        }
    }
    let lowered = out.to_lowercase();
    let truncated = truncate_bytes(&lowered, MAX_TOKEN_BYTES);
    if truncated.is_empty() {
        "sanitized".to_string()
    } else {
        truncated
    }
}

fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Derive the counter/block key pair for (identity, policy).
///
/// `prefix` is the configured `throttler.keyPrefix` (or an explicit
/// override); `layout` selects the cluster-safe or simple template.
pub fn derive_keys(
    identity: &str,
    policy_name: &str,
    prefix: &str,
    layout: KeyLayout,
) -> ThrottlerResult<ThrottleKeys> {
    let prefix = sanitize(prefix);
    let identity = sanitize(identity);
    let policy = sanitize(policy_name);

    let (counter_key, block_key) = match layout {
        KeyLayout::Clustered => (
            format!("{prefix}:{{{identity}_{policy}}}:z"),
            format!("{prefix}:{{{identity}_{policy}}}:block"),
        ),
        KeyLayout::Simple => (
            format!("{prefix}:{identity}:{policy}:z"),
            format!("{prefix}:{identity}:{policy}:block"),
        ),
    };

    validate_key(&counter_key)?;
    validate_key(&block_key)?;

    Ok(ThrottleKeys {
        counter_key,
        block_key,
    })
}

/// Post-sanitization validation, should be unreachable in practice.
fn validate_key(key: &str) -> ThrottlerResult<()> {
    if key.len() > MAX_KEY_BYTES {
        return Err(ThrottlerError::configuration(
            ErrorCode::InvalidConfiguration,
            format!("derived key exceeds {MAX_KEY_BYTES} bytes: {key}"),
        ));
    }
    if key.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(ThrottlerError::configuration(
            ErrorCode::InvalidConfiguration,
            "derived key contains a forbidden control character",
        ));
    }
    Ok(())
}

/// Cursor-scan pattern matching every key belonging to `identity` across all
/// policies, for `reset`. Under the clustered layout this pattern is scoped
/// to one hash tag per identity, so a `SCAN` against a single node only
/// covers that node's slot range; a sharded deployment must fan this out
/// per shard itself.
pub fn scan_pattern(identity: &str, prefix: &str, layout: KeyLayout) -> String {
    let prefix = sanitize(prefix);
    let identity = sanitize(identity);
    match layout {
        KeyLayout::Clustered => format!("{prefix}:{{{identity}_*}}:*"),
        KeyLayout::Simple => format!("{prefix}:{identity}:*:*"),
    }
}
