//! The atomic sliding-window admission algorithm, as Lua.
//!
//! There is exactly one algorithm body; it's rendered two ways so the
//! installed-library path and the inline-`EVAL` fallback can never drift
//! apart:
//!
//! - [`render_library`] wraps it in a Redis Function library shebang +
//!   `redis.register_function`, for [`crate::loader::Loader::install`].
//! - [`render_inline_eval`] wraps it in a bare `return f(KEYS, ARGV)` call,
//!   for [`crate::storage::ThrottlerStorage`]'s fallback path.
//!
//! `max_window_size` is baked into the rendered text as a Lua literal in
//! both cases: a live change to `throttler.maxWindowSize` requires a
//! `reload()` for the library path, or reconstructing the adapter for the
//! inline path — this crate does not silently drift, it documents the
//! requirement.

/// Name of the installed Redis Function library.
pub const LIBRARY_NAME: &str = "sliding_window_throttler";
/// Name of the function within the library.
pub const FUNCTION_NAME: &str = "sliding_window_check";

/// The admission decision, as an ordered 4-tuple, before it is parsed into a
/// `DecisionRecord` by the storage adapter: `(totalHits, timeToExpireSec,
/// isBlockedFlag, timeToBlockExpireSec)`.
const BODY_TEMPLATE: &str = r#"
local function sliding_window_check(keys, args)
  local z_key = keys[1]
  local block_key = keys[2]

  local ttl_ms = tonumber(args[1])
  local limit = tonumber(args[2])
  local block_duration_ms = tonumber(args[3])
  local now_ms = tonumber(args[4])
  local member = args[5]

  if ttl_ms == nil or ttl_ms <= 0 then
    return redis.error_reply('ttlMs must be > 0')
  end
  if limit == nil or limit <= 0 then
    return redis.error_reply('limit must be > 0')
  end
  if block_duration_ms == nil or block_duration_ms < 0 then
    return redis.error_reply('blockDurationMs must be >= 0')
  end
  if now_ms == nil or now_ms <= 0 then
    return redis.error_reply('nowMs must be > 0')
  end
  if member == nil or member == '' then
    return redis.error_reply('member must be non-empty')
  end

  local MAX_WINDOW_SIZE = __MAX_WINDOW_SIZE__

  local function ceil_ms_to_sec(ms)
    if ms < 0 then
      ms = 0
    end
    return math.ceil(ms / 1000)
  end

  if redis.call('EXISTS', block_key) == 1 then
    local block_ttl_ms = redis.call('PTTL', block_key)
    if block_ttl_ms == -1 and block_duration_ms > 1 then
      redis.call('PEXPIRE', block_key, block_duration_ms)
      block_ttl_ms = block_duration_ms
    end

    local z_ttl_ms = redis.call('PTTL', z_key)
    if z_ttl_ms < 0 then
      z_ttl_ms = 0
    end
    local expire_basis = z_ttl_ms
    if ttl_ms > expire_basis then
      expire_basis = ttl_ms
    end

    local block_basis = block_ttl_ms
    if block_basis < 0 then
      block_basis = 0
    end

    return {-1, ceil_ms_to_sec(expire_basis), 1, ceil_ms_to_sec(block_basis)}
  end

  local cutoff = now_ms - ttl_ms
  redis.call('ZREMRANGEBYSCORE', z_key, 0, cutoff)
  local count = redis.call('ZCARD', z_key)

  if count + 1 > limit then
    if block_duration_ms > 1 then
      redis.call('SET', block_key, '1', 'PX', block_duration_ms)
      local block_basis = block_duration_ms
      return {count + 1, ceil_ms_to_sec(ttl_ms), 1, ceil_ms_to_sec(block_basis)}
    else
      return {count + 1, ceil_ms_to_sec(ttl_ms), 1, -1}
    end
  end

  redis.call('ZADD', z_key, now_ms, member)
  redis.call('PEXPIRE', z_key, ttl_ms)

  local card = redis.call('ZCARD', z_key)
  if card > MAX_WINDOW_SIZE then
    redis.call('ZPOPMIN', z_key, card - MAX_WINDOW_SIZE)
    card = MAX_WINDOW_SIZE
  end

  local z_ttl_ms = redis.call('PTTL', z_key)
  if z_ttl_ms < 0 then
    z_ttl_ms = 0
  end
  local expire_basis = z_ttl_ms
  if ttl_ms > expire_basis then
    expire_basis = ttl_ms
  end

  return {card, ceil_ms_to_sec(expire_basis), 0, -1}
end
"#;

fn render_body(max_window_size: u32) -> String {
    BODY_TEMPLATE.replace("__MAX_WINDOW_SIZE__", &max_window_size.to_string())
}

/// Render the full Redis Function library source for [`LIBRARY_NAME`],
/// installed with `FUNCTION LOAD REPLACE`.
pub fn render_library(max_window_size: u32) -> String {
    format!(
        "#!lua name={LIBRARY_NAME}\n{body}\nredis.register_function('{FUNCTION_NAME}', sliding_window_check)\n",
        body = render_body(max_window_size),
    )
}

/// Render the equivalent body for a single `EVAL`, used when Redis Functions
/// are disabled or unavailable.
pub fn render_inline_eval(max_window_size: u32) -> String {
    format!(
        "{body}\nreturn sliding_window_check(KEYS, ARGV)\n",
        body = render_body(max_window_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_carries_shebang_and_registration() {
        let lib = render_library(1000);
        assert!(lib.starts_with("#!lua name=sliding_window_throttler\n"));
        assert!(lib.contains("redis.register_function('sliding_window_check'"));
        assert!(lib.contains("MAX_WINDOW_SIZE = 1000"));
    }

    #[test]
    fn inline_eval_has_no_shebang_and_returns_directly() {
        let body = render_inline_eval(1000);
        assert!(!body.contains("#!lua"));
        assert!(body.trim_end().ends_with("return sliding_window_check(KEYS, ARGV)"));
    }

    #[test]
    fn both_renderings_share_the_same_algorithm_body() {
        let lib = render_library(500);
        let inline = render_inline_eval(500);
        assert!(lib.contains("ZREMRANGEBYSCORE"));
        assert!(inline.contains("ZREMRANGEBYSCORE"));
        assert!(lib.contains("redis.call('SET', block_key"));
        assert!(inline.contains("redis.call('SET', block_key"));
    }

    #[test]
    fn mentions_every_required_redis_command() {
        let body = render_inline_eval(1000);
        for cmd in [
            "EXISTS", "PTTL", "PEXPIRE", "ZREMRANGEBYSCORE", "ZCARD", "ZADD", "ZPOPMIN", "SET",
        ] {
            assert!(body.contains(cmd), "script should call {cmd}");
        }
    }

    #[test]
    fn block_duration_of_one_is_not_a_block() {
        let body = render_inline_eval(1000);
        assert!(body.contains("block_duration_ms > 1"));
    }
}
