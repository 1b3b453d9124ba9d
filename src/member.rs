//! Counter-set member generation and parsing.
//!
//! A member is `"<timestampMs>:<salt>"`; the salt guarantees uniqueness even
//! when two admissions land in the same millisecond.

use rand::Rng;

const SALT_LEN: usize = 6;
const SALT_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh member for `now_ms`, using a uniformly random 6-character
/// `[a-z0-9]` salt drawn from a fresh `rand::rng()` call, not a seeded or
/// shared generator.
pub fn generate(now_ms: u64) -> String {
    let mut rng = rand::rng();
    let salt: String = (0..SALT_LEN)
        .map(|_| {
            let idx = rng.random_range(0..SALT_ALPHABET.len());
            SALT_ALPHABET[idx] as char
        })
        .collect();
    format!("{now_ms}:{salt}")
}

/// Parse a member back into `(timestamp_ms, salt)`. Returns `None` when there
/// isn't exactly one `:` or the timestamp half doesn't parse as an integer.
pub fn parse(member: &str) -> Option<(u64, &str)> {
    let mut parts = member.split(':');
    let ts_part = parts.next()?;
    let salt_part = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let ts = ts_part.parse::<u64>().ok()?;
    Some((ts, salt_part))
}
