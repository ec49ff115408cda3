//! Environment variable helpers
//!
//! All runtime knobs are read through these, so a malformed value falls back
//! to the compiled-in default instead of failing startup. Use
//! [`env_get_checked`] where a malformed value must be reported.
//!
//! ```ignore
//! use weft_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("WEFT_NUM_THREADS", 4);
//! let pin = env_get_bool("WEFT_USE_PROCESS_MASK", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or unparsable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Like [`env_get_opt`] but distinguishes "unset" from "set to garbage"
///
/// Returns `Ok(None)` when unset, `Err(raw)` when the value does not parse.
pub fn env_get_checked<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| raw),
        Err(_) => Ok(None),
    }
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, anything
/// else that is set is false, unset yields `default`
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// String value or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond duration or `default`
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}
