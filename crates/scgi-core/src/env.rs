//! `SCGI_*` environment overrides.
//!
//! Values are trimmed before parsing. An empty value counts as unset.
//!
//! ```ignore
//! use scgi_core::env::{env_get, env_get_bool};
//!
//! let port: u16 = env_get("SCGI_PORT", 4000);
//! let echo = env_get_bool("SCGI_HELLO_ECHO_ENV", false);
//! ```

use std::str::FromStr;

/// Trimmed, non-empty value of `key`.
fn lookup(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

/// Parsed value of `key`, or `default` when unset or unparsable.
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    lookup(key)?.parse().ok()
}

pub fn env_get_str(key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_owned())
}

/// On/off switch. Unrecognized values fall back to `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    lookup(key).and_then(|v| parse_flag(&v)).unwrap_or(default)
}

fn parse_flag(value: &str) -> Option<bool> {
    const ON: [&str; 4] = ["1", "true", "yes", "on"];
    const OFF: [&str; 4] = ["0", "false", "no", "off"];
    if ON.iter().any(|s| s.eq_ignore_ascii_case(value)) {
        Some(true)
    } else if OFF.iter().any(|s| s.eq_ignore_ascii_case(value)) {
        Some(false)
    } else {
        None
    }
}
