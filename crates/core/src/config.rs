//! Environment-driven configuration helpers.
//!
//! Values are read once at startup. A variable that is set but fails to parse
//! logs a warning and falls back to the default instead of aborting.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Non-empty, trimmed value of an environment variable.
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable, falling back to `default`.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match env_var(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "invalid configuration value, using default");
            default
        }),
    }
}

/// Boolean flag: `1`, `true`, `yes`, `on` (any case) are true.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_var(key) {
        None => default,
        Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
    }
}

pub fn env_secs(key: &str, default: Duration) -> Duration {
    env_var(key)
        .and_then(|raw| match raw.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
            _ => {
                warn!(key, value = %raw, "invalid duration in seconds, using default");
                None
            }
        })
        .unwrap_or(default)
}

pub fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}
