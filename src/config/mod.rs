//! Configuration management.
//!
//! This module resolves the effective storage connection string, reads the
//! environment variables that tune the backends, and maps `LOG_LEVEL` to a
//! tracing filter directive.
//!
//! # Resolution order
//!
//! 1. Explicit override (CLI flag)
//! 2. `STORAGE_CONNECTION_STRING` environment variable
//! 3. Platform default: `sqlite:///~/.local/share/memvault/memory.db`
//!
//! There is **no silent fallback** between backends: if the selected
//! backend fails to initialize, startup fails loudly.

pub mod connection;

pub use connection::{ConnectionDescriptor, RedisConfig, SqliteConfig};

/// Environment variable selecting backend and connection parameters.
pub const STORAGE_CONNECTION_STRING: &str = "STORAGE_CONNECTION_STRING";

/// Environment variable overriding the Redis key namespace prefix.
pub const REDIS_KEY_PREFIX: &str = "REDIS_KEY_PREFIX";

/// Environment variable overriding the Redis TTL in hours (0 disables).
pub const REDIS_TTL_HOURS: &str = "REDIS_TTL_HOURS";

/// Environment variable pointing at the operator instruction file.
pub const CUSTOM_INSTRUCTION_PATH: &str = "CUSTOM_INSTRUCTION_PATH";

/// Environment variable selecting the log level.
pub const LOG_LEVEL: &str = "LOG_LEVEL";

/// Default Redis key namespace prefix.
pub const DEFAULT_REDIS_KEY_PREFIX: &str = "extended_memory";

/// Default Redis TTL: one year.
pub const DEFAULT_REDIS_TTL_HOURS: u64 = 8760;

/// Resolve the effective connection string.
///
/// Priority: explicit override, then `STORAGE_CONNECTION_STRING`, then the
/// platform default under the user's data directory.
#[must_use]
pub fn resolve_connection_string(explicit: Option<&str>) -> String {
    if let Some(s) = explicit {
        if !s.trim().is_empty() {
            return s.to_string();
        }
    }

    if let Ok(s) = std::env::var(STORAGE_CONNECTION_STRING) {
        if !s.trim().is_empty() {
            // A bare path is treated as a sqlite database location.
            if s.contains("://") {
                return s;
            }
            return format!("sqlite:///{}", s.trim_start_matches('/'));
        }
    }

    default_connection_string()
}

/// The platform default connection string.
#[must_use]
pub fn default_connection_string() -> String {
    "sqlite:///~/.local/share/memvault/memory.db".to_string()
}

/// Redis key prefix, `REDIS_KEY_PREFIX` or the default.
#[must_use]
pub fn redis_key_prefix() -> String {
    std::env::var(REDIS_KEY_PREFIX)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REDIS_KEY_PREFIX.to_string())
}

/// Redis TTL in hours, `REDIS_TTL_HOURS` or the default. Zero disables
/// expiry entirely.
#[must_use]
pub fn redis_ttl_hours() -> u64 {
    std::env::var(REDIS_TTL_HOURS)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_REDIS_TTL_HOURS)
}

/// Map a `LOG_LEVEL` value to a tracing filter directive.
///
/// Accepts the conventional level names (`TRACE`, `DEBUG`, `INFO`,
/// `WARNING`, `ERROR`, `CRITICAL`), case-insensitively. Unknown values
/// fall back to `info`.
#[must_use]
pub fn log_filter_directive(level: Option<&str>) -> &'static str {
    let level = level
        .map(str::to_uppercase)
        .or_else(|| std::env::var(LOG_LEVEL).ok().map(|v| v.to_uppercase()));

    match level.as_deref() {
        Some("TRACE") => "trace",
        Some("DEBUG") => "debug",
        Some("WARNING" | "WARN") => "warn",
        Some("ERROR" | "CRITICAL") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let resolved = resolve_connection_string(Some("redis://localhost:6379/1"));
        assert_eq!(resolved, "redis://localhost:6379/1");
    }

    #[test]
    fn blank_override_is_ignored() {
        let resolved = resolve_connection_string(Some("   "));
        // Falls through to env or default; either way it is a sqlite URL
        // unless the test environment set a different store.
        assert!(resolved.contains("://"));
    }

    #[test]
    fn default_is_sqlite_under_data_dir() {
        let default = default_connection_string();
        assert!(default.starts_with("sqlite:///"));
        assert!(default.ends_with("memory.db"));
    }

    #[test]
    fn log_levels_map_to_directives() {
        assert_eq!(log_filter_directive(Some("TRACE")), "trace");
        assert_eq!(log_filter_directive(Some("debug")), "debug");
        assert_eq!(log_filter_directive(Some("WARNING")), "warn");
        assert_eq!(log_filter_directive(Some("CRITICAL")), "error");
        assert_eq!(log_filter_directive(Some("bogus")), "info");
    }
}
