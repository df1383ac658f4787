//! Environment configuration for both binaries.
//!
//! Every value has a default; `.env` is loaded by the binaries before any of
//! these are read.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:6574";
pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_DATA_DIR: &str = ".partyroom";

/// Trimmed value of `name`; unset and blank are both `None`
pub fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    let ms = match env_value(name) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) if ms > 0 => ms,
            _ => {
                tracing::warn!("Ignoring {}={:?}, using {}ms", name, raw, default_ms);
                default_ms
            }
        },
        None => default_ms,
    };
    Duration::from_millis(ms)
}

/// Client-side intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Freshness re-load of every remote collection
    pub poll: Duration,
    /// Presence heartbeat
    pub heartbeat: Duration,
    /// Timer display tick
    pub tick: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(1_000),
            heartbeat: Duration::from_millis(5_000),
            tick: Duration::from_millis(200),
        }
    }
}

impl Timings {
    /// PARTYROOM_POLL_MS, PARTYROOM_HEARTBEAT_MS, PARTYROOM_TICK_MS
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll: env_millis("PARTYROOM_POLL_MS", defaults.poll.as_millis() as u64),
            heartbeat: env_millis("PARTYROOM_HEARTBEAT_MS", defaults.heartbeat.as_millis() as u64),
            tick: env_millis("PARTYROOM_TICK_MS", defaults.tick.as_millis() as u64),
        }
    }
}

/// Terminal client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where device storage (identity, local mirror) is persisted
    pub data_dir: PathBuf,
    /// Word lists read from disk when no hosted store is configured
    pub static_dir: PathBuf,
    pub timings: Timings,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: env_value("PARTYROOM_DATA_DIR")
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())
                .into(),
            static_dir: env_value("PARTYROOM_STATIC_DIR")
                .unwrap_or_else(|| DEFAULT_STATIC_DIR.to_string())
                .into(),
            timings: Timings::from_env(),
        }
    }
}

/// Store server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let bind = match env_value("PARTYROOM_BIND") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("Invalid PARTYROOM_BIND {:?} ({}), using {}", raw, e, DEFAULT_BIND);
                default_bind()
            }),
            None => default_bind(),
        };
        Self {
            bind,
            static_dir: env_value("PARTYROOM_STATIC_DIR")
                .unwrap_or_else(|| DEFAULT_STATIC_DIR.to_string())
                .into(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6574))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_timings_from_env() {
        std::env::set_var("PARTYROOM_POLL_MS", "250");
        std::env::set_var("PARTYROOM_HEARTBEAT_MS", " ");
        std::env::set_var("PARTYROOM_TICK_MS", "soon");
        let timings = Timings::from_env();
        std::env::remove_var("PARTYROOM_POLL_MS");
        std::env::remove_var("PARTYROOM_HEARTBEAT_MS");
        std::env::remove_var("PARTYROOM_TICK_MS");

        assert_eq!(timings.poll, Duration::from_millis(250));
        assert_eq!(timings.heartbeat, Duration::from_secs(5));
        assert_eq!(timings.tick, Duration::from_millis(200));
    }

    #[test]
    #[serial]
    fn test_server_config_defaults() {
        std::env::remove_var("PARTYROOM_BIND");
        std::env::remove_var("PARTYROOM_STATIC_DIR");
        let config = ServerConfig::from_env();
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
        assert_eq!(config.static_dir, PathBuf::from("static"));

        std::env::set_var("PARTYROOM_BIND", "not an address");
        assert_eq!(ServerConfig::from_env().bind.to_string(), DEFAULT_BIND);
        std::env::remove_var("PARTYROOM_BIND");
    }
}
