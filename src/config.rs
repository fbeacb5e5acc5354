//! Runtime configuration
//!
//! Defaults are compiled in; the binary overrides them from the environment
//! and the first command line argument.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Channel buffer size for hub commands
pub const COMMAND_BUFFER_SIZE: usize = 256;

/// Channel buffer size for each connection's outbound frames
pub const CONNECTION_BUFFER_SIZE: usize = 1024;

/// Seconds a refresh may wait for room in a connection's queue
pub const REFRESH_TIMEOUT_SECS: u64 = 10;

/// Seconds between heartbeats
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Seconds without a heartbeat ack before a connection is evicted
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the hub command channel; a full channel blocks broadcasters
    pub command_buffer: usize,
    /// Capacity of each connection's outbound queue
    pub connection_buffer: usize,
    /// How long a targeted refresh waits for queue space before evicting
    pub refresh_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_buffer: COMMAND_BUFFER_SIZE,
            connection_buffer: CONNECTION_BUFFER_SIZE,
            refresh_timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub hub: HubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// Build from `STATESYNC_*` variables and the first CLI argument
    ///
    /// - `STATESYNC_ADDR` (overridden by the CLI argument)
    /// - `STATESYNC_HEARTBEAT_SECS`
    /// - `STATESYNC_HEARTBEAT_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(addr) = env::var("STATESYNC_ADDR") {
            config.addr = addr;
        }
        if let Some(addr) = env::args().nth(1) {
            config.addr = addr;
        }
        if let Some(secs) = secs_var("STATESYNC_HEARTBEAT_SECS") {
            config.hub.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = secs_var("STATESYNC_HEARTBEAT_TIMEOUT_SECS") {
            config.hub.heartbeat_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn secs_var(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(secs),
        _ => {
            warn!("Ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.hub.command_buffer, COMMAND_BUFFER_SIZE);
        assert!(config.hub.heartbeat_timeout > config.hub.heartbeat_interval);
    }

    #[test]
    fn test_invalid_secs_ignored() {
        env::set_var("STATESYNC_TEST_BAD_SECS", "soon");
        assert_eq!(secs_var("STATESYNC_TEST_BAD_SECS"), None);
        env::set_var("STATESYNC_TEST_GOOD_SECS", "15");
        assert_eq!(secs_var("STATESYNC_TEST_GOOD_SECS"), Some(15));
    }
}
