//! Session configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coords::ScrollEpoch;

/// Default relay endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3030/ws";
/// Default room joined when none is configured.
pub const DEFAULT_ROOM: &str = "lobby";
/// Minimum time between two successful "clear all" operations.
pub const DEFAULT_CLEAR_COOLDOWN_SECS: u64 = 60;
/// Undo steps retained per participant.
pub const DEFAULT_MAX_UNDO_STEPS: usize = 100;
/// First reconnect delay after the link drops.
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
/// Upper bound for the reconnect delay.
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

/// Configuration for one collaborative session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket URL of the relay server.
    pub server_url: String,
    /// Room shared by all participants of this canvas.
    pub room: String,
    /// Cooldown between successful clears, in seconds.
    pub clear_cooldown_secs: u64,
    /// Maximum number of undo steps kept locally.
    pub max_undo_steps: usize,
    /// Initial reconnect backoff, in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Maximum reconnect backoff, in milliseconds.
    pub reconnect_max_ms: u64,
    /// Reference point for the auto-scroll offset.
    pub scroll_epoch: ScrollEpoch,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            room: DEFAULT_ROOM.to_string(),
            clear_cooldown_secs: DEFAULT_CLEAR_COOLDOWN_SECS,
            max_undo_steps: DEFAULT_MAX_UNDO_STEPS,
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            scroll_epoch: ScrollEpoch::default(),
        }
    }
}

impl SessionConfig {
    /// Build a config from defaults overridden by `DRIFTLINE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("DRIFTLINE_SERVER_URL").unwrap_or(defaults.server_url),
            room: std::env::var("DRIFTLINE_ROOM").unwrap_or(defaults.room),
            clear_cooldown_secs: env_parse(
                "DRIFTLINE_CLEAR_COOLDOWN_SECS",
                defaults.clear_cooldown_secs,
            ),
            max_undo_steps: env_parse("DRIFTLINE_MAX_UNDO_STEPS", defaults.max_undo_steps),
            ..defaults
        }
    }

    /// Set the relay URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set the room.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn clear_cooldown(&self) -> Duration {
        Duration::from_secs(self.clear_cooldown_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.clear_cooldown(), Duration::from_secs(60));
        assert_eq!(config.room, "lobby");
        assert!(config.reconnect_max() >= config.reconnect_initial());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"room":"night-shift","scroll_epoch":"utc_midnight"}"#).unwrap();
        assert_eq!(config.room, "night-shift");
        assert_eq!(config.scroll_epoch, ScrollEpoch::UtcMidnight);
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("DRIFTLINE_TEST_UNSET_VARIABLE", 7usize), 7);
    }
}
