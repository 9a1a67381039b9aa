use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Reconnection backoff bounds for the dispatching side of the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Minimum delay between connection attempts.
    #[serde(default = "default_reconnect_floor_ms")]
    pub floor_ms: u64,
    /// Maximum delay between connection attempts.
    #[serde(default = "default_reconnect_ceiling_ms")]
    pub ceiling_ms: u64,
}

fn default_reconnect_floor_ms() -> u64 {
    1000
}

fn default_reconnect_ceiling_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            floor_ms: default_reconnect_floor_ms(),
            ceiling_ms: default_reconnect_ceiling_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// WebSocket endpoint the dispatcher connects to.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// TCP address the executor listens on for the extension connection.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Interval between keepalive frames once connected.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// How long a submitted call may wait for its response before it fails
    /// with a timeout and is dropped from the pending table.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:9223/".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:9223".to_string()
}

fn default_keepalive_interval_ms() -> u64 {
    15_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            listen_addr: default_listen_addr(),
            reconnect: ReconnectConfig::default(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON config file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        if config.reconnect.floor_ms == 0 {
            return Err(Error::Config(
                "reconnect.floorMs must be at least 1".to_string(),
            ));
        }
        if config.reconnect.ceiling_ms < config.reconnect.floor_ms {
            return Err(Error::Config(
                "reconnect.ceilingMs must not be below reconnect.floorMs".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.endpoint, "ws://127.0.0.1:9223/");
        assert_eq!(config.reconnect.floor_ms, 1000);
        assert_eq!(config.reconnect.ceiling_ms, 30_000);
        assert_eq!(config.call_timeout_ms, 30_000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"keepaliveIntervalMs": 5000}"#).unwrap();
        assert_eq!(config.keepalive_interval_ms, 5000);
        assert_eq!(config.endpoint, "ws://127.0.0.1:9223/");
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = BridgeConfig::load(Path::new("/nonexistent/tabrelay.json")).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9223");
    }
}
