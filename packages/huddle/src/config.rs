use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::routes::Routes;
use crate::session::ReconnectPolicy;

// =============================================================================
// Layered config: defaults → huddle.toml → HUDDLE_* env vars
// =============================================================================
//
//   huddle.toml:     [reconnect]
//                    max_attempts = 8
//
//   env var:         HUDDLE_RECONNECT__MAX_ATTEMPTS=8   (double underscore = nesting)

pub const CONFIG_FILE: &str = "huddle.toml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub routes: Routes,
}

/// Broker and API endpoints (lives under `[server]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
            connect_timeout_ms: default_timeout_ms(),
            request_timeout_ms: default_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Which history paths run (lives under `[history]`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub socket: bool,
    #[serde(default = "default_true")]
    pub rest: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            socket: true,
            rest: true,
        }
    }
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws".to_string()
}
fn default_api_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

/// `<platform config dir>/huddle`, falling back to `./.huddle`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("huddle"))
        .unwrap_or_else(|| PathBuf::from(".huddle"))
}

/// Build a figment that layers: defaults → huddle.toml → HUDDLE_* env vars.
pub fn load_config(dir: &Path) -> Figment {
    use figment::providers::{Env, Format, Serialized, Toml};

    Figment::from(Serialized::defaults(ClientConfig::default()))
        .merge(Toml::file(dir.join(CONFIG_FILE)))
        .merge(Env::prefixed("HUDDLE_").split("__"))
}

impl ClientConfig {
    /// Load and validate the configuration found in `dir`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config: ClientConfig = load_config(dir).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconnect.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.server.ws_url, "ws://localhost:8080/ws");
        assert_eq!(c.server.api_url, "http://localhost:8080/api");
        assert_eq!(c.reconnect.base_delay_ms, 2000);
        assert_eq!(c.reconnect.factor, 1.5);
        assert_eq!(c.reconnect.max_attempts, 5);
        assert!(c.history.socket && c.history.rest);
        assert_eq!(c.routes.public_topic, "/topic/public");
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let c: ClientConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(c, ClientConfig::default());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "[server]\nws_url = \"wss://chat.example.com/ws\"\n\n\
             [reconnect]\nmax_attempts = 8\n\n\
             [history]\nrest = false\n\n\
             [routes]\ngroup_topic = \"/topic/room.{channel}\"\n",
        )
        .unwrap();
        let c = ClientConfig::load(tmp.path()).unwrap();
        assert_eq!(c.server.ws_url, "wss://chat.example.com/ws");
        assert_eq!(c.server.api_url, "http://localhost:8080/api");
        assert_eq!(c.reconnect.max_attempts, 8);
        assert_eq!(c.reconnect.base_delay_ms, 2000);
        assert!(!c.history.rest);
        assert!(c.history.socket);
        assert_eq!(c.routes.group_topic, "/topic/room.{channel}");
        assert_eq!(c.routes.public_topic, "/topic/public");
    }

    #[test]
    fn test_load_rejects_non_growing_backoff() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "[reconnect]\nfactor = 0.5\n").unwrap();
        assert!(matches!(
            ClientConfig::load(tmp.path()),
            Err(ConfigError::InvalidFactor(_))
        ));
    }

    #[test]
    fn test_load_reports_malformed_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "[reconnect\n").unwrap();
        assert!(matches!(
            ClientConfig::load(tmp.path()),
            Err(ConfigError::Figment(_))
        ));
    }

    #[test]
    fn test_resolved_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        assert!(rendered.contains("[reconnect]"));
        assert!(rendered.contains("base_delay_ms = 2000"));
    }
}
