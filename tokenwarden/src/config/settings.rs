//! Runtime-mutable settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Default peer host.
pub const DEFAULT_PEER_HOST: &str = "127.0.0.1";

/// Default peer port.
pub const DEFAULT_PEER_PORT: u16 = 3001;

/// Ports used by older peer builds; always rewritten to [`DEFAULT_PEER_PORT`].
const LEGACY_PEER_PORTS: [u16; 2] = [80, 3000];

/// Settings that can change while the process is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host of the remote peer.
    #[serde(alias = "wplacerHost")]
    pub host: String,
    /// Port of the remote peer.
    #[serde(alias = "wplacerPort")]
    pub port: u16,
    /// Periodic tab reload interval in seconds (0 disables it).
    #[serde(alias = "wplacerAutoReload", alias = "autoReload")]
    pub auto_reload_secs: u64,
    /// Optional tracing filter directive to apply.
    pub log_filter: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_PEER_HOST.to_string(),
            port: DEFAULT_PEER_PORT,
            auto_reload_secs: 0,
            log_filter: None,
        }
    }
}

impl Settings {
    /// Rewrite legacy values to their current equivalents.
    pub fn normalized(mut self) -> Self {
        if LEGACY_PEER_PORTS.contains(&self.port) {
            info!(
                old_port = self.port,
                new_port = DEFAULT_PEER_PORT,
                "Rewriting legacy peer port"
            );
            self.port = DEFAULT_PEER_PORT;
        }
        if self.host.trim().is_empty() {
            self.host = DEFAULT_PEER_HOST.to_string();
        }
        self
    }

    /// Base URL of the remote peer (no trailing slash).
    pub fn peer_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Auto-reload period, if enabled.
    pub fn auto_reload_interval(&self) -> Option<Duration> {
        (self.auto_reload_secs > 0).then(|| Duration::from_secs(self.auto_reload_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_ports_are_rewritten() {
        for port in [80, 3000] {
            let settings = Settings {
                port,
                ..Settings::default()
            }
            .normalized();
            assert_eq!(settings.port, DEFAULT_PEER_PORT);
        }

        let custom = Settings {
            port: 8088,
            ..Settings::default()
        }
        .normalized();
        assert_eq!(custom.port, 8088);
    }

    #[test]
    fn test_deserialize_accepts_extension_field_names() {
        let settings: Settings =
            serde_json::from_str(r#"{"wplacerPort": 4000, "wplacerAutoReload": 30}"#).unwrap();
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.host, DEFAULT_PEER_HOST);
        assert_eq!(settings.auto_reload_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_peer_base_url() {
        let settings = Settings::default();
        assert_eq!(settings.peer_base_url(), "http://127.0.0.1:3001");
        assert_eq!(settings.auto_reload_interval(), None);
    }
}
