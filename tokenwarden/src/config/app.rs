//! Startup configuration loaded from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use url::Url;

use super::Settings;
use crate::clearance::ScraperConfig;
use crate::{Error, Result};

const DEFAULT_SITE_URL: &str = "https://bplace.org/";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_BRIDGE_PORT: u16 = 3002;
const DEFAULT_SCRAPER_PROGRAM: &str = "python";

/// File name of the persisted clearance snapshot inside the data directory.
pub const CLEARANCE_CACHE_FILE: &str = "cf_clearance_cache.json";

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Runtime-mutable settings (peer address, auto reload).
    pub settings: Settings,
    /// Site whose tabs produce tokens and whose cookies are forwarded.
    pub site_url: Url,
    /// Directory for the clearance snapshot and scraper temp files.
    pub data_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Loopback address of the browser bridge.
    pub bridge_addr: SocketAddr,
    /// Interpreter used to run the clearance scraper.
    pub scraper_program: String,
    /// Directory containing the scraper's `main.py`.
    pub scraper_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `TOKENWARDEN_PEER_HOST`, `TOKENWARDEN_PEER_PORT`
    /// - `TOKENWARDEN_AUTO_RELOAD_SECS`
    /// - `TOKENWARDEN_SITE_URL`
    /// - `TOKENWARDEN_DATA_DIR`, `TOKENWARDEN_LOG_DIR`
    /// - `TOKENWARDEN_BRIDGE_ADDR`
    /// - `TOKENWARDEN_SCRAPER_PROGRAM`, `TOKENWARDEN_SCRAPER_DIR`
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env_or_default`] with an explicit lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self {
            settings: Settings::default(),
            site_url: Url::parse(DEFAULT_SITE_URL)
                .map_err(|e| Error::config(format!("invalid default site URL: {e}")))?,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            bridge_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_BRIDGE_PORT)),
            scraper_program: DEFAULT_SCRAPER_PROGRAM.to_string(),
            scraper_dir: None,
        };

        if let Some(host) = get("TOKENWARDEN_PEER_HOST") {
            config.settings.host = host;
        }
        if let Some(port) = get("TOKENWARDEN_PEER_PORT") {
            config.settings.port = port
                .parse()
                .map_err(|_| Error::config(format!("invalid TOKENWARDEN_PEER_PORT: {port}")))?;
        }
        if let Some(secs) = get("TOKENWARDEN_AUTO_RELOAD_SECS") {
            config.settings.auto_reload_secs = secs.parse().map_err(|_| {
                Error::config(format!("invalid TOKENWARDEN_AUTO_RELOAD_SECS: {secs}"))
            })?;
        }
        if let Some(site) = get("TOKENWARDEN_SITE_URL") {
            config.site_url = Url::parse(&site)
                .map_err(|e| Error::config(format!("invalid TOKENWARDEN_SITE_URL: {e}")))?;
        }
        if let Some(dir) = get("TOKENWARDEN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("TOKENWARDEN_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(addr) = get("TOKENWARDEN_BRIDGE_ADDR") {
            config.bridge_addr = addr
                .parse()
                .map_err(|_| Error::config(format!("invalid TOKENWARDEN_BRIDGE_ADDR: {addr}")))?;
        }
        if let Some(program) = get("TOKENWARDEN_SCRAPER_PROGRAM") {
            config.scraper_program = program;
        }
        if let Some(dir) = get("TOKENWARDEN_SCRAPER_DIR") {
            config.scraper_dir = Some(PathBuf::from(dir));
        }

        config.settings = config.settings.normalized();
        Ok(config)
    }

    /// Path of the persisted clearance snapshot.
    pub fn clearance_cache_path(&self) -> PathBuf {
        self.data_dir.join(CLEARANCE_CACHE_FILE)
    }

    /// Scraper settings derived from this configuration.
    ///
    /// The scraper checkout defaults to a `CF-Clearance-Scraper` directory
    /// next to the data directory.
    pub fn scraper_config(&self) -> ScraperConfig {
        let script_dir = self
            .scraper_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("..").join("CF-Clearance-Scraper"));
        ScraperConfig::new(self.scraper_program.clone(), script_dir, self.data_dir.clone())
    }
}
