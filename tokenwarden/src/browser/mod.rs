//! Boundary to the browser that hosts the token-producing page.
//!
//! The core never drives a browser directly. It talks to a [`TabController`]
//! and a [`CookieJar`]; the production implementation is the WebSocket
//! bridge in [`crate::bridge`], tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Browser tab identifier.
pub type TabId = i64;

/// Loading state of a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
    #[serde(other)]
    Unknown,
}

/// A browser tab as reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub status: Option<TabStatus>,
}

/// A cookie read from the browser's jar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    /// Seconds since the epoch, as browsers report it.
    #[serde(default)]
    pub expiration_date: Option<f64>,
}

/// Failures reported by the browser collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("no browser agent connected")]
    Disconnected,

    #[error("browser agent did not answer in time")]
    Timeout,

    #[error("browser rejected the request: {0}")]
    Rejected(String),

    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// Tab enumeration, control and script injection.
#[async_trait]
pub trait TabController: Send + Sync {
    /// Tabs whose URL matches `pattern` (e.g. `https://example.com/*`).
    async fn query_tabs(&self, pattern: &str) -> Result<Vec<TabInfo>, BrowserError>;

    async fn create_tab(&self, url: &str) -> Result<TabInfo, BrowserError>;

    async fn get_tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, BrowserError>;

    /// Install the network-interception hook into the page (idempotent in-page).
    async fn inject_hook(&self, tab_id: TabId) -> Result<(), BrowserError>;

    /// Ask the page's content script to reload itself for a token.
    async fn send_reload_request(&self, tab_id: TabId) -> Result<(), BrowserError>;

    async fn activate(&self, tab_id: TabId) -> Result<(), BrowserError>;

    async fn reload(&self, tab_id: TabId, bypass_cache: bool) -> Result<(), BrowserError>;

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<(), BrowserError>;

    /// Run the page's opaque signing function over `turnstile`. The signature
    /// comes back asynchronously as a captured token.
    async fn compute_signature(&self, tab_id: TabId, turnstile: &str)
    -> Result<(), BrowserError>;

    /// Wipe cache, cookies and storage for `origins`.
    async fn clear_site_data(&self, origins: &[String]) -> Result<(), BrowserError>;
}

/// Read access to the browser's cookie jar.
#[async_trait]
pub trait CookieJar: Send + Sync {
    async fn get_cookie(&self, url: &str, name: &str)
    -> Result<Option<BrowserCookie>, BrowserError>;
}

/// The site whose tabs produce tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTarget {
    url: Url,
}

impl SiteTarget {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Landing URL used when a tab must be created.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// `scheme://host[:port]/`
    pub fn origin(&self) -> String {
        format!("{}/", self.url.origin().ascii_serialization())
    }

    /// Match pattern for tab queries.
    pub fn tab_pattern(&self) -> String {
        format!("{}*", self.origin())
    }

    /// Whether `url` belongs to this site.
    pub fn matches(&self, url: &str) -> bool {
        url.starts_with(&self.url.origin().ascii_serialization())
    }
}

/// Prefer the active tab, else the first one.
pub fn pick_target_tab(tabs: &[TabInfo]) -> Option<&TabInfo> {
    tabs.iter().find(|t| t.active).or_else(|| tabs.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: TabId, active: bool) -> TabInfo {
        TabInfo {
            id,
            url: Some("https://example.com/".to_string()),
            active,
            status: None,
        }
    }

    #[test]
    fn test_pick_prefers_active_tab() {
        let tabs = vec![tab(1, false), tab(2, true), tab(3, false)];
        assert_eq!(pick_target_tab(&tabs).map(|t| t.id), Some(2));
    }

    #[test]
    fn test_pick_falls_back_to_first_tab() {
        let tabs = vec![tab(7, false), tab(8, false)];
        assert_eq!(pick_target_tab(&tabs).map(|t| t.id), Some(7));
        assert!(pick_target_tab(&[]).is_none());
    }

    #[test]
    fn test_site_target_patterns() {
        let site = SiteTarget::new(Url::parse("https://example.com/").unwrap());
        assert_eq!(site.origin(), "https://example.com/");
        assert_eq!(site.tab_pattern(), "https://example.com/*");
        assert!(site.matches("https://example.com/?x=1"));
        assert!(!site.matches("https://other.org/"));
    }

    #[test]
    fn test_tab_status_tolerates_unknown_values() {
        let tab: TabInfo =
            serde_json::from_str(r#"{"id": 4, "status": "unloaded", "active": true}"#).unwrap();
        assert_eq!(tab.status, Some(TabStatus::Unknown));
        assert!(tab.url.is_none());
    }
}
