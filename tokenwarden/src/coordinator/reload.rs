//! Browser and peer side effects of the coordinator.
//!
//! Everything here runs in tasks spawned by the actor; failures are logged
//! and never propagate back into the actor loop.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::messages::ActionReply;
use super::state::CoordinatorTimings;
use crate::browser::{
    BrowserError, CookieJar, SiteTarget, TabController, TabId, TabInfo, TabStatus,
    pick_target_tab,
};
use crate::peer::{SessionCookies, TokenPeer, TokenSubmission};

/// Query parameter appended when a hard reload has to be replaced by navigation.
const CACHE_BUST_PARAM: &str = "wplacer";

pub const MISSING_SESSION_COOKIE: &str = "Cookie 'j' not found. Are you logged in?";
pub const PEER_UNREACHABLE: &str = "Could not connect to the server.";
pub const CLEAR_DATA_FAILED: &str = "Failed to clear data.";

/// Collaborators shared by the coordinator's side-effect tasks.
pub struct RecoveryContext {
    pub tabs: Arc<dyn TabController>,
    pub cookies: Arc<dyn CookieJar>,
    pub peer: Arc<dyn TokenPeer>,
    pub site: SiteTarget,
    pub timings: CoordinatorTimings,
}

impl RecoveryContext {
    async fn site_tabs(&self) -> Result<Vec<TabInfo>, BrowserError> {
        self.tabs.query_tabs(&self.site.tab_pattern()).await
    }

    /// Prepare one tab and reload it so the page produces a fresh token.
    ///
    /// Falls back to a plain reload (or a new tab) when preparation fails.
    pub async fn prepare_and_reload(self: &Arc<Self>) {
        if let Err(e) = self.try_prepare_and_reload().await {
            warn!(error = %e, "Failed to prepare tab for token reload, falling back to direct reload");
            if let Err(e) = self.fallback_reload().await {
                warn!(error = %e, "Fallback reload failed");
            }
        }
    }

    async fn try_prepare_and_reload(self: &Arc<Self>) -> Result<TabId, BrowserError> {
        let mut tabs = self.site_tabs().await?;
        if tabs.is_empty() {
            warn!(site = %self.site.host(), "No site tabs found, opening a new one for token acquisition");
            tabs.push(self.tabs.create_tab(self.site.url()).await?);
        }
        let Some(target) = pick_target_tab(&tabs).cloned() else {
            return Err(BrowserError::Protocol("no tab to reload".to_string()));
        };

        info!(tab_id = target.id, "Preparing tab for token reload");
        if let Err(e) = self.tabs.inject_hook(target.id).await {
            debug!(tab_id = target.id, error = %e, "Hook injection failed");
        }
        tokio::time::sleep(self.timings.settle_delay).await;

        debug!(tab_id = target.id, "Sending reload request to tab");
        if let Err(e) = self.tabs.send_reload_request(target.id).await {
            debug!(tab_id = target.id, error = %e, "Tab did not accept reload request");
        }

        // Reload regardless of whether the page handled the request.
        let tab_id = target.id;
        let ctx = Arc::clone(self);
        tokio::spawn(async move { ctx.hard_reload(target).await });

        Ok(tab_id)
    }

    async fn hard_reload(&self, target: TabInfo) {
        tokio::time::sleep(self.timings.hard_reload_delay).await;

        if let Err(e) = self.tabs.activate(target.id).await {
            debug!(tab_id = target.id, error = %e, "Failed to activate tab");
        }
        if let Err(e) = self.tabs.reload(target.id, true).await {
            debug!(tab_id = target.id, error = %e, "Hard reload failed, navigating instead");
            let url = cache_busted_url(
                target.url.as_deref().unwrap_or(self.site.url()),
                chrono::Utc::now().timestamp_millis(),
            );
            if let Err(e) = self.tabs.navigate(target.id, &url).await {
                debug!(tab_id = target.id, error = %e, "Cache-busting navigation failed");
            }
        }

        tokio::time::sleep(self.timings.second_shot_delay).await;
        match self.tabs.get_tab(target.id).await {
            Ok(Some(tab)) if tab.status != Some(TabStatus::Loading) => {
                if let Err(e) = self.tabs.reload(target.id, true).await {
                    debug!(tab_id = target.id, error = %e, "Second reload failed");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(tab_id = target.id, error = %e, "Failed to query tab state"),
        }
    }

    async fn fallback_reload(&self) -> Result<(), BrowserError> {
        let tabs = self.site_tabs().await?;
        match pick_target_tab(&tabs) {
            Some(tab) => self.tabs.reload(tab.id, false).await,
            None => self.tabs.create_tab(self.site.url()).await.map(|_| ()),
        }
    }

    /// Inject the hook into every site tab and hard-reload it.
    ///
    /// Returns the number of tabs reloaded.
    pub async fn reload_all_site_tabs(&self) -> usize {
        let tabs = match self.site_tabs().await {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!(error = %e, "Failed to list site tabs");
                return 0;
            }
        };

        let mut reloaded = 0;
        for tab in tabs {
            if let Err(e) = self.tabs.inject_hook(tab.id).await {
                debug!(tab_id = tab.id, error = %e, "Hook injection failed");
            }
            match self.tabs.reload(tab.id, true).await {
                Ok(()) => reloaded += 1,
                Err(e) => warn!(tab_id = tab.id, error = %e, "Failed to reload tab"),
            }
        }
        reloaded
    }

    /// Forward the site's `j` and `cf_clearance` cookies to the peer.
    pub async fn send_cookie(&self) -> ActionReply {
        let url = self.site.origin();
        let (j, clearance) = tokio::join!(
            self.cookies.get_cookie(&url, "j"),
            self.cookies.get_cookie(&url, "cf_clearance"),
        );

        let j = match j {
            Ok(Some(cookie)) => cookie,
            Ok(None) => return ActionReply::failed(MISSING_SESSION_COOKIE),
            Err(e) => {
                warn!(error = %e, "Failed to read session cookie");
                return ActionReply::failed(MISSING_SESSION_COOKIE);
            }
        };
        let clearance = clearance.unwrap_or_else(|e| {
            debug!(error = %e, "Failed to read cf_clearance cookie");
            None
        });
        debug!(
            domain = %j.domain,
            has_clearance = clearance.is_some(),
            "Found session cookie"
        );

        let cookies = SessionCookies {
            j: j.value,
            cf_clearance: clearance.map(|c| c.value),
        };
        match self.peer.register_session(&cookies, j.expiration_date).await {
            Ok(info) => ActionReply::named(info.name),
            Err(e) => {
                debug!(error = %e, "Session bootstrap failed");
                ActionReply::failed(PEER_UNREACHABLE)
            }
        }
    }

    /// Clear the site's browsing data, then reload its tabs.
    pub async fn quick_logout(&self) -> ActionReply {
        let origins = [self.site.origin()];
        info!(origin = %origins[0], "Clearing browsing data");
        if let Err(e) = self.tabs.clear_site_data(&origins).await {
            warn!(error = %e, "Failed to clear browsing data");
            return ActionReply::failed(CLEAR_DATA_FAILED);
        }

        match self.site_tabs().await {
            Ok(tabs) => {
                for tab in tabs {
                    if let Err(e) = self.tabs.reload(tab.id, false).await {
                        debug!(tab_id = tab.id, error = %e, "Failed to reload tab after logout");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list site tabs after logout"),
        }
        ActionReply::ok()
    }

    /// Ask `tab_id` to sign the `t` field of `body`.
    pub async fn compute_signature(&self, tab_id: TabId, body: &str) {
        let turnstile = turnstile_of(body);
        if let Err(e) = self.tabs.compute_signature(tab_id, &turnstile).await {
            debug!(tab_id, error = %e, "Signature request failed");
        }
    }

    /// React to a site tab starting or finishing a load.
    pub async fn on_tab_updated(&self, tab_id: TabId, url: Option<&str>, status: Option<TabStatus>) {
        if !url.is_some_and(|u| self.site.matches(u)) {
            return;
        }
        match status {
            Some(TabStatus::Loading) => {
                if let Err(e) = self.tabs.inject_hook(tab_id).await {
                    debug!(tab_id, error = %e, "Early hook injection failed");
                }
            }
            Some(TabStatus::Complete) => {
                info!(tab_id, "Site tab loaded, sending cookie");
                if let Err(e) = self.tabs.inject_hook(tab_id).await {
                    debug!(tab_id, error = %e, "Hook injection failed");
                }
                let reply = self.send_cookie().await;
                info!(success = reply.success, "Cookie send status");
            }
            _ => {}
        }
    }

    /// Deliver a captured token to the peer.
    pub async fn submit_token(&self, submission: &TokenSubmission) {
        if let Err(e) = self.peer.submit_token(submission).await {
            debug!(error = %e, "Failed to deliver token");
        }
    }
}

/// `url` with a trailing `?`/`#` removed and `wplacer=<millis>` appended.
pub fn cache_busted_url(url: &str, millis: i64) -> String {
    let base = url
        .strip_suffix('?')
        .or_else(|| url.strip_suffix('#'))
        .unwrap_or(url);
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{CACHE_BUST_PARAM}={millis}")
}

/// The `t` field of a JSON body, or an empty string.
fn turnstile_of(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("t").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_busted_url() {
        assert_eq!(
            cache_busted_url("https://example.com/", 42),
            "https://example.com/?wplacer=42"
        );
        assert_eq!(
            cache_busted_url("https://example.com/?", 42),
            "https://example.com/?wplacer=42"
        );
        assert_eq!(
            cache_busted_url("https://example.com/?a=1", 7),
            "https://example.com/?a=1&wplacer=7"
        );
        assert_eq!(
            cache_busted_url("https://example.com/#", 7),
            "https://example.com/?wplacer=7"
        );
    }

    #[test]
    fn test_turnstile_extraction() {
        assert_eq!(turnstile_of(r#"{"t":"abc","colors":[0]}"#), "abc");
        assert_eq!(turnstile_of(r#"{"colors":[0]}"#), "");
        assert_eq!(turnstile_of("not json"), "");
    }
}
