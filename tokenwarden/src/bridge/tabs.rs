//! [`TabController`] and [`CookieJar`] backed by the connected browser agent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::protocol::{BridgeCommand, CommandFrame};
use crate::browser::{BrowserCookie, BrowserError, CookieJar, TabController, TabId, TabInfo};

/// How long a command may wait for the agent's reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound command queue depth per agent connection.
const COMMAND_QUEUE_CAPACITY: usize = 64;

type PendingReply = oneshot::Sender<Result<Value, BrowserError>>;

/// A request waiting for its reply, tagged with the connection it went out on.
struct PendingRequest {
    generation: u64,
    reply: PendingReply,
}

struct AgentLink {
    generation: u64,
    commands: mpsc::Sender<CommandFrame>,
}

struct BridgeInner {
    link: Mutex<Option<AgentLink>>,
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    request_timeout: Duration,
}

impl BridgeInner {
    /// Fail every request sent over connection `generation`.
    fn fail_pending(&self, generation: u64) {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.generation == generation)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request.reply.send(Err(BrowserError::Disconnected));
            }
        }
    }
}

/// Commands queued for one agent connection.
pub struct AgentSession {
    pub generation: u64,
    pub commands: mpsc::Receiver<CommandFrame>,
}

/// Removes a pending request when the caller gives up.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingRequest>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Request/response correlation over the single agent connection.
///
/// A newer connection replaces the current one; requests still waiting on
/// the old connection fail with [`BrowserError::Disconnected`].
#[derive(Clone)]
pub struct BridgeTabs {
    inner: Arc<BridgeInner>,
}

impl Default for BridgeTabs {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl BridgeTabs {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                link: Mutex::new(None),
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                request_timeout,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Register a new agent connection, replacing any previous one.
    pub fn attach(&self) -> AgentSession {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let previous = self.inner.link.lock().replace(AgentLink {
            generation,
            commands: tx,
        });
        if let Some(previous) = previous {
            info!(
                old = previous.generation,
                new = generation,
                "Browser agent replaced"
            );
            self.inner.fail_pending(previous.generation);
        }
        AgentSession {
            generation,
            commands: rx,
        }
    }

    /// Forget the connection `generation` if it is still the current one.
    pub fn detach(&self, generation: u64) {
        let mut link = self.inner.link.lock();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
            drop(link);
            self.inner.fail_pending(generation);
        }
    }

    /// Route an agent reply to the request waiting for it.
    pub fn resolve(&self, id: u64, ok: bool, result: Value, error: Option<String>) {
        let Some((_, request)) = self.inner.pending.remove(&id) else {
            debug!(id, "Reply for unknown or expired request");
            return;
        };
        let outcome = if ok {
            Ok(result)
        } else {
            Err(BrowserError::Rejected(
                error.unwrap_or_else(|| "unspecified error".to_string()),
            ))
        };
        let _ = request.reply.send(outcome);
    }

    async fn call(&self, command: BridgeCommand) -> Result<Value, BrowserError> {
        let (generation, sender) = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| (link.generation, link.commands.clone()))
            .ok_or(BrowserError::Disconnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let op = command.op();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            id,
            PendingRequest {
                generation,
                reply: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        if sender.send(CommandFrame { id, command }).await.is_err() {
            return Err(BrowserError::Disconnected);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrowserError::Disconnected),
            Err(_) => {
                debug!(id, op, "Browser agent did not answer");
                Err(BrowserError::Timeout)
            }
        }
    }

    async fn call_for<T: DeserializeOwned>(&self, command: BridgeCommand) -> Result<T, BrowserError> {
        let value = self.call(command).await?;
        serde_json::from_value(value).map_err(|e| BrowserError::Protocol(e.to_string()))
    }

    async fn call_unit(&self, command: BridgeCommand) -> Result<(), BrowserError> {
        self.call(command).await.map(|_| ())
    }
}

#[async_trait]
impl TabController for BridgeTabs {
    async fn query_tabs(&self, pattern: &str) -> Result<Vec<TabInfo>, BrowserError> {
        self.call_for(BridgeCommand::QueryTabs {
            pattern: pattern.to_string(),
        })
        .await
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo, BrowserError> {
        self.call_for(BridgeCommand::CreateTab {
            url: url.to_string(),
        })
        .await
    }

    async fn get_tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, BrowserError> {
        self.call_for(BridgeCommand::GetTab { tab_id }).await
    }

    async fn inject_hook(&self, tab_id: TabId) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::InjectHook { tab_id }).await
    }

    async fn send_reload_request(&self, tab_id: TabId) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::SendReloadRequest { tab_id })
            .await
    }

    async fn activate(&self, tab_id: TabId) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::Activate { tab_id }).await
    }

    async fn reload(&self, tab_id: TabId, bypass_cache: bool) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::Reload {
            tab_id,
            bypass_cache,
        })
        .await
    }

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::Navigate {
            tab_id,
            url: url.to_string(),
        })
        .await
    }

    async fn compute_signature(
        &self,
        tab_id: TabId,
        turnstile: &str,
    ) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::ComputeSignature {
            tab_id,
            turnstile: turnstile.to_string(),
        })
        .await
    }

    async fn clear_site_data(&self, origins: &[String]) -> Result<(), BrowserError> {
        self.call_unit(BridgeCommand::ClearSiteData {
            origins: origins.to_vec(),
        })
        .await
    }
}

#[async_trait]
impl CookieJar for BridgeTabs {
    async fn get_cookie(
        &self,
        url: &str,
        name: &str,
    ) -> Result<Option<BrowserCookie>, BrowserError> {
        self.call_for(BridgeCommand::GetCookie {
            url: url.to_string(),
            name: name.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_without_agent() {
        let tabs = BridgeTabs::default();
        assert!(!tabs.is_connected());
        assert_eq!(tabs.activate(1).await, Err(BrowserError::Disconnected));
        assert_eq!(tabs.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_reply_is_routed_to_caller() {
        let tabs = BridgeTabs::default();
        let mut session = tabs.attach();

        let agent = tabs.clone();
        let responder = tokio::spawn(async move {
            let frame = session.commands.recv().await.unwrap();
            assert_eq!(
                frame.command,
                BridgeCommand::QueryTabs {
                    pattern: "https://example.com/*".to_string()
                }
            );
            agent.resolve(
                frame.id,
                true,
                serde_json::json!([{"id": 5, "url": "https://example.com/", "active": true}]),
                None,
            );
        });

        let found = tabs.query_tabs("https://example.com/*").await.unwrap();
        responder.await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 5);
        assert_eq!(tabs.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_rejection_carries_agent_error() {
        let tabs = BridgeTabs::default();
        let mut session = tabs.attach();

        let agent = tabs.clone();
        tokio::spawn(async move {
            let frame = session.commands.recv().await.unwrap();
            agent.resolve(frame.id, false, Value::Null, Some("No tab".to_string()));
        });

        assert_eq!(
            tabs.reload(9, true).await,
            Err(BrowserError::Rejected("No tab".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let tabs = BridgeTabs::new(Duration::from_secs(15));
        let _session = tabs.attach();

        assert_eq!(tabs.inject_hook(1).await, Err(BrowserError::Timeout));
        assert_eq!(tabs.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_detach_fails_pending_requests() {
        let tabs = BridgeTabs::default();
        let mut session = tabs.attach();
        let generation = session.generation;

        let waiter = {
            let tabs = tabs.clone();
            tokio::spawn(async move { tabs.get_cookie("https://example.com/", "j").await })
        };
        session.commands.recv().await.unwrap();

        // A stale generation is ignored.
        tabs.detach(generation + 100);
        assert!(tabs.is_connected());

        tabs.detach(generation);
        assert!(!tabs.is_connected());
        assert_eq!(waiter.await.unwrap(), Err(BrowserError::Disconnected));
    }

    #[tokio::test]
    async fn test_replacement_only_fails_old_connection_requests() {
        let tabs = BridgeTabs::default();
        let mut first = tabs.attach();

        let old_waiter = {
            let tabs = tabs.clone();
            tokio::spawn(async move { tabs.activate(1).await })
        };
        first.commands.recv().await.unwrap();

        let mut second = tabs.attach();
        assert_eq!(old_waiter.await.unwrap(), Err(BrowserError::Disconnected));

        let new_waiter = {
            let tabs = tabs.clone();
            tokio::spawn(async move { tabs.activate(2).await })
        };
        let frame = second.commands.recv().await.unwrap();
        assert_eq!(tabs.pending_requests(), 1);

        // The old socket's teardown must not touch the new request.
        tabs.detach(first.generation);
        assert!(tabs.is_connected());
        assert_eq!(tabs.pending_requests(), 1);

        tabs.resolve(frame.id, true, Value::Null, None);
        assert_eq!(new_waiter.await.unwrap(), Ok(()));
    }
}
