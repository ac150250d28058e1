//! Messages accepted by the coordinator actor.

use serde::Serialize;
use tokio::sync::oneshot;

use super::state::{CycleId, RecoverySnapshot};
use crate::browser::{TabId, TabStatus};
use crate::config::Settings;
use crate::peer::TokenSubmission;

/// Which path noticed that the peer needs a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedSource {
    LongPoll,
    ShortPoll,
}

/// Reply to `sendCookie` and `quickLogout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            name: None,
            error: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::ok()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            name: None,
            error: Some(error.into()),
        }
    }
}

/// Messages that can be sent to the coordinator.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// The peer reported that a token is needed.
    TokenNeeded { source: NeedSource },
    /// The page hook captured a token.
    TokenCaptured(TokenSubmission),
    /// Forward the site's session cookies to the peer.
    SendCookie {
        reply: Option<oneshot::Sender<ActionReply>>,
    },
    /// New settings: restart polling and timers from zero.
    SettingsUpdated {
        settings: Settings,
        reply: Option<oneshot::Sender<()>>,
    },
    /// Wipe the site's browsing data and reload its tabs.
    QuickLogout {
        reply: Option<oneshot::Sender<ActionReply>>,
    },
    /// Ask a tab to sign the turnstile found in `body`.
    ComputeSignature { tab_id: TabId, body: String },
    /// A tab changed its URL or loading status.
    TabUpdated {
        tab_id: TabId,
        url: Option<String>,
        status: Option<TabStatus>,
    },
    /// The reload of recovery `cycle` was issued (sent by the reload task).
    ReloadIssued { cycle: CycleId },
    /// Query current state.
    GetState(oneshot::Sender<RecoverySnapshot>),
    /// Request graceful shutdown.
    Stop,
}
