//! JSON frames exchanged with the browser agent.
//!
//! core → agent: [`CommandFrame`] (`{"id": 3, "command": {"op": "reload", ...}}`)
//! and [`EventReply`] (`{"reply_to": 9, "result": {...}}`).
//!
//! agent → core: [`AgentFrame`], either a reply to a command
//! (`{"id": 3, "ok": true, "result": ...}`) or an inbound event
//! (`{"id": 9, "event": {"type": "sendCookie"}}`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::{TabId, TabStatus};
use crate::config::Settings;

/// Operations the core asks the agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeCommand {
    QueryTabs { pattern: String },
    CreateTab { url: String },
    GetTab { tab_id: TabId },
    InjectHook { tab_id: TabId },
    SendReloadRequest { tab_id: TabId },
    Activate { tab_id: TabId },
    Reload { tab_id: TabId, bypass_cache: bool },
    Navigate { tab_id: TabId, url: String },
    ComputeSignature { tab_id: TabId, turnstile: String },
    ClearSiteData { origins: Vec<String> },
    GetCookie { url: String, name: String },
}

impl BridgeCommand {
    pub fn op(&self) -> &'static str {
        match self {
            Self::QueryTabs { .. } => "query_tabs",
            Self::CreateTab { .. } => "create_tab",
            Self::GetTab { .. } => "get_tab",
            Self::InjectHook { .. } => "inject_hook",
            Self::SendReloadRequest { .. } => "send_reload_request",
            Self::Activate { .. } => "activate",
            Self::Reload { .. } => "reload",
            Self::Navigate { .. } => "navigate",
            Self::ComputeSignature { .. } => "compute_signature",
            Self::ClearSiteData { .. } => "clear_site_data",
            Self::GetCookie { .. } => "get_cookie",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub id: u64,
    pub command: BridgeCommand,
}

/// Messages the page and the agent deliver to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "SEND_TOKEN")]
    SendToken {
        token: String,
        #[serde(default)]
        pawtect: Option<String>,
        #[serde(default)]
        fp: Option<String>,
    },
    #[serde(rename = "sendCookie")]
    SendCookie,
    #[serde(rename = "settingsUpdated")]
    SettingsUpdated {
        #[serde(default)]
        settings: Settings,
    },
    #[serde(rename = "quickLogout")]
    QuickLogout,
    #[serde(rename = "computeSignature")]
    ComputeSignature { tab_id: TabId, body: String },
    #[serde(rename = "tabUpdated")]
    TabUpdated {
        tab_id: TabId,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        status: Option<TabStatus>,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendToken { .. } => "SEND_TOKEN",
            Self::SendCookie => "sendCookie",
            Self::SettingsUpdated { .. } => "settingsUpdated",
            Self::QuickLogout => "quickLogout",
            Self::ComputeSignature { .. } => "computeSignature",
            Self::TabUpdated { .. } => "tabUpdated",
        }
    }
}

/// A frame received from the agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AgentFrame {
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: InboundEvent,
    },
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Answer to an inbound event that carried an id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReply {
    pub reply_to: u64,
    pub result: Value,
}
