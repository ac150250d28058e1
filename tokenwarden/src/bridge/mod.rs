//! Local bridge to the browser-side agent.
//!
//! The agent (a browser extension) keeps one WebSocket open to `/bridge`. The
//! core sends it [`protocol::BridgeCommand`]s through [`BridgeTabs`], which is
//! the production [`TabController`](crate::browser::TabController) and
//! [`CookieJar`](crate::browser::CookieJar); the agent pushes page and tab
//! events back, which are forwarded to the coordinator.

mod protocol;
mod server;
mod tabs;

use std::net::SocketAddr;

use thiserror::Error;

pub use protocol::{AgentFrame, BridgeCommand, CommandFrame, EventReply, InboundEvent};
pub use server::{
    ApiError, BridgeState, ClearanceParams, SweepResponse, dispatch_event, router, serve, serve_on,
};
pub use tabs::{AgentSession, BridgeTabs, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("refusing to expose the bridge on non-loopback address {0}")]
    NotLoopback(SocketAddr),

    #[error("failed to bind bridge on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge server error: {0}")]
    Serve(#[source] std::io::Error),
}
