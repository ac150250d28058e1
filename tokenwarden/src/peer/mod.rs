//! Client for the remote peer that consumes tokens and session cookies.
//!
//! Wire contract (JSON over HTTP):
//! - `GET /token-needed/long` → `{needed}` (long-held)
//! - `GET /token-needed` → `{needed}`
//! - `POST /user` `{cookies: {j, cf_clearance?}, expirationDate}` → `{name}`
//! - `POST /t` `{t, pawtect, fp}` (response ignored)

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::utils::http_client::build_peer_client;

/// Upper bound for the long-held poll request.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for ordinary peer requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff after the peer answered with a non-success status.
pub const STATUS_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff after the peer could not be reached or answered garbage.
pub const TRANSPORT_BACKOFF: Duration = Duration::from_secs(2);

/// Errors talking to the remote peer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Peer unreachable (connection refused, reset, timeout).
    #[error("peer unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    /// Peer answered with a non-success status.
    #[error("peer responded with status {0}")]
    Status(StatusCode),

    /// Peer answered with a body we could not decode.
    #[error("invalid peer response: {0}")]
    Decode(String),
}

impl PeerError {
    /// Whether the failure happened below HTTP (no usable response).
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Status(_))
    }

    /// Delay before the poll loop tries again after this failure.
    pub fn retry_delay(&self) -> Duration {
        if self.is_transport() {
            TRANSPORT_BACKOFF
        } else {
            STATUS_BACKOFF
        }
    }
}

/// A recovered token as delivered to `POST /t`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSubmission {
    pub t: String,
    pub pawtect: Option<String>,
    pub fp: Option<String>,
}

/// Session cookies forwarded to `POST /user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookies {
    pub j: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cf_clearance: Option<String>,
}

/// Peer's answer to a session bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TokenNeededResponse {
    #[serde(default)]
    needed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBootstrap<'a> {
    cookies: &'a SessionCookies,
    expiration_date: Option<f64>,
}

/// Operations the core performs against the remote peer.
#[async_trait]
pub trait TokenPeer: Send + Sync {
    /// Long-held "is a token needed" query.
    async fn token_needed_long(&self) -> Result<bool, PeerError>;

    /// Short "is a token needed" query.
    async fn token_needed(&self) -> Result<bool, PeerError>;

    /// Bootstrap a session with the site's cookies.
    async fn register_session(
        &self,
        cookies: &SessionCookies,
        expiration_date: Option<f64>,
    ) -> Result<SessionInfo, PeerError>;

    /// Deliver a recovered token.
    async fn submit_token(&self, submission: &TokenSubmission) -> Result<(), PeerError>;

    /// Point the client at a new peer address.
    fn update_settings(&self, _settings: &Settings) {}
}

/// `reqwest`-backed [`TokenPeer`].
pub struct HttpPeer {
    client: reqwest::Client,
    base_url: RwLock<String>,
}

impl HttpPeer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: build_peer_client(CONNECT_TIMEOUT),
            base_url: RwLock::new(settings.peer_base_url()),
        }
    }

    /// Current base URL (no trailing slash).
    pub fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.read(), path)
    }

    async fn query_needed(&self, path: &str, timeout: Duration) -> Result<bool, PeerError> {
        let response = self
            .client
            .get(self.url(path))
            .header(header::CACHE_CONTROL, "no-store")
            .timeout(timeout)
            .send()
            .await
            .map_err(PeerError::Transport)?;

        let response = check_status(response)?;
        let body: TokenNeededResponse = response
            .json()
            .await
            .map_err(|e| PeerError::Decode(e.to_string()))?;
        Ok(body.needed)
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PeerError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(PeerError::Status(status))
    }
}

#[async_trait]
impl TokenPeer for HttpPeer {
    async fn token_needed_long(&self) -> Result<bool, PeerError> {
        self.query_needed("/token-needed/long", LONG_POLL_TIMEOUT)
            .await
    }

    async fn token_needed(&self) -> Result<bool, PeerError> {
        self.query_needed("/token-needed", REQUEST_TIMEOUT).await
    }

    async fn register_session(
        &self,
        cookies: &SessionCookies,
        expiration_date: Option<f64>,
    ) -> Result<SessionInfo, PeerError> {
        let response = self
            .client
            .post(self.url("/user"))
            .timeout(REQUEST_TIMEOUT)
            .json(&SessionBootstrap {
                cookies,
                expiration_date,
            })
            .send()
            .await
            .map_err(PeerError::Transport)?;

        check_status(response)?
            .json()
            .await
            .map_err(|e| PeerError::Decode(e.to_string()))
    }

    async fn submit_token(&self, submission: &TokenSubmission) -> Result<(), PeerError> {
        self.client
            .post(self.url("/t"))
            .timeout(REQUEST_TIMEOUT)
            .json(submission)
            .send()
            .await
            .map_err(PeerError::Transport)?;
        Ok(())
    }

    fn update_settings(&self, settings: &Settings) {
        *self.base_url.write() = settings.peer_base_url();
    }
}
