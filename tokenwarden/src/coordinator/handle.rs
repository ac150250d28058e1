//! Handle for sending messages to the coordinator.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::messages::{ActionReply, CoordinatorMessage, NeedSource};
use super::state::RecoverySnapshot;
use crate::browser::{TabId, TabStatus};
use crate::config::Settings;
use crate::peer::TokenSubmission;

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default timeout for send operations when the mailbox is full.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The coordinator has stopped.
    Stopped,
    /// The mailbox is full.
    MailboxFull,
    /// The send operation timed out.
    Timeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Stopped => write!(f, "Coordinator has stopped"),
            SendError::MailboxFull => write!(f, "Mailbox is full"),
            SendError::Timeout => write!(f, "Send operation timed out"),
        }
    }
}

impl std::error::Error for SendError {}

/// Cloneable sender side of the coordinator mailbox.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancellation_token: CancellationToken,
}

impl CoordinatorHandle {
    pub fn new(
        sender: mpsc::Sender<CoordinatorMessage>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            sender,
            cancellation_token,
        }
    }

    /// Send a message, waiting up to [`DEFAULT_SEND_TIMEOUT`] for mailbox space.
    pub async fn send(&self, msg: CoordinatorMessage) -> Result<(), SendError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                match tokio::time::timeout(DEFAULT_SEND_TIMEOUT, self.sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(msg);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(SendError::Stopped),
                    Err(_) => Err(SendError::Timeout),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Stopped),
        }
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: CoordinatorMessage) -> Result<(), SendError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Stopped),
        }
    }

    pub async fn token_needed(&self, source: NeedSource) -> Result<(), SendError> {
        self.send(CoordinatorMessage::TokenNeeded { source }).await
    }

    pub async fn token_captured(&self, submission: TokenSubmission) -> Result<(), SendError> {
        self.send(CoordinatorMessage::TokenCaptured(submission)).await
    }

    pub async fn compute_signature(&self, tab_id: TabId, body: String) -> Result<(), SendError> {
        self.send(CoordinatorMessage::ComputeSignature { tab_id, body })
            .await
    }

    pub async fn tab_updated(
        &self,
        tab_id: TabId,
        url: Option<String>,
        status: Option<TabStatus>,
    ) -> Result<(), SendError> {
        self.send(CoordinatorMessage::TabUpdated {
            tab_id,
            url,
            status,
        })
        .await
    }

    /// Forward session cookies and wait for the outcome.
    pub async fn send_cookie(&self) -> Result<ActionReply, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::SendCookie { reply: Some(tx) })
            .await?;
        rx.await.map_err(|_| SendError::Stopped)
    }

    /// Apply new settings and wait until they took effect.
    pub async fn settings_updated(&self, settings: Settings) -> Result<(), SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::SettingsUpdated {
            settings,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| SendError::Stopped)
    }

    pub async fn quick_logout(&self) -> Result<ActionReply, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::QuickLogout { reply: Some(tx) })
            .await?;
        rx.await.map_err(|_| SendError::Stopped)
    }

    pub async fn get_state(&self) -> Result<RecoverySnapshot, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::GetState(tx)).await?;
        rx.await.map_err(|_| SendError::Stopped)
    }

    /// Ask the coordinator to stop after the current message.
    pub async fn stop(&self) -> Result<(), SendError> {
        self.send(CoordinatorMessage::Stop).await
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }
}
