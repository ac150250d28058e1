//! Token recovery coordinator.
//!
//! Decides when a browser tab has to be reloaded to regenerate a token,
//! keeps at most one recovery in flight, retries on timeout and forwards the
//! captured token to the peer.

mod actor;
mod handle;
mod messages;
mod reload;
mod state;

pub use actor::{Coordinator, CoordinatorConfig};
pub use handle::{CoordinatorHandle, DEFAULT_MAILBOX_CAPACITY, SendError};
pub use messages::{ActionReply, CoordinatorMessage, NeedSource};
pub use reload::{
    CLEAR_DATA_FAILED, MISSING_SESSION_COOKIE, PEER_UNREACHABLE, RecoveryContext,
    cache_busted_url,
};
pub use state::{
    CoordinatorTimings, CycleId, Expiry, FastRetry, RecoverySnapshot, RecoveryState, SkipReason,
};
