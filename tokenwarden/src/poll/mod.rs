//! Polling the peer for "is a token needed".
//!
//! [`PollLoop`] keeps one long-held request open at a time and restarts it
//! forever, backing off 1 s after an HTTP error status and 2 s when the peer
//! is unreachable. [`short_poll`] is the independent, single-shot check run by
//! the coordinator's poll timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorHandle, NeedSource};
use crate::peer::TokenPeer;

/// Lower bound on one long-poll cycle, so a peer that answers immediately
/// cannot spin the loop.
pub const MIN_CYCLE: Duration = Duration::from_millis(250);

struct PollInner {
    peer: Arc<dyn TokenPeer>,
    coordinator: CoordinatorHandle,
    active: AtomicBool,
    /// Bumped on every start, under the `run_token` lock.
    generation: AtomicU64,
    run_token: Mutex<Option<CancellationToken>>,
    parent: CancellationToken,
}

/// Clears the active flag when the loop of `generation` exits, unless a newer
/// loop has been started since.
struct ActiveGuard {
    inner: Arc<PollInner>,
    generation: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut run_token = self.inner.run_token.lock();
        if self.inner.generation.load(Ordering::SeqCst) == self.generation {
            self.inner.active.store(false, Ordering::SeqCst);
            run_token.take();
        }
    }
}

/// The restartable long-poll loop. At most one loop runs at a time.
#[derive(Clone)]
pub struct PollLoop {
    inner: Arc<PollInner>,
}

impl PollLoop {
    pub fn new(
        peer: Arc<dyn TokenPeer>,
        coordinator: CoordinatorHandle,
        parent: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PollInner {
                peer,
                coordinator,
                active: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                run_token: Mutex::new(None),
                parent,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Start the loop unless one is already running.
    ///
    /// Returns `false` when a loop was already active.
    pub fn start(&self) -> bool {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return false;
        }

        let token = self.inner.parent.child_token();
        let generation = {
            let mut run_token = self.inner.run_token.lock();
            if let Some(previous) = run_token.replace(token.clone()) {
                previous.cancel();
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        info!("Starting long poll");
        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            generation,
        };
        tokio::spawn(async move { run(&guard.inner, token).await });
        true
    }

    /// Stop the running loop, abandoning any request in flight.
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some(token) = self.inner.run_token.lock().take() {
            debug!("Stopping long poll");
            token.cancel();
        }
    }
}

async fn run(inner: &PollInner, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = inner.peer.token_needed_long() => outcome,
        };

        match outcome {
            Ok(true) => {
                debug!("Peer needs a token");
                if inner
                    .coordinator
                    .token_needed(NeedSource::LongPoll)
                    .await
                    .is_err()
                {
                    warn!("Coordinator is gone, long poll exiting");
                    break;
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(error = %e, "Long poll failed");
                if sleep_or_cancel(e.retry_delay(), &cancel).await {
                    break;
                }
                continue;
            }
        }

        let elapsed = started.elapsed();
        if elapsed < MIN_CYCLE && sleep_or_cancel(MIN_CYCLE - elapsed, &cancel).await {
            break;
        }
    }
    debug!("Long poll loop exited");
}

/// Sleep for `delay`; returns `true` if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Ask the peer once (short request) and notify the coordinator if a token is
/// needed. Returns whether one was needed.
pub async fn short_poll(peer: &dyn TokenPeer, coordinator: &CoordinatorHandle) -> bool {
    debug!("Polling peer for token request");
    match peer.token_needed().await {
        Ok(true) => {
            info!("Peer requires a token");
            if let Err(e) = coordinator.token_needed(NeedSource::ShortPoll).await {
                warn!(error = %e, "Failed to notify coordinator");
            }
            true
        }
        Ok(false) => false,
        Err(e) => {
            debug!(error = %e, "Short poll failed");
            false
        }
    }
}
