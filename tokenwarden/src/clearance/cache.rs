//! Clearance cache implementation.
//!
//! Entries are keyed by egress path + identity, expire after 23 hours and are
//! mirrored to disk after every mutation. Misses are filled through an
//! [`AcquisitionBroker`]; concurrent misses for the same key share a single
//! broker call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::broker::AcquisitionBroker;
use super::error::ClearanceError;
use super::store::ClearanceStore;
use super::types::{CacheKey, ClearanceEntry, ClearanceStats, EXPIRING_SOON_WINDOW, EgressPath};

#[derive(Debug, Clone)]
enum FlightFailure {
    Failed(String),
    Cancelled,
}

type InFlightResult = std::result::Result<ClearanceEntry, FlightFailure>;

/// Shared outcome of one broker call.
///
/// The first caller for a key runs the acquisition; later callers wait on
/// this state until the result is published.
struct InFlightState {
    result: OnceCell<InFlightResult>,
    notify: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: InFlightResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> InFlightResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

type InFlightRequest = Arc<InFlightState>;

/// Publishes the leader's outcome; a leader dropped mid-acquisition wakes its
/// waiters with a cancellation.
struct FlightGuard<'a> {
    cache: &'a ClearanceCache,
    key: CacheKey,
    request: InFlightRequest,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, result: InFlightResult) {
        self.cache.finish_in_flight(&self.key, &self.request, result);
        self.finished = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache
                .finish_in_flight(&self.key, &self.request, Err(FlightFailure::Cancelled));
        }
    }
}

/// Persisted, TTL-bound clearance cache.
pub struct ClearanceCache {
    entries: DashMap<CacheKey, ClearanceEntry>,
    in_flight: DashMap<CacheKey, InFlightRequest>,
    broker: Arc<dyn AcquisitionBroker>,
    store: ClearanceStore,
    /// Serializes snapshot writes.
    persist_lock: Mutex<()>,
}

impl ClearanceCache {
    /// Create an empty cache that persists to `store`.
    pub fn new(store: ClearanceStore, broker: Arc<dyn AcquisitionBroker>) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            broker,
            store,
            persist_lock: Mutex::new(()),
        }
    }

    /// Create a cache seeded from the snapshot on disk.
    ///
    /// An unreadable snapshot is logged and treated as empty.
    pub async fn open(store: ClearanceStore, broker: Arc<dyn AcquisitionBroker>) -> Self {
        let cache = Self::new(store, broker);
        match cache.store.load(Utc::now()).await {
            Ok(loaded) => {
                for (key, entry) in loaded {
                    cache.entries.insert(CacheKey::from(key), entry);
                }
            }
            Err(e) => warn!(
                path = %cache.store.path().display(),
                error = %e,
                "Failed to load clearance snapshot"
            ),
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Valid entry for `key`, purging it if it has expired.
    pub fn lookup(&self, key: &CacheKey) -> Option<ClearanceEntry> {
        let now = Utc::now();
        {
            let entry = self.entries.get(key)?;
            if entry.is_valid_at(now) {
                return Some(entry.clone());
            }
        }

        if self
            .entries
            .remove_if(key, |_, entry| !entry.is_valid_at(now))
            .is_some()
        {
            debug!(key = %key, "Cached clearance expired");
        }
        None
    }

    /// Cached clearance for the pair, acquiring a fresh one on a miss.
    ///
    /// Failures are not cached; the next call retries from scratch.
    pub async fn get_or_acquire(
        &self,
        egress: Option<&EgressPath>,
        identity: Option<&str>,
        target: &Url,
    ) -> Result<ClearanceEntry, ClearanceError> {
        let key = CacheKey::new(egress, identity);
        if let Some(entry) = self.lookup(&key) {
            debug!(key = %key, "Using cached clearance");
            return Ok(entry);
        }

        let (request, is_new) = self.get_or_create_in_flight(&key);
        if !is_new {
            debug!(key = %key, "Joining in-flight clearance acquisition");
            return match request.wait().await {
                Ok(entry) => Ok(entry),
                Err(FlightFailure::Failed(message)) => Err(ClearanceError::Shared(message)),
                Err(FlightFailure::Cancelled) => Err(ClearanceError::Cancelled),
            };
        }

        let guard = FlightGuard {
            cache: self,
            key: key.clone(),
            request,
            finished: false,
        };

        // A flight that finished between the lookup and our registration.
        if let Some(entry) = self.lookup(&key) {
            guard.finish(Ok(entry.clone()));
            return Ok(entry);
        }

        info!(
            key = %key,
            proxy = %egress.map_or_else(|| "direct".to_string(), |p| p.to_string()),
            "Obtaining new clearance"
        );

        match self.broker.acquire(egress, target).await {
            Ok(acquired) => {
                let entry = ClearanceEntry::from_acquired(acquired, Utc::now());
                self.entries.insert(key.clone(), entry.clone());
                if let Err(e) = self.persist().await {
                    warn!(error = %e, "Failed to persist clearance cache");
                }
                info!(key = %key, expires = %entry.expires, "Obtained clearance");
                guard.finish(Ok(entry.clone()));
                Ok(entry)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to obtain clearance");
                guard.finish(Err(FlightFailure::Failed(e.to_string())));
                Err(e.into())
            }
        }
    }

    /// Drop any entry for the pair, then acquire a fresh one.
    pub async fn force_refresh(
        &self,
        egress: Option<&EgressPath>,
        identity: Option<&str>,
        target: &Url,
    ) -> Result<ClearanceEntry, ClearanceError> {
        let key = CacheKey::new(egress, identity);
        info!(key = %key, "Force refreshing clearance");
        if self.entries.remove(&key).is_some()
            && let Err(e) = self.persist().await
        {
            warn!(key = %key, error = %e, "Failed to persist clearance cache");
        }
        self.get_or_acquire(egress, identity, target).await
    }

    /// Insert an entry directly and persist.
    pub async fn insert(&self, key: CacheKey, entry: ClearanceEntry) -> Result<(), ClearanceError> {
        self.entries.insert(key, entry);
        self.persist().await
    }

    /// Remove expired entries; rewrites the snapshot only if something was removed.
    pub async fn sweep_expired(&self) -> Result<usize, ClearanceError> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid_at(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            info!(count = removed, "Cleaned up expired clearances");
            self.persist().await?;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> ClearanceStats {
        let now = Utc::now();
        let expiring_soon = self
            .entries
            .iter()
            .filter(|entry| entry.expires_within(now, EXPIRING_SOON_WINDOW))
            .count();
        ClearanceStats {
            total: self.entries.len(),
            expiring_soon,
        }
    }

    /// Run [`Self::sweep_expired`] every `interval` until cancelled.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Clearance sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.sweep_expired().await {
                            warn!(error = %e, "Clearance sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn persist(&self) -> Result<(), ClearanceError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<(CacheKey, ClearanceEntry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        self.store
            .save(
                snapshot.iter().map(|(key, entry)| (key.as_str(), entry)),
                Utc::now(),
            )
            .await
            .map(|_| ())
            .map_err(ClearanceError::Persist)
    }

    // ========== Request Deduplication ==========

    fn get_or_create_in_flight(&self, key: &CacheKey) -> (InFlightRequest, bool) {
        if let Some(existing) = self.in_flight.get(key) {
            return (existing.clone(), false);
        }

        let request = Arc::new(InFlightState::new());
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                entry.insert(request.clone());
                (request, true)
            }
        }
    }

    fn finish_in_flight(&self, key: &CacheKey, request: &InFlightRequest, result: InFlightResult) {
        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, request));
        request.set_result(result);
    }
}
