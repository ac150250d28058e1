//! Clearance cache persistence and expiry, with a counting fake broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;
use url::Url;

use tokenwarden::clearance::{
    AcquiredClearance, AcquisitionBroker, BrokerError, CacheKey, ClearanceCache, ClearanceEntry,
    ClearanceError, ClearanceStats, ClearanceStore, EgressPath,
};

#[derive(Default)]
struct CountingBroker {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl AcquisitionBroker for CountingBroker {
    async fn acquire(
        &self,
        egress: Option<&EgressPath>,
        _target: &Url,
    ) -> Result<AcquiredClearance, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(BrokerError::UnparsableOutput);
        }
        let via = egress.map_or_else(|| "direct".to_string(), |p| p.key_part());
        Ok(AcquiredClearance {
            cf_clearance: format!("clearance-{n}-{via}"),
            user_agent: "Mozilla/5.0 Test".to_string(),
            cookies: BTreeMap::from([("__cf_bm".to_string(), "bm".to_string())]),
        })
    }
}

fn target() -> Url {
    Url::parse("https://backend.example.com").unwrap()
}

fn store(dir: &TempDir) -> ClearanceStore {
    ClearanceStore::new(dir.path().join("cf_clearance_cache.json"))
}

fn entry_expiring_in(delta: Duration) -> ClearanceEntry {
    let now = Utc::now();
    ClearanceEntry {
        cf_clearance: "injected".to_string(),
        user_agent: "UA".to_string(),
        expires: now + delta,
        cookies: BTreeMap::new(),
        obtained_at: now - Duration::hours(1),
    }
}

#[tokio::test]
async fn cache_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(CountingBroker::default());
    let proxy = EgressPath::parse("http://u:p@10.0.0.1:8080").unwrap();

    let first = {
        let cache = ClearanceCache::open(store(&dir), broker.clone()).await;
        cache
            .get_or_acquire(Some(&proxy), Some("42"), &target())
            .await
            .unwrap()
    };
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);

    let reopened = ClearanceCache::open(store(&dir), broker.clone()).await;
    assert_eq!(reopened.len(), 1);
    let again = reopened
        .get_or_acquire(Some(&proxy), Some("42"), &target())
        .await
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);

    // A different identity on the same proxy is a different key.
    reopened
        .get_or_acquire(Some(&proxy), Some("43"), &target())
        .await
        .unwrap();
    assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn snapshot_uses_documented_field_names() {
    let dir = TempDir::new().unwrap();
    let cache = ClearanceCache::open(store(&dir), Arc::new(CountingBroker::default())).await;
    cache.get_or_acquire(None, None, &target()).await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("cf_clearance_cache.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let record = &json["direct:anonymous"];
    assert_eq!(record["cf_clearance"], "clearance-1-direct");
    assert_eq!(record["userAgent"], "Mozilla/5.0 Test");
    assert!(record["expires"].is_i64());
    assert!(record["obtainedAt"].is_string());
    assert_eq!(record["cookies"]["__cf_bm"], "bm");
}

#[tokio::test]
async fn expired_records_are_dropped_on_load() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();
    let snapshot = serde_json::json!({
        "direct:alive": {
            "cf_clearance": "a",
            "userAgent": "UA",
            "expires": (now + Duration::hours(3)).timestamp_millis(),
            "cookies": {},
            "obtainedAt": now.to_rfc3339(),
        },
        "direct:stale": {
            "cf_clearance": "b",
            "userAgent": "UA",
            "expires": (now - Duration::minutes(1)).timestamp_millis(),
            "cookies": {},
            "obtainedAt": now.to_rfc3339(),
        },
        "direct:garbage": {"cf_clearance": 7},
    });
    std::fs::write(
        dir.path().join("cf_clearance_cache.json"),
        serde_json::to_vec(&snapshot).unwrap(),
    )
    .unwrap();

    let cache = ClearanceCache::open(store(&dir), Arc::new(CountingBroker::default())).await;
    assert_eq!(cache.len(), 1);
    assert!(cache.lookup(&CacheKey::from("direct:alive".to_string())).is_some());
    assert!(cache.lookup(&CacheKey::from("direct:stale".to_string())).is_none());
}

#[tokio::test]
async fn corrupt_snapshot_starts_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("cf_clearance_cache.json"), "{not json").unwrap();

    let cache = ClearanceCache::open(store(&dir), Arc::new(CountingBroker::default())).await;
    assert!(cache.is_empty());
}

#[tokio::test]
async fn expired_entry_is_never_returned() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(CountingBroker::default());
    let cache = ClearanceCache::new(store(&dir), broker.clone());
    let key = CacheKey::new(None, Some("7"));

    cache
        .insert(key.clone(), entry_expiring_in(Duration::milliseconds(-1)))
        .await
        .unwrap();
    assert!(cache.lookup(&key).is_none());

    let entry = cache.get_or_acquire(None, Some("7"), &target()).await.unwrap();
    assert_ne!(entry.cf_clearance, "injected");
    assert!(entry.expires > Utc::now());
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn force_refresh_replaces_entry() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(CountingBroker::default());
    let cache = ClearanceCache::new(store(&dir), broker.clone());
    let key = CacheKey::new(None, None);

    let injected = entry_expiring_in(Duration::hours(10));
    cache.insert(key.clone(), injected.clone()).await.unwrap();
    assert_eq!(
        cache.get_or_acquire(None, None, &target()).await.unwrap(),
        injected
    );
    assert_eq!(broker.calls.load(Ordering::SeqCst), 0);

    let fresh = cache.force_refresh(None, None, &target()).await.unwrap();
    assert_ne!(fresh, injected);
    assert!(fresh.obtained_at > injected.obtained_at);
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.lookup(&key), Some(fresh));
}

#[tokio::test]
async fn failures_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(CountingBroker {
        fail: true,
        ..Default::default()
    });
    let cache = ClearanceCache::new(store(&dir), broker.clone());

    for _ in 0..2 {
        let err = cache
            .get_or_acquire(None, None, &target())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClearanceError::Acquisition(BrokerError::UnparsableOutput)
        ));
    }
    assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
    assert!(!dir.path().join("cf_clearance_cache.json").exists());
}

#[tokio::test]
async fn sweep_removes_expired_and_rewrites_snapshot() {
    let dir = TempDir::new().unwrap();
    let cache = ClearanceCache::new(store(&dir), Arc::new(CountingBroker::default()));

    cache
        .insert(
            CacheKey::from("direct:old".to_string()),
            entry_expiring_in(Duration::hours(5)),
        )
        .await
        .unwrap();
    cache
        .insert(
            CacheKey::from("direct:soon".to_string()),
            entry_expiring_in(Duration::minutes(30)),
        )
        .await
        .unwrap();
    cache
        .insert(
            CacheKey::from("direct:gone".to_string()),
            entry_expiring_in(Duration::seconds(-5)),
        )
        .await
        .unwrap();

    assert_eq!(
        cache.stats(),
        ClearanceStats {
            total: 3,
            expiring_soon: 2,
        }
    );

    assert_eq!(cache.sweep_expired().await.unwrap(), 1);
    assert_eq!(cache.sweep_expired().await.unwrap(), 0);
    assert_eq!(
        cache.stats(),
        ClearanceStats {
            total: 2,
            expiring_soon: 1,
        }
    );

    let raw = std::fs::read_to_string(dir.path().join("cf_clearance_cache.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["direct:old".to_string(), "direct:soon".to_string()]);
}

#[tokio::test]
async fn failed_force_refresh_does_not_resurrect_entry() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(CountingBroker {
        fail: true,
        ..Default::default()
    });
    let cache = ClearanceCache::new(store(&dir), broker.clone());
    let key = CacheKey::new(None, None);
    cache
        .insert(key.clone(), entry_expiring_in(Duration::hours(10)))
        .await
        .unwrap();

    assert!(cache.force_refresh(None, None, &target()).await.is_err());
    assert!(cache.lookup(&key).is_none());

    let reopened = ClearanceCache::open(store(&dir), broker).await;
    assert!(reopened.is_empty());
}
