use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fm_context::{
    ActiveCache, ArchiveStore, ContextError, ContextSnapshot, ContextStore, ContextTier, FsArchive,
    MemoryCache, RecentStore, Result, SqliteRecentStore,
};
use fm_core::config::ContextConfig;
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

struct CountingRecent {
    inner: SqliteRecentStore,
    calls: AtomicUsize,
}

impl CountingRecent {
    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecentStore for CountingRecent {
    async fn next_version(&self, agent_id: Uuid) -> Result<u64> {
        self.hit();
        self.inner.next_version(agent_id).await
    }
    async fn insert(&self, snapshot: &ContextSnapshot) -> Result<()> {
        self.hit();
        self.inner.insert(snapshot).await
    }
    async fn latest(&self, agent_id: Uuid) -> Result<Option<ContextSnapshot>> {
        self.hit();
        self.inner.latest(agent_id).await
    }
    async fn payload_rows_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContextSnapshot>> {
        self.hit();
        self.inner.payload_rows_before(cutoff).await
    }
    async fn mark_archived(&self, id: Uuid, location: &str) -> Result<()> {
        self.hit();
        self.inner.mark_archived(id, location).await
    }
    async fn restore_payload(&self, id: Uuid, payload: &[u8]) -> Result<()> {
        self.hit();
        self.inner.restore_payload(id, payload).await
    }
    async fn delete_agent(&self, agent_id: Uuid) -> Result<usize> {
        self.hit();
        self.inner.delete_agent(agent_id).await
    }
    async fn count(&self, agent_id: Uuid) -> Result<usize> {
        self.hit();
        self.inner.count(agent_id).await
    }
}

struct CountingArchive {
    inner: FsArchive,
    calls: AtomicUsize,
}

#[async_trait]
impl ArchiveStore for CountingArchive {
    async fn put(&self, t: &str, a: Uuid, v: u64, bytes: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.put(t, a, v, bytes).await
    }
    async fn get(&self, location: &str) -> Result<Option<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(location).await
    }
    async fn latest(&self, t: &str, a: Uuid) -> Result<Option<(u64, String)>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.latest(t, a).await
    }
    async fn delete_agent(&self, t: &str, a: Uuid) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_agent(t, a).await
    }
    async fn count(&self, t: &str, a: Uuid) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.count(t, a).await
    }
}

/// Cache that is always down.
struct DownCache;

#[async_trait]
impl ActiveCache for DownCache {
    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
        Err(ContextError::Cache("connection refused".into()))
    }
    async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<()> {
        Err(ContextError::Cache("connection refused".into()))
    }
    async fn delete(&self, _: &str) -> Result<bool> {
        Err(ContextError::Cache("connection refused".into()))
    }
    async fn ping(&self) -> Result<()> {
        Err(ContextError::Cache("connection refused".into()))
    }
}

struct Harness {
    store: ContextStore,
    recent: Arc<CountingRecent>,
    archive: Arc<CountingArchive>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn reset_counts(&self) {
        self.recent.calls.store(0, Ordering::SeqCst);
        self.archive.calls.store(0, Ordering::SeqCst);
    }
}

async fn harness_with(active: Arc<dyn ActiveCache>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let recent = Arc::new(CountingRecent {
        inner: SqliteRecentStore::open_in_memory().await.unwrap(),
        calls: AtomicUsize::new(0),
    });
    let archive = Arc::new(CountingArchive {
        inner: FsArchive::new(dir.path()),
        calls: AtomicUsize::new(0),
    });
    let store = ContextStore::new(
        active,
        recent.clone(),
        archive.clone(),
        &ContextConfig::default(),
    );
    Harness {
        store,
        recent,
        archive,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryCache::new(64))).await
}

/// A JSON string value whose serialized form is exactly `size` bytes.
fn payload_of_size(size: usize) -> serde_json::Value {
    serde_json::Value::String("a".repeat(size - 2))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn active_hit_never_touches_lower_tiers() {
    let h = harness().await;
    let agent = Uuid::new_v4();
    let ctx = json!({"plan": ["story-1", "story-2"], "step": 3});
    assert_eq!(
        h.store.save_context(agent, "acme", &ctx).await.unwrap(),
        ContextTier::Active
    );
    h.reset_counts();

    let hit = h.store.recover_context(agent, "acme").await.unwrap().unwrap();

    assert_eq!(hit.tier, ContextTier::Active);
    assert_eq!(hit.context, ctx);
    assert_eq!(h.recent.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.archive.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tier_boundaries_route_saves() {
    let h = harness().await;

    let exact_active = payload_of_size(1_048_576);
    let just_recent = payload_of_size(1_048_577);
    let just_archived = payload_of_size(10 * 1024 * 1024 + 1);

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();
    assert_eq!(
        h.store.save_context(a, "acme", &exact_active).await.unwrap(),
        ContextTier::Active
    );
    assert_eq!(
        h.store.save_context(b, "acme", &just_recent).await.unwrap(),
        ContextTier::Recent
    );
    assert_eq!(
        h.store.save_context(c, "acme", &just_archived).await.unwrap(),
        ContextTier::Archived
    );

    let row = h.recent.inner.latest(c).await.unwrap().unwrap();
    assert!(row.payload.is_none());
    assert_eq!(row.size_bytes, 10 * 1024 * 1024 + 1);
}

#[tokio::test]
async fn round_trip_is_byte_identical_in_every_tier() {
    let h = harness().await;
    let cases = [
        json!({"nested": {"b": 2, "a": [1, 2.5, null, true]}, "s": "ünïcødé"}),
        payload_of_size(2 * 1024 * 1024),
        payload_of_size(11 * 1024 * 1024),
    ];

    for ctx in cases {
        let agent = Uuid::new_v4();
        h.store.save_context(agent, "acme", &ctx).await.unwrap();
        let back = h.store.recover_context(agent, "acme").await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_vec(&back.context).unwrap(),
            serde_json::to_vec(&ctx).unwrap()
        );
    }
}

#[tokio::test]
async fn archived_save_uses_one_version_for_blob_and_row() {
    let h = harness().await;
    let agent = Uuid::new_v4();
    h.store
        .save_context(agent, "acme", &json!({"v": 1}))
        .await
        .unwrap();
    h.store
        .save_context(agent, "acme", &payload_of_size(10 * 1024 * 1024 + 10))
        .await
        .unwrap();

    let row = h.recent.inner.latest(agent).await.unwrap().unwrap();
    let (blob_version, location) = h.archive.inner.latest("acme", agent).await.unwrap().unwrap();
    assert_eq!(row.version, 2);
    assert_eq!(blob_version, row.version);
    assert_eq!(row.archive_location(), Some(location.as_str()));
}

#[tokio::test]
async fn concurrent_saves_get_distinct_versions() {
    let h = Arc::new(harness().await);
    let agent = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.store
                .save_context(agent, "acme", &json!({ "i": i }))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(h.recent.inner.count(agent).await.unwrap(), 8);
    assert_eq!(h.recent.inner.next_version(agent).await.unwrap(), 9);
}

#[tokio::test]
async fn recent_hit_is_promoted_to_active() {
    let h = harness().await;
    let agent = Uuid::new_v4();
    let big = payload_of_size(2 * 1024 * 1024);
    h.store.save_context(agent, "acme", &big).await.unwrap();

    let first = h.store.recover_context(agent, "acme").await.unwrap().unwrap();
    assert_eq!(first.tier, ContextTier::Recent);
    assert_eq!(first.version, 1);

    h.reset_counts();
    let second = h.store.recover_context(agent, "acme").await.unwrap().unwrap();
    assert_eq!(second.tier, ContextTier::Active);
    assert_eq!(h.recent.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn larger_save_supersedes_cached_copy() {
    let h = harness().await;
    let agent = Uuid::new_v4();
    h.store
        .save_context(agent, "acme", &json!({"small": true}))
        .await
        .unwrap();
    let big = payload_of_size(2 * 1024 * 1024);
    h.store.save_context(agent, "acme", &big).await.unwrap();

    let back = h.store.recover_context(agent, "acme").await.unwrap().unwrap();
    assert_eq!(back.version, 2);
    assert_eq!(back.context, big);
}

#[tokio::test]
async fn cache_outage_degrades_to_durable_tiers() {
    let h = harness_with(Arc::new(DownCache)).await;
    let agent = Uuid::new_v4();
    let ctx = json!({"k": "v"});

    assert_eq!(
        h.store.save_context(agent, "acme", &ctx).await.unwrap(),
        ContextTier::Active
    );
    let back = h.store.recover_context(agent, "acme").await.unwrap().unwrap();
    assert_eq!(back.tier, ContextTier::Recent);
    assert_eq!(back.context, ctx);

    let health = h.store.get_context_health(agent, "acme").await;
    assert!(!health.active.available);
    assert!(health.recent.available);
    assert_eq!(health.recent.entries, 1);

    let report = h.store.delete_context(agent, "acme").await;
    assert!(!report.active.ok);
    assert!(report.recent.ok);
    assert_eq!(report.recent.removed, 1);
    assert!(report.archived.ok);
}

#[tokio::test]
async fn unknown_agent_misses_everywhere() {
    let h = harness().await;
    assert!(h
        .store
        .recover_context(Uuid::new_v4(), "acme")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn archive_sweep_moves_payload_and_recovery_follows() {
    let h = harness().await;
    let agent = Uuid::new_v4();
    let ctx = payload_of_size(3 * 1024 * 1024);
    h.store.save_context(agent, "acme", &ctx).await.unwrap();

    assert_eq!(
        h.store.archive_old_contexts(Duration::from_secs(3600)).await.unwrap(),
        0
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.store.archive_old_contexts(Duration::ZERO).await.unwrap(), 1);

    let row = h.recent.inner.latest(agent).await.unwrap().unwrap();
    assert!(row.payload.is_none());
    assert_eq!(row.tier, ContextTier::Archived);

    let back = h.store.recover_context(agent, "acme").await.unwrap().unwrap();
    assert_eq!(back.tier, ContextTier::Archived);
    assert_eq!(back.context, ctx);

    // A 3 MiB blob is promoted back into the recent tier.
    let row = h.recent.inner.latest(agent).await.unwrap().unwrap();
    assert!(row.payload.is_some());
    assert_eq!(row.tier, ContextTier::Recent);
}

#[tokio::test]
async fn delete_clears_every_tier() {
    let h = harness().await;
    let agent = Uuid::new_v4();
    h.store
        .save_context(agent, "acme", &json!({"a": 1}))
        .await
        .unwrap();
    h.store
        .save_context(agent, "acme", &payload_of_size(10 * 1024 * 1024 + 2))
        .await
        .unwrap();

    let health = h.store.get_context_health(agent, "acme").await;
    assert_eq!(health.recent.entries, 2);
    assert_eq!(health.archived.entries, 1);

    let report = h.store.delete_context(agent, "acme").await;
    assert!(report.all_ok());
    assert_eq!(report.recent.removed, 2);
    assert_eq!(report.archived.removed, 1);
    assert!(h.store.recover_context(agent, "acme").await.unwrap().is_none());
}
