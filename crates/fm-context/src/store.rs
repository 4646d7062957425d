use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fm_core::config::ContextConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::active::{ActiveCache, MemoryCache};
use crate::archive::{ArchiveStore, FsArchive};
use crate::error::Result;
use crate::recent::{ContextSnapshot, RecentStore, SqliteRecentStore};
use crate::tier::{ContextTier, TierLimits};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A context returned by [`ContextStore::recover_context`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredContext {
    pub agent_id: Uuid,
    /// Tier the value was found in (before any promotion).
    pub tier: ContextTier,
    pub version: u64,
    pub context: serde_json::Value,
}

/// Envelope stored in the Active cache so a hit still knows its version.
#[derive(Serialize, Deserialize)]
struct CachedContext {
    version: u64,
    context: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierOutcome {
    pub ok: bool,
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TierOutcome {
    fn from_result(result: Result<usize>) -> Self {
        match result {
            Ok(removed) => Self {
                ok: true,
                removed,
                error: None,
            },
            Err(e) => Self {
                ok: false,
                removed: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Per-tier outcome of [`ContextStore::delete_context`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub active: TierOutcome,
    pub recent: TierOutcome,
    pub archived: TierOutcome,
}

impl DeleteReport {
    pub fn all_ok(&self) -> bool {
        self.active.ok && self.recent.ok && self.archived.ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierHealth {
    pub available: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TierHealth {
    fn from_result(result: Result<usize>) -> Self {
        match result {
            Ok(entries) => Self {
                available: true,
                entries,
                error: None,
            },
            Err(e) => Self {
                available: false,
                entries: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextHealth {
    pub agent_id: Uuid,
    pub active: TierHealth,
    pub recent: TierHealth,
    pub archived: TierHealth,
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Three-tier context persistence with cascading recovery.
pub struct ContextStore {
    active: Arc<dyn ActiveCache>,
    recent: Arc<dyn RecentStore>,
    archive: Arc<dyn ArchiveStore>,
    limits: TierLimits,
    active_ttl: Duration,
    /// Serializes version allocation per agent.
    save_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ContextStore {
    pub fn new(
        active: Arc<dyn ActiveCache>,
        recent: Arc<dyn RecentStore>,
        archive: Arc<dyn ArchiveStore>,
        config: &ContextConfig,
    ) -> Self {
        Self {
            active,
            recent,
            archive,
            limits: TierLimits::from(config),
            active_ttl: config.active_ttl(),
            save_locks: DashMap::new(),
        }
    }

    /// Production wiring: in-process cache, SQLite file and archive directory.
    pub async fn open(
        db_path: impl AsRef<Path>,
        archive_dir: impl AsRef<Path>,
        config: &ContextConfig,
    ) -> Result<Self> {
        let recent = SqliteRecentStore::open(db_path).await?;
        Ok(Self::new(
            Arc::new(MemoryCache::new(config.cache_capacity)),
            Arc::new(recent),
            Arc::new(FsArchive::new(archive_dir.as_ref())),
            config,
        ))
    }

    pub fn limits(&self) -> TierLimits {
        self.limits
    }

    fn cache_key(agent_id: Uuid) -> String {
        format!("context:{agent_id}")
    }

    fn lock_for(&self, agent_id: Uuid) -> Arc<Mutex<()>> {
        self.save_locks
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the agent's lock entry unless another save is holding or
    /// waiting on it.
    fn release_lock(&self, agent_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.save_locks
            .remove_if(&agent_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Persist a new version of an agent's context and return the tier it
    /// landed in.
    pub async fn save_context(
        &self,
        agent_id: Uuid,
        tenant_id: &str,
        context: &serde_json::Value,
    ) -> Result<ContextTier> {
        let bytes = serde_json::to_vec(context)?;
        let size = bytes.len();
        let tier = self.limits.classify(size);

        let lock = self.lock_for(agent_id);
        let saved = {
            let _held = lock.lock().await;
            self.save_versioned(agent_id, tenant_id, tier, context, bytes)
                .await
        };
        self.release_lock(agent_id, lock);
        let version = saved?;
        info!(agent_id = %agent_id, tier = %tier, version, size, "context saved");
        Ok(tier)
    }

    /// Allocate the next version and write it to `tier`. Callers hold the
    /// agent's save lock.
    async fn save_versioned(
        &self,
        agent_id: Uuid,
        tenant_id: &str,
        tier: ContextTier,
        context: &serde_json::Value,
        bytes: Vec<u8>,
    ) -> Result<u64> {
        let size = bytes.len();
        let version = self.recent.next_version(agent_id).await?;
        let now = Utc::now();

        let mut snapshot = ContextSnapshot {
            id: Uuid::new_v4(),
            agent_id,
            tenant_id: tenant_id.to_string(),
            tier,
            version,
            payload: None,
            size_bytes: size,
            created_at: now,
            expires_at: None,
            metadata: None,
        };

        match tier {
            ContextTier::Active => {
                self.write_active(agent_id, version, context).await;
                snapshot.expires_at = chrono::Duration::from_std(self.active_ttl)
                    .ok()
                    .map(|ttl| now + ttl);
                snapshot.payload = Some(bytes);
                self.recent.insert(&snapshot).await?;
            }
            ContextTier::Recent => {
                snapshot.payload = Some(bytes);
                self.recent.insert(&snapshot).await?;
                self.evict_active(agent_id).await;
            }
            ContextTier::Archived => {
                // Blob and metadata row share the version allocated above.
                let location = self.archive.put(tenant_id, agent_id, version, &bytes).await?;
                snapshot.metadata = Some(serde_json::json!({ "location": location }));
                self.recent.insert(&snapshot).await?;
                self.evict_active(agent_id).await;
            }
        }
        Ok(version)
    }

    /// Return the newest context for an agent, trying Active, then Recent,
    /// then Archived. `Ok(None)` means every tier missed.
    pub async fn recover_context(
        &self,
        agent_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<RecoveredContext>> {
        if let Some(hit) = self.read_active(agent_id).await {
            debug!(agent_id = %agent_id, "context hit in active tier");
            return Ok(Some(hit));
        }

        let latest = match self.recent.latest(agent_id).await {
            Ok(row) => row,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "recent tier lookup failed, trying archive");
                None
            }
        };

        if let Some(row) = &latest {
            if let Some(payload) = &row.payload {
                let context: serde_json::Value = serde_json::from_slice(payload)?;
                self.write_active(agent_id, row.version, &context).await;
                info!(agent_id = %agent_id, version = row.version, "context recovered from recent tier");
                return Ok(Some(RecoveredContext {
                    agent_id,
                    tier: ContextTier::Recent,
                    version: row.version,
                    context,
                }));
            }
        }

        let located = match latest.as_ref().and_then(|row| {
            row.archive_location()
                .map(|loc| (row.version, loc.to_string(), Some(row.id)))
        }) {
            Some(found) => Some(found),
            None => self
                .archive
                .latest(tenant_id, agent_id)
                .await?
                .map(|(version, loc)| (version, loc, None)),
        };

        let Some((version, location, row_id)) = located else {
            debug!(agent_id = %agent_id, "context miss in every tier");
            return Ok(None);
        };
        let Some(bytes) = self.archive.get(&location).await? else {
            warn!(agent_id = %agent_id, location = %location, "archive blob missing");
            return Ok(None);
        };
        let context: serde_json::Value = serde_json::from_slice(&bytes)?;

        match self.limits.classify(bytes.len()) {
            ContextTier::Active => self.write_active(agent_id, version, &context).await,
            ContextTier::Recent => {
                if let Some(id) = row_id {
                    if let Err(e) = self.recent.restore_payload(id, &bytes).await {
                        warn!(agent_id = %agent_id, error = %e, "promotion into recent tier failed");
                    }
                }
            }
            ContextTier::Archived => {}
        }

        info!(agent_id = %agent_id, version, "context recovered from archive");
        Ok(Some(RecoveredContext {
            agent_id,
            tier: ContextTier::Archived,
            version,
            context,
        }))
    }

    /// Move payloads older than `max_age` out of the Recent tier into the
    /// archive. Returns how many rows were archived.
    pub async fn archive_old_contexts(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let rows = self.recent.payload_rows_before(cutoff).await?;

        let mut archived = 0;
        for row in rows {
            let Some(payload) = &row.payload else { continue };
            let moved = async {
                let location = self
                    .archive
                    .put(&row.tenant_id, row.agent_id, row.version, payload)
                    .await?;
                self.recent.mark_archived(row.id, &location).await
            }
            .await;
            match moved {
                Ok(()) => archived += 1,
                Err(e) => warn!(
                    agent_id = %row.agent_id,
                    version = row.version,
                    error = %e,
                    "failed to archive context row"
                ),
            }
        }

        if archived > 0 {
            info!(archived, "archived old contexts");
        }
        Ok(archived)
    }

    /// Remove an agent's context from every tier. A failure in one tier does
    /// not stop the others.
    pub async fn delete_context(&self, agent_id: Uuid, tenant_id: &str) -> DeleteReport {
        let active = TierOutcome::from_result(
            self.active
                .delete(&Self::cache_key(agent_id))
                .await
                .map(usize::from),
        );
        let recent = TierOutcome::from_result(self.recent.delete_agent(agent_id).await);
        let archived =
            TierOutcome::from_result(self.archive.delete_agent(tenant_id, agent_id).await);
        self.save_locks.remove(&agent_id);

        let report = DeleteReport {
            active,
            recent,
            archived,
        };
        if report.all_ok() {
            info!(agent_id = %agent_id, "context deleted from all tiers");
        } else {
            warn!(agent_id = %agent_id, ?report, "context delete partially failed");
        }
        report
    }

    pub async fn get_context_health(&self, agent_id: Uuid, tenant_id: &str) -> ContextHealth {
        let active = match self.active.ping().await {
            Ok(()) => TierHealth::from_result(
                self.active
                    .get(&Self::cache_key(agent_id))
                    .await
                    .map(|hit| usize::from(hit.is_some())),
            ),
            Err(e) => TierHealth::from_result(Err(e)),
        };
        ContextHealth {
            agent_id,
            active,
            recent: TierHealth::from_result(self.recent.count(agent_id).await),
            archived: TierHealth::from_result(self.archive.count(tenant_id, agent_id).await),
        }
    }

    // -- Active tier helpers (best-effort) ----------------------------------

    async fn read_active(&self, agent_id: Uuid) -> Option<RecoveredContext> {
        let raw = match self.active.get(&Self::cache_key(agent_id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "active tier unavailable");
                return None;
            }
        };
        match serde_json::from_slice::<CachedContext>(&raw) {
            Ok(cached) => Some(RecoveredContext {
                agent_id,
                tier: ContextTier::Active,
                version: cached.version,
                context: cached.context,
            }),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "discarding unreadable cache entry");
                None
            }
        }
    }

    async fn write_active(&self, agent_id: Uuid, version: u64, context: &serde_json::Value) {
        let envelope = serde_json::json!({ "version": version, "context": context });
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "could not encode cache entry");
                return;
            }
        };
        if let Err(e) = self
            .active
            .set(&Self::cache_key(agent_id), bytes, self.active_ttl)
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "active tier write failed");
        }
    }

    /// Drop a cached copy that a newer, larger save has superseded.
    async fn evict_active(&self, agent_id: Uuid) {
        if let Err(e) = self.active.delete(&Self::cache_key(agent_id)).await {
            warn!(agent_id = %agent_id, error = %e, "active tier eviction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &Path) -> Arc<ContextStore> {
        Arc::new(ContextStore::new(
            Arc::new(MemoryCache::new(16)),
            Arc::new(SqliteRecentStore::open_in_memory().await.unwrap()),
            Arc::new(FsArchive::new(dir)),
            &ContextConfig::default(),
        ))
    }

    #[tokio::test]
    async fn save_locks_do_not_outlive_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let agent = Uuid::new_v4();

        let saves: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .save_context(agent, "acme", &serde_json::json!({ "step": n }))
                        .await
                })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }
        for _ in 0..5 {
            store
                .save_context(Uuid::new_v4(), "acme", &serde_json::json!({}))
                .await
                .unwrap();
        }

        assert!(store.save_locks.is_empty());
        let latest = store.recover_context(agent, "acme").await.unwrap().unwrap();
        assert_eq!(latest.version, 8);
    }
}
