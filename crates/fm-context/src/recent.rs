use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::{ContextError, Result};
use crate::tier::ContextTier;

/// One versioned context row. `payload` is `None` once the bytes live in the
/// archive, in which case `metadata.location` points at the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub tenant_id: String,
    pub tier: ContextTier,
    pub version: u64,
    #[serde(skip)]
    pub payload: Option<Vec<u8>>,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl ContextSnapshot {
    pub fn archive_location(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("location")?.as_str()
    }
}

/// Durable, versioned storage backing the Recent tier.
#[async_trait]
pub trait RecentStore: Send + Sync {
    /// `max(version) + 1` for the agent, starting at 1.
    async fn next_version(&self, agent_id: Uuid) -> Result<u64>;
    async fn insert(&self, snapshot: &ContextSnapshot) -> Result<()>;
    /// Highest-version row for the agent, with or without payload.
    async fn latest(&self, agent_id: Uuid) -> Result<Option<ContextSnapshot>>;
    /// Rows created before `cutoff` that still carry a payload.
    async fn payload_rows_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContextSnapshot>>;
    /// Drop the payload and record where the archived copy lives.
    async fn mark_archived(&self, id: Uuid, location: &str) -> Result<()>;
    /// Put a payload back onto a metadata-only row.
    async fn restore_payload(&self, id: Uuid, payload: &[u8]) -> Result<()>;
    async fn delete_agent(&self, agent_id: Uuid) -> Result<usize>;
    async fn count(&self, agent_id: Uuid) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteRecentStore {
    conn: Connection,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {raw:?}: {e}"))
}

struct RawRow {
    id: String,
    agent_id: String,
    tenant_id: String,
    tier: String,
    version: i64,
    payload: Option<Vec<u8>>,
    size_bytes: i64,
    created_at: String,
    expires_at: Option<String>,
    metadata: Option<String>,
}

const SELECT_COLUMNS: &str = "id, agent_id, tenant_id, tier, version, payload, size_bytes, \
                              created_at, expires_at, metadata";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        tenant_id: row.get(2)?,
        tier: row.get(3)?,
        version: row.get(4)?,
        payload: row.get(5)?,
        size_bytes: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        metadata: row.get(9)?,
    })
}

impl TryFrom<RawRow> for ContextSnapshot {
    type Error = ContextError;

    fn try_from(raw: RawRow) -> Result<Self> {
        let uuid = |s: &str| Uuid::parse_str(s).map_err(|e| ContextError::Corrupt(e.to_string()));
        Ok(ContextSnapshot {
            id: uuid(&raw.id)?,
            agent_id: uuid(&raw.agent_id)?,
            tenant_id: raw.tenant_id,
            tier: raw.tier.parse().map_err(ContextError::Corrupt)?,
            version: u64::try_from(raw.version)
                .map_err(|_| ContextError::Corrupt(format!("negative version {}", raw.version)))?,
            payload: raw.payload,
            size_bytes: usize::try_from(raw.size_bytes).unwrap_or_default(),
            created_at: parse_ts(&raw.created_at).map_err(ContextError::Corrupt)?,
            expires_at: raw
                .expires_at
                .as_deref()
                .map(parse_ts)
                .transpose()
                .map_err(ContextError::Corrupt)?,
            metadata: raw
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

impl SqliteRecentStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path.as_ref()).await?).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().await?).await
    }

    /// Share an existing connection; the schema is created if missing.
    pub async fn from_connection(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA busy_timeout=5000;

                CREATE TABLE IF NOT EXISTS context_snapshots (
                    id          TEXT PRIMARY KEY,
                    agent_id    TEXT NOT NULL,
                    tenant_id   TEXT NOT NULL,
                    tier        TEXT NOT NULL,
                    version     INTEGER NOT NULL,
                    payload     BLOB,
                    size_bytes  INTEGER NOT NULL,
                    created_at  TEXT NOT NULL,
                    expires_at  TEXT,
                    metadata    TEXT,
                    UNIQUE (agent_id, version)
                );

                CREATE INDEX IF NOT EXISTS idx_snapshots_agent
                    ON context_snapshots(agent_id, version DESC);
                CREATE INDEX IF NOT EXISTS idx_snapshots_created
                    ON context_snapshots(created_at);
                ",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RecentStore for SqliteRecentStore {
    async fn next_version(&self, agent_id: Uuid) -> Result<u64> {
        let agent = agent_id.to_string();
        let max: i64 = self
            .conn
            .call(move |conn| {
                let v = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM context_snapshots WHERE agent_id = ?1",
                    [&agent],
                    |row| row.get(0),
                )?;
                Ok(v)
            })
            .await?;
        Ok(max.max(0) as u64 + 1)
    }

    async fn insert(&self, s: &ContextSnapshot) -> Result<()> {
        let id = s.id.to_string();
        let agent = s.agent_id.to_string();
        let tenant = s.tenant_id.clone();
        let tier = s.tier.as_str();
        let version = s.version as i64;
        let payload = s.payload.clone();
        let size = s.size_bytes as i64;
        let created = ts(s.created_at);
        let expires = s.expires_at.map(ts);
        let metadata = s.metadata.as_ref().map(|m| m.to_string());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO context_snapshots
                        (id, agent_id, tenant_id, tier, version, payload, size_bytes,
                         created_at, expires_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        id, agent, tenant, tier, version, payload, size, created, expires,
                        metadata
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn latest(&self, agent_id: Uuid) -> Result<Option<ContextSnapshot>> {
        let agent = agent_id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM context_snapshots
                     WHERE agent_id = ?1 ORDER BY version DESC LIMIT 1"
                );
                let row = conn.query_row(&sql, [&agent], read_row).optional()?;
                Ok(row)
            })
            .await?;
        raw.map(ContextSnapshot::try_from).transpose()
    }

    async fn payload_rows_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContextSnapshot>> {
        let cutoff = ts(cutoff);
        let raws = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM context_snapshots
                     WHERE payload IS NOT NULL AND created_at < ?1
                     ORDER BY created_at ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([&cutoff], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        raws.into_iter().map(ContextSnapshot::try_from).collect()
    }

    async fn mark_archived(&self, id: Uuid, location: &str) -> Result<()> {
        let id = id.to_string();
        let metadata = serde_json::json!({ "location": location }).to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE context_snapshots
                     SET payload = NULL, tier = 'archived', expires_at = NULL, metadata = ?2
                     WHERE id = ?1",
                    rusqlite::params![id, metadata],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn restore_payload(&self, id: Uuid, payload: &[u8]) -> Result<()> {
        let id = id.to_string();
        let payload = payload.to_vec();
        let now = ts(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE context_snapshots
                     SET payload = ?2, tier = 'recent', created_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![id, payload, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete_agent(&self, agent_id: Uuid) -> Result<usize> {
        let agent = agent_id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM context_snapshots WHERE agent_id = ?1",
                    [&agent],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    async fn count(&self, agent_id: Uuid) -> Result<usize> {
        let agent = agent_id.to_string();
        let n: i64 = self
            .conn
            .call(move |conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM context_snapshots WHERE agent_id = ?1",
                    [&agent],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(n.max(0) as usize)
    }
}
