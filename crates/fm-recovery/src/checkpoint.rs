use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RecoveryError, Result};
use crate::model::Checkpoint;

/// SQLite-backed recovery points, newest first per session.
#[derive(Clone)]
pub struct CheckpointStore {
    conn: Connection,
}

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| RecoveryError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| RecoveryError::Corrupt(e.to_string()))
}

struct RawCheckpoint {
    id: String,
    session_id: String,
    agent_id: String,
    tenant_id: String,
    revision: Option<String>,
    branch: Option<String>,
    files: String,
    tests_passing: Option<bool>,
    created_at: String,
}

const COLUMNS: &str =
    "id, session_id, agent_id, tenant_id, revision, branch, files, tests_passing, created_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        tenant_id: row.get(3)?,
        revision: row.get(4)?,
        branch: row.get(5)?,
        files: row.get(6)?,
        tests_passing: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl TryFrom<RawCheckpoint> for Checkpoint {
    type Error = RecoveryError;

    fn try_from(raw: RawCheckpoint) -> Result<Self> {
        Ok(Checkpoint {
            id: parse_uuid(&raw.id)?,
            session_id: raw.session_id,
            agent_id: parse_uuid(&raw.agent_id)?,
            tenant_id: raw.tenant_id,
            revision: raw.revision,
            branch: raw.branch,
            files: serde_json::from_str(&raw.files)?,
            tests_passing: raw.tests_passing,
            created_at: parse_ts(&raw.created_at)?,
        })
    }
}

impl CheckpointStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path.as_ref()).await?).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().await?).await
    }

    pub async fn from_connection(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS checkpoints (
                    id             TEXT PRIMARY KEY,
                    session_id     TEXT NOT NULL,
                    agent_id       TEXT NOT NULL,
                    tenant_id      TEXT NOT NULL,
                    revision       TEXT,
                    branch         TEXT,
                    files          TEXT NOT NULL,
                    tests_passing  INTEGER,
                    created_at     TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_session
                    ON checkpoints(session_id, created_at DESC);
                ",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn record(&self, checkpoint: &Checkpoint) -> Result<()> {
        let c = checkpoint.clone();
        let files = serde_json::to_string(&c.files)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints
                        (id, session_id, agent_id, tenant_id, revision, branch, files, tests_passing, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        c.id.to_string(),
                        c.session_id,
                        c.agent_id.to_string(),
                        c.tenant_id,
                        c.revision,
                        c.branch,
                        files,
                        c.tests_passing,
                        ts(c.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        debug!(
            checkpoint_id = %checkpoint.id,
            session_id = %checkpoint.session_id,
            revision = checkpoint.revision.as_deref().unwrap_or("-"),
            "checkpoint recorded"
        );
        Ok(())
    }

    pub async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let session = session_id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM checkpoints WHERE session_id = ?1
                             ORDER BY created_at DESC, rowid DESC LIMIT 1"
                        ),
                        [&session],
                        read_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        raw.map(Checkpoint::try_from).transpose()
    }

    pub async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let session = session_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM checkpoints WHERE session_id = ?1
                     ORDER BY created_at DESC, rowid DESC"
                ))?;
                let rows = stmt
                    .query_map([&session], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(Checkpoint::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionInfo;
    use fm_core::types::AgentType;

    fn session() -> SessionInfo {
        SessionInfo {
            session_id: "wf/implementation".into(),
            agent_id: Uuid::new_v4(),
            agent_type: AgentType::Dev,
            tenant_id: "t1".into(),
            workflow_id: None,
            task_id: None,
            phase: None,
        }
    }

    #[tokio::test]
    async fn latest_returns_newest_checkpoint() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        assert!(store.latest("wf/implementation").await.unwrap().is_none());

        let s = session();
        let mut first = Checkpoint::new(&s);
        first.revision = Some("abc123".into());
        first.files = vec!["src/lib.rs".into()];
        store.record(&first).await.unwrap();

        let mut second = Checkpoint::new(&s);
        second.revision = Some("def456".into());
        second.branch = Some("feature/login".into());
        second.tests_passing = Some(true);
        store.record(&second).await.unwrap();

        let latest = store.latest(&s.session_id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.revision.as_deref(), Some("def456"));
        assert_eq!(latest.branch.as_deref(), Some("feature/login"));
        assert_eq!(latest.tests_passing, Some(true));
        assert_eq!(store.list(&s.session_id).await.unwrap().len(), 2);
        assert!(store.list("other").await.unwrap().is_empty());
    }
}
