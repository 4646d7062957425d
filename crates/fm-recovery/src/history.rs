use std::path::Path;

use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::checkpoint::{parse_ts, parse_uuid, ts};
use crate::error::{RecoveryError, Result};
use crate::model::RecoveryAttempt;

/// Append-only log of recovery attempts. Rows are never updated or deleted.
#[derive(Clone)]
pub struct RecoveryHistoryStore {
    conn: Connection,
}

struct RawAttempt {
    id: String,
    failure_id: String,
    session_id: String,
    agent_id: String,
    failure_type: String,
    strategy: String,
    success: bool,
    checkpoint_id: Option<String>,
    message: String,
    attempted_at: String,
}

impl TryFrom<RawAttempt> for RecoveryAttempt {
    type Error = RecoveryError;

    fn try_from(raw: RawAttempt) -> Result<Self> {
        Ok(RecoveryAttempt {
            id: parse_uuid(&raw.id)?,
            failure_id: parse_uuid(&raw.failure_id)?,
            session_id: raw.session_id,
            agent_id: parse_uuid(&raw.agent_id)?,
            failure_type: serde_json::from_value(serde_json::Value::String(raw.failure_type))?,
            strategy: raw.strategy.parse().map_err(RecoveryError::Corrupt)?,
            success: raw.success,
            checkpoint_id: raw.checkpoint_id.as_deref().map(parse_uuid).transpose()?,
            message: raw.message,
            attempted_at: parse_ts(&raw.attempted_at)?,
        })
    }
}

impl RecoveryHistoryStore {
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
                CREATE TABLE IF NOT EXISTS failure_recovery_history (
                    id             TEXT PRIMARY KEY,
                    failure_id     TEXT NOT NULL,
                    session_id     TEXT NOT NULL,
                    agent_id       TEXT NOT NULL,
                    failure_type   TEXT NOT NULL,
                    strategy       TEXT NOT NULL,
                    automatic      INTEGER NOT NULL,
                    success        INTEGER NOT NULL,
                    checkpoint_id  TEXT,
                    message        TEXT NOT NULL,
                    attempted_at   TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_recovery_history_session
                    ON failure_recovery_history(session_id, attempted_at);
                ",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn append(&self, attempt: &RecoveryAttempt) -> Result<()> {
        let a = attempt.clone();
        let failure_type = a.failure_type.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO failure_recovery_history
                        (id, failure_id, session_id, agent_id, failure_type, strategy, automatic,
                         success, checkpoint_id, message, attempted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        a.id.to_string(),
                        a.failure_id.to_string(),
                        a.session_id,
                        a.agent_id.to_string(),
                        failure_type,
                        a.strategy.as_str(),
                        a.strategy.is_automatic(),
                        a.success,
                        a.checkpoint_id.map(|id| id.to_string()),
                        a.message,
                        ts(a.attempted_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Automatic attempts recorded for the session, successful or not.
    pub async fn automatic_attempts(&self, session_id: &str) -> Result<usize> {
        let session = session_id.to_string();
        let n: i64 = self
            .conn
            .call(move |conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM failure_recovery_history
                     WHERE session_id = ?1 AND automatic = 1",
                    [&session],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    /// Every attempt for the session in the order it was made.
    pub async fn for_session(&self, session_id: &str) -> Result<Vec<RecoveryAttempt>> {
        let session = session_id.to_string();
        self.query("session_id = ?1", session).await
    }

    pub async fn for_failure(&self, failure_id: Uuid) -> Result<Vec<RecoveryAttempt>> {
        self.query("failure_id = ?1", failure_id.to_string()).await
    }

    async fn query(&self, filter: &'static str, value: String) -> Result<Vec<RecoveryAttempt>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, failure_id, session_id, agent_id, failure_type, strategy, success,
                            checkpoint_id, message, attempted_at
                     FROM failure_recovery_history WHERE {filter}
                     ORDER BY attempted_at, rowid"
                ))?;
                let rows = stmt
                    .query_map([&value], |row| {
                        Ok(RawAttempt {
                            id: row.get(0)?,
                            failure_id: row.get(1)?,
                            session_id: row.get(2)?,
                            agent_id: row.get(3)?,
                            failure_type: row.get(4)?,
                            strategy: row.get(5)?,
                            success: row.get(6)?,
                            checkpoint_id: row.get(7)?,
                            message: row.get(8)?,
                            attempted_at: row.get(9)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RecoveryAttempt::try_from).collect()
    }
}
