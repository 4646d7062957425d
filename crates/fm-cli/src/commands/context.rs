use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use fm_context::ContextStore;
use fm_core::config::Config;
use serde_json::json;
use uuid::Uuid;

use super::print_json;

async fn open(config: &Config) -> anyhow::Result<ContextStore> {
    if let Some(parent) = config.storage.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    ContextStore::open(
        &config.storage.db_path,
        &config.storage.archive_dir,
        &config.context,
    )
    .await
    .with_context(|| format!("failed to open {}", config.storage.db_path.display()))
}

pub async fn save(
    config: &Config,
    agent: Uuid,
    tenant: &str,
    data: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let text = match (data, file) {
        (Some(data), _) => data,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("one of --data or --file is required"),
    };
    let payload: serde_json::Value = serde_json::from_str(&text).context("payload is not JSON")?;

    let store = open(config).await?;
    let tier = store.save_context(agent, tenant, &payload).await?;
    print_json(&json!({ "agent_id": agent, "tier": tier }))
}

pub async fn recover(config: &Config, agent: Uuid, tenant: &str) -> anyhow::Result<()> {
    let store = open(config).await?;
    match store.recover_context(agent, tenant).await? {
        Some(found) => print_json(&found),
        None => bail!("no context stored for agent {agent}"),
    }
}

pub async fn health(config: &Config, agent: Uuid, tenant: &str) -> anyhow::Result<()> {
    let store = open(config).await?;
    print_json(&store.get_context_health(agent, tenant).await)
}

pub async fn delete(config: &Config, agent: Uuid, tenant: &str) -> anyhow::Result<()> {
    let store = open(config).await?;
    let report = store.delete_context(agent, tenant).await;
    print_json(&report)?;
    if !report.all_ok() {
        bail!("some tiers could not be cleared");
    }
    Ok(())
}

pub async fn archive(config: &Config, older_than_secs: Option<u64>) -> anyhow::Result<()> {
    let max_age = older_than_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.context.archive_after());
    let store = open(config).await?;
    let moved = store.archive_old_contexts(max_age).await?;
    print_json(&json!({ "archived": moved, "older_than_secs": max_age.as_secs() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_recover_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("db").join("foreman.db");
        config.storage.archive_dir = dir.path().join("archive");
        let agent = Uuid::new_v4();

        save(&config, agent, "acme", Some(r#"{"step":1}"#.into()), None)
            .await
            .unwrap();
        recover(&config, agent, "acme").await.unwrap();
        delete(&config, agent, "acme").await.unwrap();
        assert!(recover(&config, agent, "acme").await.is_err());
    }
}
