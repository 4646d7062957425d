use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ContextError, Result};

/// Durable blob storage for the Archived tier, addressed by
/// (tenant, agent, version).
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store a blob and return its location.
    async fn put(&self, tenant_id: &str, agent_id: Uuid, version: u64, bytes: &[u8])
        -> Result<String>;
    async fn get(&self, location: &str) -> Result<Option<Vec<u8>>>;
    /// Highest stored version for an agent, with its location.
    async fn latest(&self, tenant_id: &str, agent_id: Uuid) -> Result<Option<(u64, String)>>;
    async fn delete_agent(&self, tenant_id: &str, agent_id: Uuid) -> Result<usize>;
    async fn count(&self, tenant_id: &str, agent_id: Uuid) -> Result<usize>;
}

/// Archive laid out as `<root>/<tenant>/<agent>/v<version>.json`.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agent_dir(&self, tenant_id: &str, agent_id: Uuid) -> Result<PathBuf> {
        if tenant_id.is_empty()
            || tenant_id.contains(['/', '\\'])
            || tenant_id == "."
            || tenant_id == ".."
        {
            return Err(ContextError::InvalidKey(format!("tenant {tenant_id:?}")));
        }
        Ok(self.root.join(tenant_id).join(agent_id.to_string()))
    }

    /// Resolve a location and make sure it stays under the archive root.
    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let rel = Path::new(location);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes {
            return Err(ContextError::InvalidKey(location.to_string()));
        }
        Ok(self.root.join(rel))
    }

    async fn versions(&self, dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(version) = version {
                out.push((version, entry.path()));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ArchiveStore for FsArchive {
    async fn put(
        &self,
        tenant_id: &str,
        agent_id: Uuid,
        version: u64,
        bytes: &[u8],
    ) -> Result<String> {
        let dir = self.agent_dir(tenant_id, agent_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let file = format!("v{version}.json");
        // Write-then-rename so readers never observe a partial blob.
        let tmp = dir.join(format!(".{file}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, dir.join(&file)).await?;
        Ok(format!("{tenant_id}/{agent_id}/{file}"))
    }

    async fn get(&self, location: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(location)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self, tenant_id: &str, agent_id: Uuid) -> Result<Option<(u64, String)>> {
        let dir = self.agent_dir(tenant_id, agent_id)?;
        let latest = self
            .versions(&dir)
            .await?
            .into_iter()
            .max_by_key(|(v, _)| *v)
            .map(|(v, _)| (v, format!("{tenant_id}/{agent_id}/v{v}.json")));
        Ok(latest)
    }

    async fn delete_agent(&self, tenant_id: &str, agent_id: Uuid) -> Result<usize> {
        let dir = self.agent_dir(tenant_id, agent_id)?;
        let removed = self.versions(&dir).await?.len();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn count(&self, tenant_id: &str, agent_id: Uuid) -> Result<usize> {
        let dir = self.agent_dir(tenant_id, agent_id)?;
        Ok(self.versions(&dir).await?.len())
    }
}
