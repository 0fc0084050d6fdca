//! Durable queue storage: one keyed blob per tenant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use marquee_core::id::TenantId;
use tracing::debug;

use crate::error::QueueResult;
use crate::model::QueueBlob;

/// Storage key of a tenant's blob.
pub fn storage_key(tenant_id: &TenantId) -> String {
    format!("orderQueue:{tenant_id}")
}

#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// The tenant's blob, empty if nothing was stored yet.
    async fn load(&self, tenant_id: &TenantId) -> QueueResult<QueueBlob>;

    /// Replace the tenant's blob.
    async fn save(&self, tenant_id: &TenantId, blob: &QueueBlob) -> QueueResult<()>;
}

/// JSON files in a directory, written to a temp file then renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/marquee/queue`, or `./marquee/queue` without one.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marquee")
            .join("queue")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tenant_id: &TenantId) -> PathBuf {
        let name: String = storage_key(tenant_id)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

#[async_trait]
impl QueueStorage for FileStorage {
    async fn load(&self, tenant_id: &TenantId) -> QueueResult<QueueBlob> {
        let path = self.path_for(tenant_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueBlob::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, tenant_id: &TenantId, blob: &QueueBlob) -> QueueResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(tenant_id);
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(blob)?;
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), orders = blob.queue.len(), "queue saved");
        Ok(())
    }
}

/// Serialized blobs in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored JSON, for inspection.
    pub fn raw(&self, tenant_id: &TenantId) -> Option<String> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&storage_key(tenant_id))
            .cloned()
    }
}

#[async_trait]
impl QueueStorage for MemoryStorage {
    async fn load(&self, tenant_id: &TenantId) -> QueueResult<QueueBlob> {
        match self.raw(tenant_id) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(QueueBlob::default()),
        }
    }

    async fn save(&self, tenant_id: &TenantId, blob: &QueueBlob) -> QueueResult<()> {
        let raw = serde_json::to_string(blob)?;
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(storage_key(tenant_id), raw);
        Ok(())
    }
}
