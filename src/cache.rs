//! Persisted last-known TCP endpoints, keyed by device id.
//!
//! The file is a hint to speed up reconnection after a host restart, never
//! ground truth: every cache-driven connect is re-verified against the
//! device's reported serial before it is trusted.

use std::{collections::HashMap, net::Ipv4Addr, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, CachedEndpoint>>,
}

impl CacheStore {
    /// Loads the store, falling back to empty on a missing or corrupt file.
    pub async fn load(path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Endpoint cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, entries: Mutex::new(entries) }
    }

    pub async fn get(&self, device_id: &str) -> Option<CachedEndpoint> {
        self.entries.lock().await.get(device_id).copied()
    }

    /// Remembers the endpoint and persists when it changed.
    #[instrument(skip(self), err)]
    pub async fn record(&self, device_id: &str, endpoint: CachedEndpoint) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.insert(device_id.to_string(), endpoint) == Some(endpoint) {
            return Ok(());
        }
        debug!(device_id, ip = %endpoint.ip, port = endpoint.port, "Recorded wifi endpoint");
        self.persist(&entries).await
    }

    #[instrument(skip(self), err)]
    pub async fn forget(&self, device_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(device_id).is_none() {
            return Ok(());
        }
        self.persist(&entries).await
    }

    // Write-to-temp then rename so a crash never leaves a torn file.
    async fn persist(&self, entries: &HashMap<String, CachedEndpoint>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(entries).context("Failed to serialize endpoint cache")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
