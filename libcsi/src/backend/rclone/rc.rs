//! Client for the rclone remote-control (rc) API of a running mount.
//!
//! Only the two status calls needed to decide whether a mount is idle are
//! implemented:
//!
//! - `POST /core/stats`: `transferring` lists active transfers.
//! - `POST /vfs/stats`: `diskCache.uploadsInProgress` / `uploadsQueued`
//!   count pending write-back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::launcher::LOOPBACK_HOST;
use crate::error::CsiError;

/// Failure to obtain a status snapshot.
#[derive(Debug, Error)]
pub enum RcError {
    #[error("rc request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rc endpoint returned HTTP {0}")]
    Status(u16),
}

/// Subset of `core/stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreStats {
    /// Array of transfers in current rclone releases; keyed maps and `null`
    /// are also accepted.
    #[serde(default)]
    pub transferring: Option<serde_json::Value>,
}

impl CoreStats {
    pub fn active_transfers(&self) -> usize {
        match &self.transferring {
            Some(serde_json::Value::Array(items)) => items.len(),
            Some(serde_json::Value::Object(items)) => items.len(),
            _ => 0,
        }
    }
}

/// Subset of `vfs/stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VfsStats {
    /// Absent when the mount runs without a VFS disk cache.
    #[serde(rename = "diskCache", default)]
    pub disk_cache: Option<DiskCacheStats>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DiskCacheStats {
    #[serde(rename = "uploadsInProgress", default)]
    pub uploads_in_progress: u64,
    #[serde(rename = "uploadsQueued", default)]
    pub uploads_queued: u64,
}

impl VfsStats {
    /// `(in progress, queued)` uploads.
    pub fn pending_uploads(&self) -> (u64, u64) {
        self.disk_cache
            .map(|d| (d.uploads_in_progress, d.uploads_queued))
            .unwrap_or_default()
    }
}

/// Where the drain controller reads mount activity from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn core_stats(&self, port: u16) -> Result<CoreStats, RcError>;
    async fn vfs_stats(&self, port: u16) -> Result<VfsStats, RcError>;
}

/// HTTP client for a mount's rc endpoint.
#[derive(Debug, Clone)]
pub struct RcClient {
    client: Client,
    host: String,
}

impl RcClient {
    /// Client polling `localhost` with a per-request `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, CsiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CsiError::Internal(format!("build rc http client: {e}")))?;
        Ok(Self {
            client,
            host: LOOPBACK_HOST.to_owned(),
        })
    }

    #[cfg(test)]
    fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    async fn call<T: DeserializeOwned>(&self, port: u16, method: &str) -> Result<T, RcError> {
        let url = format!("http://{}:{}/{}", self.host, port, method);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RcError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl StatusSource for RcClient {
    async fn core_stats(&self, port: u16) -> Result<CoreStats, RcError> {
        self.call(port, "core/stats").await
    }

    async fn vfs_stats(&self, port: u16) -> Result<VfsStats, RcError> {
        self.call(port, "vfs/stats").await
    }
}
