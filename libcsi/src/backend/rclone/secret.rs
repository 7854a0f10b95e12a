//! Credential store lookup.
//!
//! Secrets are key → bytes maps.  The node plugin normally reads them from a
//! directory projected into its Pod (`<root>/<name>/<key>`), which is how the
//! orchestrator exposes secret volumes.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CsiError;

/// Contents of one secret.
pub type Secret = HashMap<String, Vec<u8>>;

/// Source of named secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the secret called `name`.
    ///
    /// `Ok(None)` means the secret does not exist; `Err` means the store
    /// itself could not be read.
    async fn get(&self, name: &str) -> Result<Option<Secret>, CsiError>;
}

/// Secrets projected as directories of files.
///
/// Dot-prefixed entries (`..data`, `..2024_01_01...`) are projection
/// bookkeeping and are skipped; keys are usually symlinks into them.
#[derive(Debug, Clone)]
pub struct DirSecretStore {
    root: PathBuf,
}

impl DirSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn secret_dir(&self, name: &str) -> Result<PathBuf, CsiError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(CsiError::InvalidArgument(format!(
                "invalid secret name {name:?}"
            ))),
        }
    }
}

#[async_trait]
impl SecretStore for DirSecretStore {
    async fn get(&self, name: &str) -> Result<Option<Secret>, CsiError> {
        let dir = self.secret_dir(name)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read secret dir {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut secret = Secret::new();
        while let Some(entry) = entries.next_entry().await.map_err(CsiError::internal)? {
            let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            let path = entry.path();
            // Follows the projection symlink.
            let is_file = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let value = tokio::fs::read(&path).await.map_err(|e| {
                CsiError::Internal(format!("read secret key {}: {e}", path.display()))
            })?;
            secret.insert(key, value);
        }

        debug!(secret = name, keys = secret.len(), "secret loaded");
        Ok(Some(secret))
    }
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, Secret>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a secret from string values.
    pub fn with_secret<'a>(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let secret = values
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.as_bytes().to_vec()))
            .collect();
        self.secrets.insert(name.to_owned(), secret);
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<Secret>, CsiError> {
        Ok(self.secrets.get(name).cloned())
    }
}
