//! Live mount bookkeeping.
//!
//! Maps a target path to the control port of the rclone daemon serving it,
//! so a later unpublish knows where to poll for pending write-back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

/// What the registry remembers about one published target path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountContext {
    /// Control port of the mount daemon; `0` when unknown.
    pub rc_port: u16,
}

/// Target path → [`MountContext`], shared between concurrent requests.
///
/// Lookups share the lock; `set` and `delete` take it exclusively.  No
/// process handles are kept, the daemons are not ours to supervise.
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: RwLock<HashMap<PathBuf, MountContext>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for `target_path`, or the zero context if none is recorded.
    pub async fn get(&self, target_path: &Path) -> MountContext {
        self.mounts
            .read()
            .await
            .get(target_path)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set(&self, target_path: impl Into<PathBuf>, ctx: MountContext) {
        self.mounts.write().await.insert(target_path.into(), ctx);
    }

    pub async fn delete(&self, target_path: &Path) -> Option<MountContext> {
        self.mounts.write().await.remove(target_path)
    }

    pub async fn len(&self) -> usize {
        self.mounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mounts.read().await.is_empty()
    }
}
