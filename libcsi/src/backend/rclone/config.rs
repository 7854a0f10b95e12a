//! Runtime configuration for the rclone backend.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::drain::DrainPolicy;

/// Root under which each target path gets its own write-back cache.
pub const DEFAULT_CACHE_ROOT: &str = "/tmp/rclone-vfs-cache";

/// Secret consulted when a volume does not name one explicitly.
pub const DEFAULT_SECRET: &str = "rclone-secret";

/// Configuration owned by [`RcloneBackend`](super::RcloneBackend).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcloneConfig {
    /// Identifier reported by `NodeGetInfo`.
    pub node_id: String,
    /// Path or name of the rclone executable.
    pub rclone_binary: PathBuf,
    /// Root of the per-target write-back cache directories.
    pub cache_root: PathBuf,
    /// Name of the secret holding connection defaults.
    pub default_secret: String,
    /// Unpublish drain timing.
    pub drain: DrainPolicy,
    /// Timeout for a single status request to a mount's control port.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Maximum number of volumes this node advertises.
    pub max_volumes: u64,
}

impl Default for RcloneConfig {
    fn default() -> Self {
        Self {
            node_id: hostname(),
            rclone_binary: PathBuf::from("rclone"),
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            default_secret: DEFAULT_SECRET.to_owned(),
            drain: DrainPolicy::default(),
            rpc_timeout: Duration::from_secs(10),
            max_volumes: 256,
        }
    }
}

/// `path` is absolute and every component after the root is a plain name.
pub fn is_plain_absolute(path: &Path) -> bool {
    let mut components = path.components();
    components.next() == Some(Component::RootDir)
        && components.clone().next().is_some()
        && components.all(|c| matches!(c, Component::Normal(_)))
}

/// Namespace `target_path` under `cache_root`.
///
/// Target paths are appended rather than joined (joining an absolute path
/// would replace the root).  `None` for anything [`is_plain_absolute`]
/// rejects, so the result always lies strictly below `cache_root`.
pub fn vfs_cache_dir(cache_root: &Path, target_path: &Path) -> Option<PathBuf> {
    if !is_plain_absolute(target_path) {
        return None;
    }
    let relative = target_path.strip_prefix("/").ok()?;
    Some(cache_root.join(relative))
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}
