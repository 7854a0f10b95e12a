//! OS-level mount point probing and unmounting.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use tracing::{debug, warn};

use crate::error::CsiError;

/// Mount point primitives used by the lifecycle handlers.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// `path` is listed in the mount table.
    async fn is_mountpoint(&self, path: &Path) -> bool;

    /// `path` is a mount whose FUSE daemon has gone away.
    async fn is_corrupted(&self, path: &Path) -> bool;

    /// `path` can be listed.
    async fn is_healthy(&self, path: &Path) -> bool;

    /// Unmount `path` and remove the now-empty directory.
    async fn unmount(&self, path: &Path) -> Result<(), CsiError>;
}

/// [`Mounter`] for the local Linux host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

/// Decode the octal escapes (`\040` for space, ...) used by
/// `/proc/self/mounts`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn listed_in(mounts: &str, path: &Path) -> bool {
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|field| Path::new(&unescape_mount_field(field)) == path)
    })
}

fn is_corrupted_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOTCONN | Errno::ESTALE | Errno::EIO)
    )
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mountpoint(&self, path: &Path) -> bool {
        match tokio::fs::read_to_string("/proc/self/mounts").await {
            Ok(contents) => listed_in(&contents, path),
            Err(e) => {
                warn!(error = %e, "cannot read /proc/self/mounts");
                false
            }
        }
    }

    async fn is_corrupted(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(_) => false,
            Err(e) => is_corrupted_error(&e),
        }
    }

    async fn is_healthy(&self, path: &Path) -> bool {
        tokio::fs::read_dir(path).await.is_ok()
    }

    async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        let target: PathBuf = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || match umount2(&target, MntFlags::empty()) {
            Err(Errno::EBUSY) => {
                debug!(path = %target.display(), "mount busy, detaching lazily");
                umount2(&target, MntFlags::MNT_DETACH)
            }
            other => other,
        })
        .await
        .map_err(CsiError::internal)?;

        match result {
            // EINVAL: not a mount point any more.
            Ok(()) | Err(Errno::EINVAL) => {}
            Err(e) => {
                return Err(CsiError::UnmountFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::UnmountFailed {
                path: path.display().to_string(),
                reason: format!("remove target dir: {e}"),
            }),
        }
    }
}
