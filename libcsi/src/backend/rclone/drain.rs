//! Waiting for pending write-back before a mount is torn down.
//!
//! rclone's VFS cache acknowledges writes locally and uploads them in the
//! background.  Unmounting while uploads are queued loses data, so
//! unpublish polls the mount's rc endpoint until it reports no active
//! transfers and an empty upload queue.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::vfs_cache_dir;
use super::rc::StatusSource;

/// Bounds of the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainPolicy {
    /// Give up waiting and unmount anyway after this long.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Sleep between polls while work is pending.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// How the drain loop ended.  None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No control port was known; nothing was polled.
    Skipped,
    /// Both snapshots reported no pending work.
    Drained { polls: u32 },
    /// The upload queue could not be read; proceeding blind.
    Unreachable { polls: u32 },
    /// Work was still pending when the deadline passed.
    TimedOut { polls: u32 },
}

pub struct DrainController {
    source: Arc<dyn StatusSource>,
    policy: DrainPolicy,
    cache_root: PathBuf,
}

impl DrainController {
    pub fn new(
        source: Arc<dyn StatusSource>,
        policy: DrainPolicy,
        cache_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            policy,
            cache_root: cache_root.into(),
        }
    }

    /// Wait for the mount behind `rc_port` to go idle.
    ///
    /// A failed `core/stats` poll falls through to the queue check; a failed
    /// `vfs/stats` poll ends the wait.
    pub async fn drain(&self, rc_port: u16) -> DrainOutcome {
        if rc_port == 0 {
            return DrainOutcome::Skipped;
        }

        let deadline = Instant::now() + self.policy.timeout;
        let mut polls = 0;
        loop {
            if Instant::now() >= deadline {
                warn!(rc_port, polls, timeout = ?self.policy.timeout, "drain deadline reached, unmounting with work pending");
                return DrainOutcome::TimedOut { polls };
            }
            polls += 1;

            match self.source.core_stats(rc_port).await {
                Ok(stats) if stats.active_transfers() > 0 => {
                    debug!(rc_port, transfers = stats.active_transfers(), "transfers active, waiting");
                    tokio::time::sleep(self.policy.poll_interval).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(rc_port, error = %e, "core/stats poll failed"),
            }

            match self.source.vfs_stats(rc_port).await {
                Ok(stats) => {
                    let (in_progress, queued) = stats.pending_uploads();
                    if in_progress > 0 || queued > 0 {
                        debug!(rc_port, in_progress, queued, "uploads pending, waiting");
                        tokio::time::sleep(self.policy.poll_interval).await;
                        continue;
                    }
                }
                Err(e) => {
                    warn!(rc_port, error = %e, "vfs/stats poll failed, proceeding to unmount");
                    return DrainOutcome::Unreachable { polls };
                }
            }

            return DrainOutcome::Drained { polls };
        }
    }

    /// Drain, then remove the target's write-back cache directory.
    pub async fn drain_and_clean(&self, target_path: &Path, rc_port: u16) -> DrainOutcome {
        let outcome = self.drain(rc_port).await;
        info!(target_path = %target_path.display(), rc_port, ?outcome, "drain finished");

        let Some(cache_dir) = vfs_cache_dir(&self.cache_root, target_path) else {
            warn!(target_path = %target_path.display(), "target path has no cache directory, nothing removed");
            return outcome;
        };
        match tokio::fs::remove_dir_all(&cache_dir).await {
            Ok(()) => debug!(cache_dir = %cache_dir.display(), "vfs cache removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(cache_dir = %cache_dir.display(), error = %e, "failed to remove vfs cache"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::backend::rclone::rc::{CoreStats, DiskCacheStats, RcError, VfsStats};

    /// Replays scripted snapshots; the last entry repeats forever.
    #[derive(Default)]
    struct Scripted {
        transfers: Mutex<VecDeque<Option<usize>>>,
        uploads: Mutex<VecDeque<Option<(u64, u64)>>>,
        core_polls: AtomicU32,
        vfs_polls: AtomicU32,
    }

    impl Scripted {
        fn new(transfers: &[Option<usize>], uploads: &[Option<(u64, u64)>]) -> Self {
            Self {
                transfers: Mutex::new(transfers.iter().copied().collect()),
                uploads: Mutex::new(uploads.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn next<T: Copy>(queue: &Mutex<VecDeque<T>>) -> T {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                *queue.front().unwrap()
            }
        }
    }

    fn unreachable_error() -> RcError {
        RcError::Status(503)
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn core_stats(&self, _port: u16) -> Result<CoreStats, RcError> {
            self.core_polls.fetch_add(1, Ordering::SeqCst);
            match Self::next(&self.transfers) {
                Some(n) => Ok(CoreStats {
                    transferring: Some(serde_json::Value::Array(vec![
                        serde_json::json!({});
                        n
                    ])),
                }),
                None => Err(unreachable_error()),
            }
        }

        async fn vfs_stats(&self, _port: u16) -> Result<VfsStats, RcError> {
            self.vfs_polls.fetch_add(1, Ordering::SeqCst);
            match Self::next(&self.uploads) {
                Some((in_progress, queued)) => Ok(VfsStats {
                    disk_cache: Some(DiskCacheStats {
                        uploads_in_progress: in_progress,
                        uploads_queued: queued,
                    }),
                }),
                None => Err(unreachable_error()),
            }
        }
    }

    fn controller(source: Arc<Scripted>) -> DrainController {
        DrainController::new(source, DrainPolicy::default(), "/nonexistent/cache-root")
    }

    #[tokio::test(start_paused = true)]
    async fn zero_port_skips_polling() {
        let source = Arc::new(Scripted::new(&[Some(1)], &[Some((1, 1))]));
        let outcome = controller(source.clone()).drain(0).await;
        assert_eq!(outcome, DrainOutcome::Skipped);
        assert_eq!(source.core_polls.load(Ordering::SeqCst), 0);
        assert_eq!(source.vfs_polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_transfers_to_clear() {
        let source = Arc::new(Scripted::new(
            &[Some(1), Some(1), Some(1), Some(0)],
            &[Some((0, 0))],
        ));
        let start = Instant::now();
        let outcome = controller(source.clone()).drain(40000).await;

        assert_eq!(outcome, DrainOutcome::Drained { polls: 4 });
        assert_eq!(source.core_polls.load(Ordering::SeqCst), 4);
        // The queue is only consulted once transfers are idle.
        assert_eq!(source.vfs_polls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_upload_queue() {
        let source = Arc::new(Scripted::new(
            &[Some(0)],
            &[Some((1, 2)), Some((0, 1)), Some((0, 0))],
        ));
        let start = Instant::now();
        let outcome = controller(source).drain(40000).await;
        assert_eq!(outcome, DrainOutcome::Drained { polls: 3 });
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_wait_without_error() {
        let source = Arc::new(Scripted::new(&[Some(2)], &[Some((0, 0))]));
        let start = Instant::now();
        let outcome = controller(source).drain(40000).await;

        assert!(matches!(outcome, DrainOutcome::TimedOut { polls } if polls == 720));
        assert_eq!(start.elapsed(), Duration::from_secs(60 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn short_policy_override() {
        let source = Arc::new(Scripted::new(&[Some(1)], &[Some((0, 0))]));
        let policy = DrainPolicy {
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(30),
        };
        let drain = DrainController::new(source, policy, "/nonexistent");
        let outcome = drain.drain(1).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { polls: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_endpoint_proceeds_immediately() {
        let source = Arc::new(Scripted::new(&[None], &[None]));
        let start = Instant::now();
        let outcome = controller(source).drain(40000).await;
        assert_eq!(outcome, DrainOutcome::Unreachable { polls: 1 });
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn core_stats_failure_still_checks_queue() {
        let source = Arc::new(Scripted::new(&[None], &[Some((0, 1)), Some((0, 0))]));
        let outcome = controller(source.clone()).drain(40000).await;
        assert_eq!(outcome, DrainOutcome::Drained { polls: 2 });
        assert_eq!(source.vfs_polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_dir_removed_regardless_of_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let target = Path::new("/var/lib/kubelet/pods/p/mount");
        let cache_dir = vfs_cache_dir(tmp.path(), target).unwrap();
        tokio::fs::create_dir_all(cache_dir.join("vfs/s3"))
            .await
            .unwrap();
        tokio::fs::write(cache_dir.join("vfs/s3/file"), b"x")
            .await
            .unwrap();

        let source = Arc::new(Scripted::new(&[None], &[None]));
        let drain = DrainController::new(source, DrainPolicy::default(), tmp.path());
        assert_eq!(drain.drain_and_clean(target, 0).await, DrainOutcome::Skipped);
        assert!(!cache_dir.exists());

        // Missing cache directory is fine.
        assert_eq!(drain.drain_and_clean(target, 0).await, DrainOutcome::Skipped);
    }

    #[tokio::test]
    async fn cleanup_stays_inside_cache_root() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_root = tmp.path().join("cache");
        let sibling = tmp.path().join("victim");
        tokio::fs::create_dir_all(&cache_root).await.unwrap();
        tokio::fs::create_dir_all(&sibling).await.unwrap();
        tokio::fs::write(sibling.join("data"), b"keep").await.unwrap();

        let source = Arc::new(Scripted::new(&[None], &[None]));
        let drain = DrainController::new(source, DrainPolicy::default(), &cache_root);
        for target in ["/../victim", "/x/../../victim", "../victim"] {
            assert_eq!(
                drain.drain_and_clean(Path::new(target), 0).await,
                DrainOutcome::Skipped
            );
        }

        assert!(sibling.join("data").exists());
        assert!(cache_root.exists());
    }
}
