//! rclone storage backend for CSI.
//!
//! [`RcloneBackend`] implements [`CsiIdentity`] and [`CsiNode`] by running
//! `rclone mount --daemon` for each published target path.  Volumes are not
//! provisioned here: everything needed to mount one (`remote`, `remotePath`,
//! credentials, rclone flags) arrives in the volume context, optionally
//! layered over a secret.
//!
//! # Lifecycle of a target path
//!
//! ```text
//! Unpublished ──publish──▶ Mounting ──▶ Mounted ──unpublish──▶ Draining ──▶ Unpublished
//! ```
//!
//! Publish records the mount's rc port in the [`MountRegistry`]; unpublish
//! uses it to wait for queued uploads before unmounting.

pub mod config;
pub mod drain;
pub mod flags;
pub mod launcher;
pub mod mounter;
pub mod rc;
pub mod registry;
pub mod secret;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::types::*;

pub use config::RcloneConfig;
pub use drain::{DrainController, DrainOutcome, DrainPolicy};
pub use flags::ResolvedFlags;
pub use launcher::{CommandRunner, Launcher, TokioCommandRunner};
pub use mounter::{Mounter, SystemMounter};
pub use rc::{RcClient, StatusSource};
pub use registry::{MountContext, MountRegistry};
pub use secret::{DirSecretStore, MemorySecretStore, SecretStore};

/// Name reported by `GetPluginInfo`.
pub const PLUGIN_NAME: &str = "csi-rclone";

/// Flag added for read-only publish requests.
const READ_ONLY_FLAG: &str = "read-only";

/// Concrete CSI node backend that mounts rclone remotes.
///
/// # Thread safety
///
/// The only shared mutable state is the [`MountRegistry`].  Requests for
/// different target paths run concurrently; a draining unpublish holds no
/// lock while it waits.
pub struct RcloneBackend {
    config: RcloneConfig,
    secrets: Arc<dyn SecretStore>,
    runner: Arc<dyn CommandRunner>,
    launcher: Launcher,
    registry: MountRegistry,
    drain: DrainController,
    mounter: Arc<dyn Mounter>,
}

impl RcloneBackend {
    /// Backend talking to the real system: `tokio::process`, the rc HTTP
    /// API and the kernel mount table.
    pub fn new(config: RcloneConfig, secrets: Arc<dyn SecretStore>) -> Result<Self, CsiError> {
        let status = Arc::new(RcClient::new(config.rpc_timeout)?);
        Ok(Self::from_parts(
            config,
            secrets,
            Arc::new(TokioCommandRunner),
            status,
            Arc::new(SystemMounter),
        ))
    }

    /// Backend with explicit collaborators.
    pub fn from_parts(
        config: RcloneConfig,
        secrets: Arc<dyn SecretStore>,
        runner: Arc<dyn CommandRunner>,
        status: Arc<dyn StatusSource>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let launcher = Launcher::new(
            config.rclone_binary.clone(),
            config.cache_root.clone(),
            Arc::clone(&runner),
        );
        let drain = DrainController::new(status, config.drain, config.cache_root.clone());
        Self {
            config,
            secrets,
            runner,
            launcher,
            registry: MountRegistry::new(),
            drain,
            mounter,
        }
    }

    pub fn config(&self) -> &RcloneConfig {
        &self.config
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    /// Unmount `target` if the mount table still lists it (or it is a dead
    /// FUSE mount).
    async fn unmount_if_mounted(&self, target: &Path) -> Result<bool, CsiError> {
        let mounted = self.mounter.is_mountpoint(target).await;
        let corrupted = self.mounter.is_corrupted(target).await;
        if !mounted && !corrupted {
            return Ok(false);
        }
        self.mounter.unmount(target).await?;
        Ok(true)
    }
}

/// Target paths must be absolute with no `.`/`..` segments; they key the
/// registry and name a directory under the cache root.
fn checked_target_path<'a>(op: &str, target_path: &'a str) -> Result<&'a Path, CsiError> {
    if target_path.is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "{op} target path must be provided"
        )));
    }
    let path = Path::new(target_path);
    if !config::is_plain_absolute(path) {
        return Err(CsiError::InvalidArgument(format!(
            "{op} target path must be absolute without `.`/`..` segments: {target_path}"
        )));
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for RcloneBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Healthy when the rclone binary can be executed.
        let args = ["version".to_owned()];
        match self.runner.run(&self.config.rclone_binary, &args).await {
            Ok(out) => Ok(out.success),
            Err(e) => {
                warn!(binary = %self.config.rclone_binary.display(), error = %e, "rclone not runnable");
                Ok(false)
            }
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for RcloneBackend {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        debug!(volume_id = %req.volume_id, "stage is a no-op");
        Ok(())
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), CsiError> {
        debug!(%volume_id, "unstage is a no-op");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let target = checked_target_path("NodePublishVolume", &req.target_path)?;

        let mounted = self.mounter.is_mountpoint(target).await;
        let corrupted = self.mounter.is_corrupted(target).await;
        if mounted || corrupted {
            if !corrupted && self.mounter.is_healthy(target).await {
                debug!("already mounted to target");
                return Ok(());
            }
            warn!(corrupted, "existing mount is unreadable, unmounting before remount");
            self.mounter.unmount(target).await?;
        }

        let mut resolved =
            flags::resolve(&req.volume_context, &*self.secrets, &self.config.default_secret)
                .await
                .inspect_err(|e| warn!(error = %e, "storage parameter error"))?;
        resolved.merge_mount_flags(&req.volume_capability.mount_flags);
        if req.read_only || req.volume_capability.access_mode == AccessMode::ReadOnlyMany {
            resolved.flags.entry(READ_ONLY_FLAG.to_owned()).or_default();
        }

        info!(state = "Mounting", remote = %resolved.remote, remote_path = %resolved.remote_path);
        let rc_port = self.launcher.launch(&resolved, target).await?;
        self.registry
            .set(target, MountContext { rc_port })
            .await;

        let mounts = self.registry.len().await;
        info!(
            state = "Mounted",
            rc_port,
            mounts,
            "volume published"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        let target = checked_target_path("NodeUnpublishVolume", target_path)?;

        let ctx = self.registry.get(target).await;
        info!(state = "Draining", rc_port = ctx.rc_port);
        let outcome = self.drain.drain_and_clean(target, ctx.rc_port).await;

        // Cleared before unmounting so a retried unpublish does not drain a
        // daemon that is already gone.
        self.registry.delete(target).await;
        let mounts = self.registry.len().await;
        debug!(mounts, "mount context cleared");

        if self.unmount_if_mounted(target).await? {
            info!(state = "Unpublished", ?outcome, "volume unmounted");
        } else {
            debug!(state = "Unpublished", ?outcome, "volume not mounted");
        }
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: self.config.max_volumes,
        })
    }
}
