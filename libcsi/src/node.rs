//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a volume available to
//! Pod containers:
//!
//! 1. **Stage**: node-global preparation (a no-op for rclone).
//! 2. **Publish**: launch the mount process at the Pod's target path.
//! 3. **Unpublish**: drain pending write-back, then unmount.
//! 4. **Unstage**: node-global teardown (a no-op for rclone).

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume from the staging path.
    ///
    /// This is idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at `req.target_path`.
    ///
    /// This is idempotent: calling it again for the same healthy
    /// `target_path` should succeed without mounting twice.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// An error means the caller should retry; pending writes have already
    /// been drained by then.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
