//! # libcsi: CSI node plugin for rclone remotes
//!
//! `libcsi` implements a lightweight [Container Storage Interface][csi] node
//! plugin that exposes any remote supported by [rclone] as a Pod volume.
//! Requests travel over QUIC (via [`quinn`]) instead of gRPC.  Publishing a
//! volume launches `rclone mount` as a daemon; unpublishing waits for the
//! daemon's write-back cache to drain before unmounting.  Everything runs
//! on Tokio and logs through `tracing`.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, node requests. |
//! | [`error`] | [`CsiError`] enum and caller-facing [`StatusCode`]. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | Storage backends (rclone). |
//!
//! [csi]: https://github.com/container-storage-interface/spec
//! [rclone]: https://rclone.org

pub mod backend;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use error::{CsiError, StatusCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
