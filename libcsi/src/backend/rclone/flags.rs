//! Volume parameter resolution.
//!
//! Effective mount parameters come from three layers, lowest precedence
//! first: the default secret (only when the volume names none), the secret
//! named by `secretName`, and the volume context itself.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use super::secret::SecretStore;
use crate::error::CsiError;

pub const KEY_REMOTE: &str = "remote";
pub const KEY_REMOTE_PATH: &str = "remotePath";
pub const KEY_REMOTE_PATH_SUFFIX: &str = "remotePathSuffix";
pub const KEY_CONFIG_DATA: &str = "configData";
pub const KEY_SECRET_NAME: &str = "secretName";
pub const KEY_RC_ADDR: &str = "rc-addr";

/// Keys consumed by the plugin and never forwarded to rclone verbatim.
const RESERVED_KEYS: [&str; 6] = [
    KEY_REMOTE,
    KEY_REMOTE_PATH,
    KEY_REMOTE_PATH_SUFFIX,
    KEY_CONFIG_DATA,
    KEY_SECRET_NAME,
    KEY_RC_ADDR,
];

/// Mount parameters after merging and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFlags {
    /// Backend type or configured remote name.
    pub remote: String,
    /// Path within the remote, suffix already applied.
    pub remote_path: String,
    /// Inline rclone config text, if any.
    pub config_data: Option<String>,
    /// Explicit control endpoint override (`host:port`).
    pub rc_addr: Option<String>,
    /// Passthrough rclone flags; an empty value is a boolean flag.
    pub flags: BTreeMap<String, String>,
}

impl ResolvedFlags {
    /// Add the capability's mount flags (`key`, `key=value`, optionally
    /// `--`-prefixed) as rclone flags.
    ///
    /// Keys already set by the secret or the volume context keep their
    /// value; reserved keys are ignored.
    pub fn merge_mount_flags(&mut self, mount_flags: &[String]) {
        for raw in mount_flags {
            let raw = raw.trim();
            let raw = raw.strip_prefix("--").unwrap_or(raw);
            let (key, value) = raw.split_once('=').unwrap_or((raw, ""));
            if key.is_empty() || RESERVED_KEYS.contains(&key) {
                continue;
            }
            self.flags
                .entry(key.to_owned())
                .or_insert_with(|| value.to_owned());
        }
    }
}

/// Merge secrets and the volume context into [`ResolvedFlags`].
///
/// Fails with `InvalidArgument` when `remote` or `remotePath` is missing and
/// with `Internal` when an explicitly named secret cannot be loaded.
pub async fn resolve(
    volume_context: &HashMap<String, String>,
    store: &dyn SecretStore,
    default_secret: &str,
) -> Result<ResolvedFlags, CsiError> {
    let mut merged: HashMap<String, String> = HashMap::new();

    let secret = match volume_context.get(KEY_SECRET_NAME) {
        Some(name) => {
            debug!(secret = %name, "loading connection defaults from named secret");
            match store.get(name).await {
                Ok(Some(secret)) => Some(secret),
                Ok(None) => {
                    return Err(CsiError::Internal(format!(
                        "can't load csi-rclone settings from secret {name}: not found"
                    )));
                }
                Err(e) => {
                    return Err(CsiError::Internal(format!(
                        "can't load csi-rclone settings from secret {name}: {e}"
                    )));
                }
            }
        }
        None => match store.get(default_secret).await {
            Ok(secret) => secret,
            Err(e) => {
                warn!(secret = default_secret, error = %e, "default secret unavailable");
                None
            }
        },
    };

    match secret {
        Some(secret) if !secret.is_empty() => {
            for (k, v) in secret {
                merged.insert(k, String::from_utf8_lossy(&v).into_owned());
            }
        }
        _ => info!("no csi-rclone connection defaults secret found"),
    }

    // Volume context overrides secret values key for key.
    merged.extend(volume_context.iter().map(|(k, v)| (k.clone(), v.clone())));

    let remote = merged
        .get(KEY_REMOTE)
        .cloned()
        .ok_or_else(|| missing(KEY_REMOTE))?;
    let mut remote_path = merged
        .get(KEY_REMOTE_PATH)
        .cloned()
        .ok_or_else(|| missing(KEY_REMOTE_PATH))?;
    if let Some(suffix) = merged.get(KEY_REMOTE_PATH_SUFFIX) {
        remote_path.push_str(suffix);
    }

    let config_data = merged
        .get(KEY_CONFIG_DATA)
        .filter(|data| !data.is_empty())
        .cloned();
    let rc_addr = merged.get(KEY_RC_ADDR).cloned();

    let flags = merged
        .into_iter()
        .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
        .collect();

    Ok(ResolvedFlags {
        remote,
        remote_path,
        config_data,
        rc_addr,
        flags,
    })
}

fn missing(key: &str) -> CsiError {
    CsiError::InvalidArgument(format!("missing volume context value: {key}"))
}
