//! Launching `rclone mount` as a detached daemon.
//!
//! The launcher picks the control endpoint itself, so the port it returns is
//! known before the daemon is even started.  The mount process forks away
//! and is never supervised afterwards.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::config::vfs_cache_dir;
use super::flags::ResolvedFlags;
use crate::error::CsiError;

/// Host used when no `rc-addr` override is given.
pub const LOOPBACK_HOST: &str = "localhost";

/// Host used when an `rc-addr` override leaves the host empty.
const ALL_INTERFACES: &str = "0.0.0.0";

/// Control endpoint of one mount process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcEndpoint {
    pub host: String,
    pub port: u16,
}

impl RcEndpoint {
    /// Resolve the endpoint from an optional `host:port` override.
    ///
    /// An empty host means all interfaces and an empty port means a fresh
    /// ephemeral port; without an override a free port on loopback is used.
    pub async fn resolve(rc_addr: Option<&str>) -> Result<Self, CsiError> {
        let Some(rc_addr) = rc_addr else {
            return Ok(Self {
                host: LOOPBACK_HOST.to_owned(),
                port: free_port().await?,
            });
        };

        debug!(rc_addr, "processing user provided rc-addr");
        let (host, port) = split_host_port(rc_addr).ok_or_else(|| {
            CsiError::InvalidArgument(format!("invalid rc-addr format: {rc_addr}"))
        })?;
        let host = if host.is_empty() {
            ALL_INTERFACES.to_owned()
        } else {
            host.to_owned()
        };
        let port = if port.is_empty() {
            free_port().await?
        } else {
            port.parse::<u16>().map_err(|e| {
                CsiError::InvalidArgument(format!("invalid rc-addr port: {port}: {e}"))
            })?
        };
        Ok(Self { host, port })
    }

    /// `host:port` as passed to `--rc-addr`.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Split `host:port`, accepting `[v6]:port`.  Either side may be empty.
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host, port));
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}

/// Ask the OS for an unused TCP port on loopback.
///
/// The listener is dropped before rclone binds, so another process could
/// grab the port in between.
pub async fn free_port() -> Result<u16, CsiError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| CsiError::Internal(format!("allocate rc port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| CsiError::Internal(format!("allocate rc port: {e}")))?
        .port();
    Ok(port)
}

/// Tunables applied unless the volume sets the same key.
pub fn default_flags(endpoint: &RcEndpoint, cache_dir: &Path) -> Vec<(&'static str, String)> {
    vec![
        ("cache-info-age", "72h".to_owned()),
        ("cache-chunk-clean-interval", "15m".to_owned()),
        ("dir-cache-time", "5s".to_owned()),
        ("vfs-cache-mode", "writes".to_owned()),
        ("cache-dir", cache_dir.to_string_lossy().into_owned()),
        ("allow-non-empty", "true".to_owned()),
        ("allow-other", "true".to_owned()),
        ("rc", String::new()),
        ("rc-addr", endpoint.addr()),
    ]
}

/// `name:path` when `config_data` defines a `[name]` section, otherwise the
/// anonymous backend form `:backend:path`.
pub fn remote_reference(remote: &str, remote_path: &str, config_data: Option<&str>) -> String {
    let section = format!("[{remote}]");
    match config_data {
        Some(config) if config.contains(&section) => format!("{remote}:{remote_path}"),
        _ => format!(":{remote}:{remote_path}"),
    }
}

fn push_flag(args: &mut Vec<String>, key: &str, value: &str) {
    if value.is_empty() {
        args.push(format!("--{key}"));
    } else {
        args.push(format!("--{key}={value}"));
    }
}

/// Full `rclone` argument list for one mount.
pub fn build_args(
    remote_ref: &str,
    target_path: &Path,
    config_file: Option<&Path>,
    defaults: &[(&'static str, String)],
    resolved: &ResolvedFlags,
) -> Vec<String> {
    let mut args = vec![
        "mount".to_owned(),
        remote_ref.to_owned(),
        target_path.to_string_lossy().into_owned(),
        "--daemon".to_owned(),
        "--daemon-wait=0".to_owned(),
    ];

    match config_file {
        Some(path) => {
            args.push("--config".to_owned());
            args.push(path.to_string_lossy().into_owned());
        }
        // An empty config path silences rclone's "config file not found" notice.
        None => args.push("--config=".to_owned()),
    }

    for (key, value) in defaults {
        if !resolved.flags.contains_key(*key) {
            push_flag(&mut args, key, value);
        }
    }
    for (key, value) in &resolved.flags {
        push_flag(&mut args, key, value);
    }
    args
}

/// Result of running an external command to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput> {
        let out = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            success: out.status.success(),
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// Persist inline config text for the daemon to read.
///
/// The file is kept on purpose: `rclone mount --daemon` forks and the child
/// re-reads the config after this call has returned.  Files are created
/// with mode `0600` in the system temp directory and left to its cleanup.
fn write_config_file(config_data: &str) -> Result<PathBuf, CsiError> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("rclone")
        .suffix(".conf")
        .tempfile()
        .map_err(|e| CsiError::Internal(format!("create rclone config file: {e}")))?;
    file.write_all(config_data.as_bytes())
        .map_err(|e| CsiError::Internal(format!("write rclone config file: {e}")))?;
    let (_, path) = file
        .keep()
        .map_err(|e| CsiError::Internal(format!("keep rclone config file: {e}")))?;
    Ok(path)
}

fn io_error(context: &str, path: &Path, e: io::Error) -> CsiError {
    let message = format!("{context} {}: {e}", path.display());
    if e.kind() == io::ErrorKind::PermissionDenied {
        CsiError::PermissionDenied(message)
    } else {
        CsiError::Internal(message)
    }
}

/// Starts rclone mount daemons.
pub struct Launcher {
    binary: PathBuf,
    cache_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl Launcher {
    pub fn new(
        binary: impl Into<PathBuf>,
        cache_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            binary: binary.into(),
            cache_root: cache_root.into(),
            runner,
        }
    }

    /// Mount `resolved` at `target_path` and return the control port.
    ///
    /// Blocks until `rclone` has daemonized; there is no timeout.
    #[instrument(skip(self, resolved), fields(remote = %resolved.remote))]
    pub async fn launch(
        &self,
        resolved: &ResolvedFlags,
        target_path: &Path,
    ) -> Result<u16, CsiError> {
        let cache_dir = vfs_cache_dir(&self.cache_root, target_path).ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "target path must be absolute without `.`/`..` segments: {}",
                target_path.display()
            ))
        })?;
        let endpoint = RcEndpoint::resolve(resolved.rc_addr.as_deref()).await?;
        debug!(rc_addr = %endpoint.addr(), "using rclone rc endpoint");

        let defaults = default_flags(&endpoint, &cache_dir);
        let remote_ref = remote_reference(
            &resolved.remote,
            &resolved.remote_path,
            resolved.config_data.as_deref(),
        );
        let config_file = resolved
            .config_data
            .as_deref()
            .map(write_config_file)
            .transpose()?;
        let args = build_args(
            &remote_ref,
            target_path,
            config_file.as_deref(),
            &defaults,
            resolved,
        );

        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(target_path)
            .await
            .map_err(|e| io_error("create target dir", target_path, e))?;

        info!(
            cmd = %self.binary.display(),
            remote = %remote_ref,
            target_path = %target_path.display(),
            "executing mount command",
        );
        debug!(?args, "mount arguments");

        let out = self
            .runner
            .run(&self.binary, &args)
            .await
            .map_err(|e| io_error("spawn", &self.binary, e))?;
        if !out.success {
            return Err(CsiError::MountFailed {
                path: target_path.display().to_string(),
                reason: format!(
                    "exit code {:?} cmd: '{}' remote: '{}' stdout: {:?} stderr: {:?}",
                    out.code,
                    self.binary.display(),
                    remote_ref,
                    out.stdout.trim(),
                    out.stderr.trim(),
                ),
            });
        }

        Ok(endpoint.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    fn resolved(flags: &[(&str, &str)]) -> ResolvedFlags {
        ResolvedFlags {
            remote: "s3".into(),
            remote_path: "bucket/dir".into(),
            config_data: None,
            rc_addr: None,
            flags: flags
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _program: &Path, args: &[String]) -> io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(match &self.fail_with {
                Some(stderr) => CommandOutput {
                    success: false,
                    code: Some(1),
                    stdout: "Starting mount\n".into(),
                    stderr: stderr.clone(),
                },
                None => CommandOutput {
                    success: true,
                    code: Some(0),
                    ..Default::default()
                },
            })
        }
    }

    #[tokio::test]
    async fn endpoint_defaults_to_loopback_free_port() {
        let ep = RcEndpoint::resolve(None).await.unwrap();
        assert_eq!(ep.host, "localhost");
        assert_ne!(ep.port, 0);
    }

    #[tokio::test]
    async fn endpoint_override() {
        let ep = RcEndpoint::resolve(Some("127.0.0.1:5572")).await.unwrap();
        assert_eq!(ep.addr(), "127.0.0.1:5572");

        let ep = RcEndpoint::resolve(Some(":5572")).await.unwrap();
        assert_eq!(ep.addr(), "0.0.0.0:5572");

        let ep = RcEndpoint::resolve(Some("10.0.0.1:")).await.unwrap();
        assert_eq!(ep.host, "10.0.0.1");
        assert_ne!(ep.port, 0);

        let ep = RcEndpoint::resolve(Some("[::1]:5572")).await.unwrap();
        assert_eq!(ep.addr(), "[::1]:5572");
    }

    #[tokio::test]
    async fn malformed_endpoint_is_invalid_argument() {
        for bad in ["5572", "host:port", "a:b:c", "host:70000"] {
            let err = RcEndpoint::resolve(Some(bad)).await.unwrap_err();
            assert!(
                matches!(err, CsiError::InvalidArgument(_)),
                "{bad} -> {err:?}"
            );
        }
    }

    #[test]
    fn remote_reference_prefers_configured_profile() {
        assert_eq!(remote_reference("s3", "b/p", None), ":s3:b/p");
        assert_eq!(
            remote_reference("s3", "b/p", Some("[other]\ntype = s3\n")),
            ":s3:b/p"
        );
        assert_eq!(
            remote_reference("mys3", "b/p", Some("[mys3]\ntype = s3\n")),
            "mys3:b/p"
        );
    }

    #[test]
    fn caller_flags_suppress_defaults() {
        let target = Path::new("/mnt/vol");
        let ep = RcEndpoint {
            host: "localhost".into(),
            port: 40001,
        };
        let defaults = default_flags(&ep, Path::new("/tmp/rclone-vfs-cache/mnt/vol"));
        let flags = resolved(&[("cache-dir", "/custom"), ("read-only", "")]);
        let args = build_args(":s3:bucket/dir", target, None, &defaults, &flags);

        assert_eq!(
            &args[..6],
            &[
                "mount",
                ":s3:bucket/dir",
                "/mnt/vol",
                "--daemon",
                "--daemon-wait=0",
                "--config=",
            ]
        );
        assert!(args.contains(&"--cache-dir=/custom".to_owned()));
        assert!(!args.iter().any(|a| a.contains("rclone-vfs-cache")));
        assert!(args.contains(&"--rc".to_owned()));
        assert!(args.contains(&"--rc-addr=localhost:40001".to_owned()));
        assert!(args.contains(&"--read-only".to_owned()));
        assert!(args.contains(&"--vfs-cache-mode=writes".to_owned()));
        assert_eq!(args.iter().filter(|a| a.starts_with("--cache-dir")).count(), 1);
    }

    #[test]
    fn default_cache_dir_is_namespaced() {
        let ep = RcEndpoint {
            host: "localhost".into(),
            port: 1,
        };
        let cache_dir = vfs_cache_dir(Path::new("/tmp/rclone-vfs-cache"), Path::new("/mnt/a")).unwrap();
        let defaults = default_flags(&ep, &cache_dir);
        let (_, dir) = defaults.iter().find(|(k, _)| *k == "cache-dir").unwrap();
        assert_eq!(dir, "/tmp/rclone-vfs-cache/mnt/a");
    }

    #[tokio::test]
    async fn launch_writes_config_and_creates_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("pods/p/mount");
        let runner = Arc::new(RecordingRunner::default());
        let launcher = Launcher::new("rclone", tmp.path().join("cache"), runner.clone());

        let mut flags = resolved(&[]);
        flags.remote = "mys3".into();
        flags.config_data = Some("[mys3]\ntype = s3\n".into());
        flags.rc_addr = Some("127.0.0.1:5599".into());

        let port = launcher.launch(&flags, &target).await.unwrap();
        assert_eq!(port, 5599);

        let meta = std::fs::metadata(&target).unwrap();
        assert!(meta.is_dir());

        let calls = runner.calls.lock().unwrap();
        let args = &calls[0];
        assert_eq!(args[1], "mys3:bucket/dir");
        let idx = args.iter().position(|a| a == "--config").unwrap();
        let config_path = PathBuf::from(&args[idx + 1]);
        // Retained for the forked daemon.
        assert_eq!(
            std::fs::read_to_string(&config_path).unwrap(),
            "[mys3]\ntype = s3\n"
        );
        std::fs::remove_file(config_path).unwrap();
    }

    #[tokio::test]
    async fn failed_mount_reports_output() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner {
            fail_with: Some("Fatal error: unknown backend".into()),
            ..Default::default()
        });
        let launcher = Launcher::new("rclone", tmp.path().join("cache"), runner);
        let err = launcher
            .launch(&resolved(&[]), &tmp.path().join("t"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::StatusCode::Internal);
        let CsiError::MountFailed { path, reason } = err else {
            panic!("expected MountFailed, got {err:?}");
        };
        assert_eq!(path, tmp.path().join("t").display().to_string());
        assert!(reason.contains(":s3:bucket/dir"));
        assert!(reason.contains(r#"stdout: "Starting mount""#));
        assert!(reason.contains(r#"stderr: "Fatal error: unknown backend""#));
    }

    #[tokio::test]
    async fn traversing_target_launches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let launcher = Launcher::new("rclone", tmp.path().join("cache"), runner.clone());
        let target = tmp.path().join("cache/../victim");
        let err = launcher.launch(&resolved(&[]), &target).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
        assert!(!tmp.path().join("victim").exists());
    }

    #[tokio::test]
    async fn malformed_rc_addr_launches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let launcher = Launcher::new("rclone", tmp.path().join("cache"), runner.clone());
        let mut flags = resolved(&[]);
        flags.rc_addr = Some("nonsense".into());
        let err = launcher
            .launch(&flags, &tmp.path().join("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
