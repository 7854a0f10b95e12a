//! # csi-rclone
//!
//! CSI node plugin that mounts rclone remotes into Pods.  One instance runs
//! on every worker node and serves Identity and Node requests over QUIC.
//!
//! Every option can also be set from the environment (`CSI_RCLONE_*`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libcsi::backend::rclone::{DirSecretStore, DrainPolicy, RcloneBackend, RcloneConfig};
use libcsi::transport::server::CsiServer;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// rclone CSI node plugin
#[derive(Parser, Debug)]
#[command(name = "csi-rclone")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address the QUIC endpoint binds to
    #[arg(long, env = "CSI_RCLONE_LISTEN", default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// PEM certificate chain presented to clients
    #[arg(long, env = "CSI_RCLONE_TLS_CERT", value_name = "FILE")]
    tls_cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "CSI_RCLONE_TLS_KEY", value_name = "FILE")]
    tls_key: PathBuf,

    /// Directory holding one sub-directory per secret, one file per key
    #[arg(
        long,
        env = "CSI_RCLONE_SECRETS_DIR",
        value_name = "DIR",
        default_value = "/etc/csi-rclone/secrets"
    )]
    secrets_dir: PathBuf,

    /// Node identifier (default: hostname)
    #[arg(long, env = "CSI_RCLONE_NODE_ID")]
    node_id: Option<String>,

    /// rclone executable
    #[arg(long, env = "CSI_RCLONE_BINARY", default_value = "rclone")]
    rclone_binary: PathBuf,

    /// Root of the per-mount VFS cache directories
    #[arg(long, env = "CSI_RCLONE_CACHE_ROOT", default_value = "/tmp/rclone-vfs-cache")]
    cache_root: PathBuf,

    /// Secret consulted when a volume names none
    #[arg(long, env = "CSI_RCLONE_DEFAULT_SECRET", default_value = "rclone-secret")]
    default_secret: String,

    /// Longest time unpublish waits for pending uploads
    #[arg(long, env = "CSI_RCLONE_DRAIN_TIMEOUT", default_value = "1h")]
    drain_timeout: humantime::Duration,

    /// Delay between drain polls
    #[arg(long, env = "CSI_RCLONE_DRAIN_POLL_INTERVAL", default_value = "5s")]
    drain_poll_interval: humantime::Duration,

    /// Timeout of a single rc status request
    #[arg(long, env = "CSI_RCLONE_RPC_TIMEOUT", default_value = "10s")]
    rpc_timeout: humantime::Duration,

    /// Volume limit advertised by NodeGetInfo
    #[arg(long, env = "CSI_RCLONE_MAX_VOLUMES", default_value_t = 256)]
    max_volumes: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "CSI_RCLONE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CSI_RCLONE_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn backend_config(&self) -> RcloneConfig {
        let mut config = RcloneConfig {
            rclone_binary: self.rclone_binary.clone(),
            cache_root: self.cache_root.clone(),
            default_secret: self.default_secret.clone(),
            drain: DrainPolicy {
                timeout: self.drain_timeout.into(),
                poll_interval: self.drain_poll_interval.into(),
            },
            rpc_timeout: self.rpc_timeout.into(),
            max_volumes: self.max_volumes,
            ..RcloneConfig::default()
        };
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json)?;

    let tls = server_tls_config(&cli.tls_cert, &cli.tls_key)?;
    let config = cli.backend_config();
    info!(
        node_id = %config.node_id,
        rclone = %config.rclone_binary.display(),
        cache_root = %config.cache_root.display(),
        secrets_dir = %cli.secrets_dir.display(),
        "starting csi-rclone"
    );

    let secrets = Arc::new(DirSecretStore::new(&cli.secrets_dir));
    let backend = Arc::new(RcloneBackend::new(config, secrets).context("build rclone backend")?);
    let server = CsiServer::new(cli.listen, tls, backend).context("start CSI server")?;

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        res = server.serve() => res.context("CSI server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = terminate.recv() => info!("terminated, shutting down"),
    }
    server.close();
    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

/// TLS 1.3 server configuration from PEM files.
fn server_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .with_context(|| format!("read certificate {}", cert_path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in {}", cert_path.display());
    }
    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("read private key {}", key_path.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("load server certificate")?;
    Ok(config)
}
