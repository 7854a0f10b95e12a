//! QUIC round trips between `CsiClient` and `CsiServer`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libcsi::transport::client::CsiClient;
use libcsi::transport::server::CsiServer;
use libcsi::*;
use rcgen::CertifiedKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

const SERVER_NAME: &str = "csi.test";

/// Node whose unpublish takes a while, like a drain in progress.
struct SlowNode;

#[async_trait]
impl CsiIdentity for SlowNode {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: "csi-rclone".into(),
            vendor_version: "test".into(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl CsiNode for SlowNode {
    async fn stage_volume(&self, _req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        Ok(())
    }

    async fn unstage_volume(&self, _: &VolumeId, _: &str) -> Result<(), CsiError> {
        Ok(())
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_context.contains_key("remote") {
            Ok(())
        } else {
            Err(CsiError::InvalidArgument(
                "missing volume context value: remote".into(),
            ))
        }
    }

    async fn unpublish_volume(&self, _: &VolumeId, _: &str) -> Result<(), CsiError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: "node-a".into(),
            max_volumes: 256,
        })
    }
}

fn tls_configs() -> (rustls::ServerConfig, rustls::ClientConfig) {
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()]).expect("self-sign");
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("server protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("server cert");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).expect("add root");
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("client protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    (server, client)
}

async fn start() -> (Arc<CsiServer<SlowNode>>, CsiClient) {
    let (server_tls, client_tls) = tls_configs();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = Arc::new(CsiServer::new(bind, server_tls, Arc::new(SlowNode)).expect("server"));
    let addr = server.local_addr().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await });
    }
    let client = CsiClient::connect(addr, SERVER_NAME, client_tls)
        .await
        .expect("connect");
    (server, client)
}

#[tokio::test]
async fn identity_and_node_requests() {
    let (server, client) = start().await;

    let resp = client.request(&CsiMessage::Probe).await.unwrap();
    assert!(matches!(resp, CsiMessage::ProbeResult(true)));

    let resp = client.request(&CsiMessage::GetPluginInfo).await.unwrap();
    let CsiMessage::PluginInfoResponse(info) = resp else {
        panic!("unexpected response {resp}");
    };
    assert_eq!(info.name, "csi-rclone");

    let resp = client.request(&CsiMessage::GetNodeInfo).await.unwrap();
    assert!(matches!(resp, CsiMessage::NodeInfoResponse(ref n) if n.node_id == "node-a"));

    client.close().await;
    server.close();
}

#[tokio::test]
async fn errors_travel_as_messages() {
    let (server, client) = start().await;

    let req = NodePublishVolumeRequest {
        volume_id: "pv-1".into(),
        target_path: "/mnt/pv-1".into(),
        volume_capability: VolumeCapability::default(),
        read_only: false,
        volume_context: Default::default(),
    };
    let resp = client
        .request(&CsiMessage::PublishVolume(req))
        .await
        .unwrap();
    let CsiMessage::Error(err) = resp else {
        panic!("unexpected response {resp}");
    };
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    // Response variants are rejected as requests.
    let resp = client.request(&CsiMessage::Ok).await.unwrap();
    assert!(matches!(resp, CsiMessage::Error(CsiError::InvalidArgument(_))));

    client.close().await;
    server.close();
}

#[tokio::test]
async fn slow_unpublish_does_not_block_other_requests() {
    let (server, client) = start().await;
    let client = Arc::new(client);

    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .request(&CsiMessage::UnpublishVolume {
                    volume_id: "pv-1".into(),
                    target_path: "/mnt/pv-1".into(),
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    let resp = client.request(&CsiMessage::Probe).await.unwrap();
    assert!(matches!(resp, CsiMessage::ProbeResult(true)));
    assert!(start.elapsed() < Duration::from_millis(400));

    let resp = slow.await.unwrap().unwrap();
    assert!(matches!(resp, CsiMessage::Ok));

    client.close().await;
    server.close();
}
