use async_trait::async_trait;
use domain::{AcknowledgmentPolicy, ReadResult};
use edge_config::{ConnectionSecurity, EndpointConfig};
use edge_ipc::wire::{Frame, ServiceKind};
use edge_ipc::{
    AdapterFactory, ConnectionManager, HostServices, IpcError, ProtocolAdapter, SessionHost,
    resolve_credentials,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// 测试用 CA 与由其签发的服务端 / 客户端证书。
struct Pki {
    ca: PathBuf,
    server_cert: PathBuf,
    server_key: PathBuf,
    client_cert: PathBuf,
    client_key: PathBuf,
}

fn issue(
    common_name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> (String, String) {
    let mut params = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
        .expect("certificate params");
    params.distinguished_name.push(DnType::CommonName, common_name);
    let key = KeyPair::generate().expect("key generation should succeed");
    let cert = params
        .signed_by(&key, ca_cert, ca_key)
        .expect("certificate signing should succeed");
    (cert.pem(), key.serialize_pem())
}

fn pki(name: &str) -> Pki {
    let dir = std::env::temp_dir().join(format!("edge-ipc-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "edge test ca");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().expect("key generation should succeed");
    let ca_cert = params.self_signed(&ca_key).expect("self-signed CA");

    let (server_pem, server_key_pem) = issue("edge host", &ca_cert, &ca_key);
    let (client_pem, client_key_pem) = issue("edge orchestrator", &ca_cert, &ca_key);

    let write = |file: &str, contents: &str| {
        let path = dir.join(file);
        std::fs::write(&path, contents).expect("write pem");
        path
    };
    Pki {
        ca: write("ca.pem", &ca_cert.pem()),
        server_cert: write("server.pem", &server_pem),
        server_key: write("server.key", &server_key_pem),
        client_cert: write("client.pem", &client_pem),
        client_key: write("client.key", &client_key_pem),
    }
}

struct EmptyAdapter;

#[async_trait]
impl ProtocolAdapter for EmptyAdapter {
    async fn read(&self, _sources: &BTreeMap<String, Vec<String>>) -> Result<ReadResult, IpcError> {
        Ok(ReadResult::default())
    }

    async fn close(&self) {}
}

struct EmptyAdapterFactory;

#[async_trait]
impl AdapterFactory for EmptyAdapterFactory {
    async fn create(
        &self,
        _configuration: &Value,
        _secrets: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ProtocolAdapter>, IpcError> {
        Ok(Arc::new(EmptyAdapter))
    }
}

async fn start_host(mut endpoint: EndpointConfig) -> (SessionHost, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    endpoint.port = port;
    let services = HostServices::default().with_adapter(Arc::new(EmptyAdapterFactory));
    let host = SessionHost::with_listener(listener, endpoint, services)
        .await
        .expect("host");
    (host, port)
}

fn initialize() -> Frame {
    Frame::Initialize {
        service: ServiceKind::Adapter,
        configuration: "{}".to_string(),
        secrets: BTreeMap::new(),
        target_id: None,
        policy: AcknowledgmentPolicy::none(),
    }
}

async fn initialize_over(endpoint: EndpointConfig) -> Result<Frame, IpcError> {
    let manager = ConnectionManager::new(endpoint);
    let connection = manager.acquire().await?;
    let reply = connection.call(&initialize()).await;
    manager.close().await;
    reply
}

fn initialized(reply: Frame) -> bool {
    matches!(reply, Frame::InitializeReply { initialized: true, .. })
}

#[tokio::test]
async fn server_side_tls_with_fetched_certificate() {
    let pki = pki("server-side-fetch");
    let server = EndpointConfig::new("127.0.0.1", 1)
        .with_connection_type(ConnectionSecurity::ServerSideTls)
        .with_server_certificate(&pki.server_cert)
        .with_server_private_key(&pki.server_key);
    let (host, port) = start_host(server).await;

    let client = EndpointConfig::new("127.0.0.1", port)
        .with_connection_type(ConnectionSecurity::ServerSideTls);
    let credentials = resolve_credentials(&client).await.expect("credentials");
    assert!(credentials.is_tls());
    assert_eq!(credentials.certificates.len(), 1);

    let reply = initialize_over(client).await.expect("tls call");
    assert!(initialized(reply));
    host.stop().await;
}

#[tokio::test]
async fn server_side_tls_with_configured_certificate() {
    let pki = pki("server-side-configured");
    let server = EndpointConfig::new("127.0.0.1", 1)
        .with_connection_type(ConnectionSecurity::ServerSideTls)
        .with_server_certificate(&pki.server_cert)
        .with_server_private_key(&pki.server_key);
    let (host, port) = start_host(server).await;

    let client = EndpointConfig::new("127.0.0.1", port)
        .with_connection_type(ConnectionSecurity::ServerSideTls)
        .with_server_certificate(&pki.server_cert);
    let reply = initialize_over(client).await.expect("tls call");
    assert!(initialized(reply));

    // 固定的是另一张证书时握手失败
    let other = EndpointConfig::new("127.0.0.1", port)
        .with_connection_type(ConnectionSecurity::ServerSideTls)
        .with_server_certificate(&pki.client_cert);
    let err = initialize_over(other).await.expect_err("untrusted server");
    assert!(matches!(err, IpcError::Connection(_)));
    host.stop().await;
}

#[tokio::test]
async fn mutual_tls_round_trip() {
    let pki = pki("mutual");
    let server = EndpointConfig::new("127.0.0.1", 1)
        .with_connection_type(ConnectionSecurity::MutualTls)
        .with_server_certificate(&pki.server_cert)
        .with_server_private_key(&pki.server_key)
        .with_ca_certificate(&pki.ca);
    let (host, port) = start_host(server).await;

    let client = EndpointConfig::new("127.0.0.1", port)
        .with_connection_type(ConnectionSecurity::MutualTls)
        .with_client_credentials(&pki.client_cert, &pki.client_key, &pki.ca);
    let credentials = resolve_credentials(&client).await.expect("credentials");
    // CA 与客户端证书都纳入到期监控
    assert_eq!(credentials.certificates.len(), 2);

    let reply = initialize_over(client).await.expect("mutual tls call");
    assert!(initialized(reply));
    host.stop().await;
}

#[tokio::test]
async fn mutual_tls_rejects_plain_client() {
    let pki = pki("mutual-plain");
    let server = EndpointConfig::new("127.0.0.1", 1)
        .with_connection_type(ConnectionSecurity::MutualTls)
        .with_server_certificate(&pki.server_cert)
        .with_server_private_key(&pki.server_key)
        .with_ca_certificate(&pki.ca);
    let (host, port) = start_host(server).await;

    let plain = EndpointConfig::new("127.0.0.1", port);
    assert!(initialize_over(plain).await.is_err());
    host.stop().await;
}
