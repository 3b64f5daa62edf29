//! 端点凭证解析
//!
//! 根据 `EndpointConfig` 的连接安全模式生成通道级 TLS 配置：
//! - `PlainText`：不加密
//! - `ServerSideTLS`：信任配置的服务端证书；未配置时通过一次性握手获取对端证书
//! - `MutualTLS`：客户端证书 + 私钥 + CA，双向认证
//!
//! 每次创建连接都会重新解析，不做缓存。

use crate::error::IpcError;
use edge_config::{ConnectionSecurity, EndpointConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// 获取对端证书的握手超时
const PEER_CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(10);

/// 解析后的通道凭证。
#[derive(Debug, Clone)]
pub struct Credentials {
    /// TLS 客户端配置，明文连接时为空
    pub tls: Option<Arc<ClientConfig>>,
    /// 需要到期监控的证书
    pub certificates: Vec<CertificateDer<'static>>,
}

impl Credentials {
    pub fn plain_text() -> Self {
        Self {
            tls: None,
            certificates: Vec::new(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// 进程内统一使用 ring 作为加密后端。
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 解析端点的通道凭证。
pub async fn resolve_credentials(endpoint: &EndpointConfig) -> Result<Credentials, IpcError> {
    endpoint.validate()?;

    match endpoint.connection_type {
        ConnectionSecurity::PlainText => Ok(Credentials::plain_text()),
        ConnectionSecurity::ServerSideTls => {
            let trusted = match &endpoint.server_certificate {
                Some(path) => load_certificates(path)?,
                None => {
                    info!(
                        target: "edge.ipc",
                        address = %endpoint.address_str(),
                        "fetching_peer_certificate"
                    );
                    vec![fetch_peer_certificate(endpoint).await?]
                }
            };
            let verifier = PinnedServerCertVerifier::new(trusted.clone(), crypto_provider());
            let config = client_builder()?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth();
            Ok(Credentials {
                tls: Some(Arc::new(config)),
                certificates: trusted,
            })
        }
        ConnectionSecurity::MutualTls => {
            let ca = load_certificates(required(&endpoint.ca_certificate, "CaCertificate")?)?;
            let chain =
                load_certificates(required(&endpoint.client_certificate, "ClientCertificate")?)?;
            let key =
                load_private_key(required(&endpoint.client_private_key, "ClientPrivateKey")?)?;

            let roots = root_store(&ca)?;
            let config = client_builder()?
                .with_root_certificates(roots)
                .with_client_auth_cert(chain.clone(), key)
                .map_err(|e| IpcError::Credentials(format!("client config error: {}", e)))?;

            let mut certificates = ca;
            certificates.extend(chain);
            Ok(Credentials {
                tls: Some(Arc::new(config)),
                certificates,
            })
        }
    }
}

/// 一次性 TLS 握手，返回对端出示的叶证书。
pub async fn fetch_peer_certificate(
    endpoint: &EndpointConfig,
) -> Result<CertificateDer<'static>, IpcError> {
    let config = client_builder()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(crypto_provider())))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = server_name(&endpoint.address)?;
    let address = endpoint.address_str();

    let handshake = async {
        let tcp = TcpStream::connect(&address).await?;
        let tls = connector.connect(server_name, tcp).await?;
        let (_, session) = tls.get_ref();
        Ok::<_, std::io::Error>(
            session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|cert| cert.clone().into_owned()),
        )
    };

    match tokio::time::timeout(PEER_CERTIFICATE_TIMEOUT, handshake).await {
        Ok(Ok(Some(cert))) => Ok(cert),
        Ok(Ok(None)) => Err(IpcError::Credentials(format!(
            "server {} did not present a certificate",
            address
        ))),
        Ok(Err(e)) => Err(IpcError::Credentials(format!(
            "unable to obtain certificate from server {}: {}",
            address, e
        ))),
        Err(_) => Err(IpcError::Credentials(format!(
            "timeout obtaining certificate from server {}",
            address
        ))),
    }
}

/// 本进程托管服务端的 TLS 配置，明文时为 `None`。
///
/// 双向 TLS 下客户端必须出示由 CA 签发的证书。
pub fn server_tls_config(endpoint: &EndpointConfig) -> Result<Option<Arc<ServerConfig>>, IpcError> {
    endpoint.validate()?;

    let builder = || {
        ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| IpcError::Credentials(format!("server config error: {}", e)))
    };

    let config = match endpoint.connection_type {
        ConnectionSecurity::PlainText => return Ok(None),
        ConnectionSecurity::ServerSideTls => {
            let chain =
                load_certificates(required(&endpoint.server_certificate, "ServerCertificate")?)?;
            let key =
                load_private_key(required(&endpoint.server_private_key, "ServerPrivateKey")?)?;
            builder()?
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .map_err(|e| IpcError::Credentials(format!("server config error: {}", e)))?
        }
        ConnectionSecurity::MutualTls => {
            let chain =
                load_certificates(required(&endpoint.server_certificate, "ServerCertificate")?)?;
            let key =
                load_private_key(required(&endpoint.server_private_key, "ServerPrivateKey")?)?;
            let ca = load_certificates(required(&endpoint.ca_certificate, "CaCertificate")?)?;
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(&ca)?), crypto_provider())
                    .build()
                    .map_err(|e| IpcError::Credentials(format!("client verifier error: {}", e)))?;
            builder()?
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
                .map_err(|e| IpcError::Credentials(format!("server config error: {}", e)))?
        }
    };
    Ok(Some(Arc::new(config)))
}

/// 读取 PEM 证书文件（可含证书链）。
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, IpcError> {
    let pem = std::fs::read(path).map_err(|e| {
        IpcError::Credentials(format!("unable to read certificate {}: {}", path.display(), e))
    })?;
    let certificates = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            IpcError::Credentials(format!("failed to parse certificates {}: {}", path.display(), e))
        })?;
    if certificates.is_empty() {
        return Err(IpcError::Credentials(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certificates)
}

/// 读取 PEM 私钥文件。
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, IpcError> {
    let pem = std::fs::read(path).map_err(|e| {
        IpcError::Credentials(format!("unable to read private key {}: {}", path.display(), e))
    })?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|e| {
        IpcError::Credentials(format!("failed to parse private key {}: {}", path.display(), e))
    })
}

pub(crate) fn server_name(address: &str) -> Result<ServerName<'static>, IpcError> {
    ServerName::try_from(address.to_string())
        .map_err(|e| IpcError::Credentials(format!("invalid server name {}: {}", address, e)))
}

fn client_builder()
-> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>, IpcError> {
    ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| IpcError::Credentials(format!("client config error: {}", e)))
}

fn root_store(certificates: &[CertificateDer<'static>]) -> Result<RootCertStore, IpcError> {
    let mut roots = RootCertStore::empty();
    for cert in certificates {
        roots
            .add(cert.clone())
            .map_err(|e| IpcError::Credentials(format!("failed to add CA certificate: {}", e)))?;
    }
    Ok(roots)
}

fn required<'a>(file: &'a Option<PathBuf>, key: &str) -> Result<&'a Path, IpcError> {
    file.as_deref()
        .ok_or_else(|| IpcError::Credentials(format!("{} is not configured", key)))
}

/// 只信任固定证书：对端证书链中须出现被信任的证书。
#[derive(Debug)]
struct PinnedServerCertVerifier {
    trusted: Vec<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerCertVerifier {
    fn new(trusted: Vec<CertificateDer<'static>>, provider: Arc<CryptoProvider>) -> Self {
        Self { trusted, provider }
    }
}

impl ServerCertVerifier for PinnedServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let pinned = std::iter::once(end_entity)
            .chain(intermediates.iter())
            .any(|presented| {
                self.trusted
                    .iter()
                    .any(|trusted| trusted.as_ref() == presented.as_ref())
            });
        if pinned {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(target: "edge.ipc", "server_certificate_not_trusted");
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// 仅用于获取对端证书的一次性握手，不校验证书。
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
