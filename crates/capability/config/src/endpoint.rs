use crate::ConfigError;
use crate::health::HealthProbeConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 证书到期预警天数默认值。
pub const DEFAULT_EXPIRATION_WARNING_PERIOD: i64 = 30;

/// 连接安全模式。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionSecurity {
    /// 明文
    #[default]
    PlainText,
    /// 仅服务端证书
    #[serde(rename = "ServerSideTLS")]
    ServerSideTls,
    /// 双向 TLS
    #[serde(rename = "MutualTLS")]
    MutualTls,
}

impl fmt::Display for ConnectionSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlainText => "PlainText",
            Self::ServerSideTls => "ServerSideTLS",
            Self::MutualTls => "MutualTLS",
        };
        f.write_str(name)
    }
}

impl FromStr for ConnectionSecurity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "plaintext" => Ok(Self::PlainText),
            "serversidetls" => Ok(Self::ServerSideTls),
            "mutualtls" => Ok(Self::MutualTls),
            _ => Err(format!(
                "{} is not a valid connection type, valid values are PlainText, ServerSideTLS, MutualTLS",
                value
            )),
        }
    }
}

/// IPC 服务端点配置。
///
/// 同一结构同时描述客户端视角（编排进程连接远端）与服务端视角（本进程托管服务），
/// 两者的证书要求由 `used_by_server` 区分。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub connection_type: ConnectionSecurity,
    #[serde(default)]
    pub client_certificate: Option<PathBuf>,
    #[serde(default)]
    pub client_private_key: Option<PathBuf>,
    #[serde(default)]
    pub server_certificate: Option<PathBuf>,
    #[serde(default)]
    pub server_private_key: Option<PathBuf>,
    #[serde(default)]
    pub ca_certificate: Option<PathBuf>,
    #[serde(default = "default_expiration_warning_period")]
    pub expiration_warning_period: i64,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub health_probe: Option<HealthProbeConfig>,
    #[serde(skip)]
    pub used_by_server: bool,
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_expiration_warning_period() -> i64 {
    DEFAULT_EXPIRATION_WARNING_PERIOD
}

impl EndpointConfig {
    /// 明文端点。
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            connection_type: ConnectionSecurity::PlainText,
            client_certificate: None,
            client_private_key: None,
            server_certificate: None,
            server_private_key: None,
            ca_certificate: None,
            expiration_warning_period: DEFAULT_EXPIRATION_WARNING_PERIOD,
            compression: false,
            health_probe: None,
            used_by_server: false,
        }
    }

    /// 从 JSON 服务端配置段解析。
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Document(e.to_string()))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        Self::deserialize(value).map_err(|e| ConfigError::Document(e.to_string()))
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionSecurity) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// 客户端证书、私钥与 CA（双向 TLS 客户端）。
    pub fn with_client_credentials(
        mut self,
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        ca_certificate: impl Into<PathBuf>,
    ) -> Self {
        self.client_certificate = Some(certificate.into());
        self.client_private_key = Some(private_key.into());
        self.ca_certificate = Some(ca_certificate.into());
        self
    }

    pub fn with_server_certificate(mut self, certificate: impl Into<PathBuf>) -> Self {
        self.server_certificate = Some(certificate.into());
        self
    }

    pub fn with_server_private_key(mut self, private_key: impl Into<PathBuf>) -> Self {
        self.server_private_key = Some(private_key.into());
        self
    }

    pub fn with_ca_certificate(mut self, ca_certificate: impl Into<PathBuf>) -> Self {
        self.ca_certificate = Some(ca_certificate.into());
        self
    }

    /// 标记为本进程托管的服务端端点。
    pub fn for_server(mut self) -> Self {
        self.used_by_server = true;
        self
    }

    pub fn address_str(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 校验端点配置。
    ///
    /// 证书与私钥文件必须在此时存在，连接建立前即失败。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Address".to_string(),
                "address for IPC server can not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "Port".to_string(),
                "0 is not a valid port number".to_string(),
            ));
        }

        match (self.connection_type, self.used_by_server) {
            (ConnectionSecurity::PlainText, _) => {}
            (ConnectionSecurity::ServerSideTls, true) => {
                self.require_file(&self.server_certificate, "ServerCertificate")?;
                self.require_file(&self.server_private_key, "ServerPrivateKey")?;
            }
            (ConnectionSecurity::ServerSideTls, false) => {
                // 未配置时从对端握手中获取
                if let Some(path) = &self.server_certificate {
                    check_exists(path, "ServerCertificate")?;
                }
            }
            (ConnectionSecurity::MutualTls, true) => {
                self.require_file(&self.server_certificate, "ServerCertificate")?;
                self.require_file(&self.server_private_key, "ServerPrivateKey")?;
                self.require_file(&self.ca_certificate, "CaCertificate")?;
            }
            (ConnectionSecurity::MutualTls, false) => {
                self.require_file(&self.client_certificate, "ClientCertificate")?;
                self.require_file(&self.client_private_key, "ClientPrivateKey")?;
                self.require_file(&self.ca_certificate, "CaCertificate")?;
            }
        }

        if let Some(probe) = &self.health_probe {
            probe.validate()?;
        }
        Ok(())
    }

    /// 需要到期监控的证书文件。
    pub fn monitored_certificates(&self) -> Vec<PathBuf> {
        let files = match (self.connection_type, self.used_by_server) {
            (ConnectionSecurity::PlainText, _) => Vec::new(),
            (ConnectionSecurity::ServerSideTls, _) => vec![self.server_certificate.clone()],
            (ConnectionSecurity::MutualTls, true) => {
                vec![self.server_certificate.clone(), self.ca_certificate.clone()]
            }
            (ConnectionSecurity::MutualTls, false) => {
                vec![self.ca_certificate.clone(), self.client_certificate.clone()]
            }
        };
        files.into_iter().flatten().collect()
    }

    fn require_file(&self, file: &Option<PathBuf>, key: &str) -> Result<(), ConfigError> {
        match file {
            Some(path) => check_exists(path, key),
            None => Err(ConfigError::Missing(format!(
                "{} for connection type {}",
                key, self.connection_type
            ))),
        }
    }
}

fn check_exists(path: &Path, key: &str) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(
            key.to_string(),
            format!("file {} does not exist", path.display()),
        ))
    }
}
