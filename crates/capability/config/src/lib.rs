//! 进程配置与 IPC 端点配置加载。
//!
//! - `AppConfig`：从环境变量读取会话宿主进程的运行配置
//! - `EndpointConfig`：IPC 服务端点（地址、端口、连接安全模式、证书文件）
//! - `HealthProbeConfig`：健康探针配置
//! - `subset`：从完整配置文档中提取发给对端的最小配置子集

mod endpoint;
mod health;
pub mod subset;

pub use endpoint::{ConnectionSecurity, DEFAULT_EXPIRATION_WARNING_PERIOD, EndpointConfig};
pub use health::HealthProbeConfig;
pub use subset::ConfigSubset;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("configuration section {0}: {1}")]
    Section(String, String),
    #[error("configuration document error: {0}")]
    Document(String),
}

/// 会话宿主进程运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ipc_address: String,
    pub ipc_port: u16,
    pub connection_type: ConnectionSecurity,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ca_certificate: Option<PathBuf>,
    pub expiration_warning_period: i64,
    pub target_id: Option<String>,
    pub target_type: String,
    pub health_probe_port: Option<u16>,
    pub health_probe_path: String,
    pub shutdown_timeout_seconds: u64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let ipc_port = read_u16("EDGE_IPC_PORT")?;
        let ipc_address = env::var("EDGE_IPC_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());
        let connection_type = match read_optional("EDGE_IPC_CONNECTION_TYPE") {
            Some(value) => value
                .parse::<ConnectionSecurity>()
                .map_err(|_| ConfigError::Invalid("EDGE_IPC_CONNECTION_TYPE".to_string(), value))?,
            None => ConnectionSecurity::PlainText,
        };
        let certificate = read_optional("EDGE_IPC_CERTIFICATE").map(PathBuf::from);
        let private_key = read_optional("EDGE_IPC_PRIVATE_KEY").map(PathBuf::from);
        let ca_certificate = read_optional("EDGE_IPC_CA_CERTIFICATE").map(PathBuf::from);
        let expiration_warning_period = read_u64_with_default(
            "EDGE_IPC_EXPIRATION_WARNING_DAYS",
            DEFAULT_EXPIRATION_WARNING_PERIOD as u64,
        )? as i64;
        let target_id = read_optional("EDGE_IPC_TARGET_ID");
        let target_type =
            env::var("EDGE_IPC_TARGET_TYPE").unwrap_or_else(|_| "DEBUG-TARGET".to_string());
        let health_probe_port = read_optional_u16("EDGE_HEALTH_PROBE_PORT")?;
        let health_probe_path =
            env::var("EDGE_HEALTH_PROBE_PATH").unwrap_or_else(|_| "/health".to_string());
        let shutdown_timeout_seconds = read_u64_with_default("EDGE_SHUTDOWN_TIMEOUT_SECONDS", 15)?;

        Ok(Self {
            ipc_address,
            ipc_port,
            connection_type,
            certificate,
            private_key,
            ca_certificate,
            expiration_warning_period,
            target_id,
            target_type,
            health_probe_port,
            health_probe_path,
            shutdown_timeout_seconds,
        })
    }

    /// 构建本进程托管的服务端端点配置，并校验连接安全模式要求的证书与私钥。
    pub fn endpoint(&self) -> Result<EndpointConfig, ConfigError> {
        let mut endpoint = EndpointConfig::new(self.ipc_address.clone(), self.ipc_port)
            .with_connection_type(self.connection_type)
            .for_server();
        endpoint.server_certificate = self.certificate.clone();
        endpoint.server_private_key = self.private_key.clone();
        endpoint.ca_certificate = self.ca_certificate.clone();
        endpoint.expiration_warning_period = self.expiration_warning_period;
        if let Some(port) = self.health_probe_port {
            endpoint.health_probe = Some(HealthProbeConfig::new(self.health_probe_path.clone(), port));
        }
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

fn read_u16(key: &str) -> Result<u16, ConfigError> {
    let value = env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))?;
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u16(key: &str) -> Result<Option<u16>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u16>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}
