use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 健康探针配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthProbeConfig {
    #[serde(default)]
    pub path: String,
    pub port: u16,
    /// 监听地址（未配置时监听所有地址）
    #[serde(default)]
    pub interface: Option<String>,
    /// 每秒允许的探测请求数
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub allowed_ip_addresses: Option<Vec<String>>,
    /// GET 请求的正常响应体
    #[serde(default = "default_response")]
    pub response: String,
    /// 健康状态缓存时长（毫秒）
    #[serde(default = "default_retain_state_period")]
    pub retain_state_period: u64,
    /// 持续不健康多少秒后停止服务
    #[serde(default)]
    pub stop_after_unhealthy_period: Option<u64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_rate_limit() -> u32 {
    10
}

fn default_response() -> String {
    "OK".to_string()
}

fn default_retain_state_period() -> u64 {
    1000
}

fn default_active() -> bool {
    true
}

impl HealthProbeConfig {
    pub fn new(path: impl Into<String>, port: u16) -> Self {
        Self {
            path: path.into(),
            port,
            interface: None,
            rate_limit: default_rate_limit(),
            allowed_ip_addresses: None,
            response: default_response(),
            retain_state_period: default_retain_state_period(),
            stop_after_unhealthy_period: None,
            active: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit < 1 {
            return Err(ConfigError::Invalid(
                "RateLimit".to_string(),
                "RateLimit must at least be 1".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "Port".to_string(),
                "0 is not a valid port number".to_string(),
            ));
        }
        Ok(())
    }

    /// 以 `/` 开头的路由路径。
    pub fn route_path(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }

    pub fn bind_address(&self) -> String {
        let host = self.interface.as_deref().unwrap_or("0.0.0.0");
        format!("{}:{}", host, self.port)
    }

    pub fn retain_state(&self) -> Duration {
        Duration::from_millis(self.retain_state_period)
    }

    pub fn stop_after_unhealthy(&self) -> Option<Duration> {
        self.stop_after_unhealthy_period.map(Duration::from_secs)
    }
}
