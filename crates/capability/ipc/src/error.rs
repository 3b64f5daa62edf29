//! IPC 错误类型定义

use edge_config::ConfigError;

/// IPC 会话错误
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// 端点配置错误（启动时即失败，不重试）
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 证书、私钥加载或 TLS 配置错误
    #[error("credentials error: {0}")]
    Credentials(String),

    /// 连接错误
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 帧编解码错误
    #[error("codec error: {0}")]
    Codec(String),

    /// 对端初始化失败
    #[error("initialize failed: {0}")]
    Initialize(String),

    /// 对端返回错误帧
    #[error("remote error: {0}")]
    Remote(String),

    /// 入队超出等待预算
    #[error("enqueue timed out after {waited_ms}ms")]
    Backpressure { waited_ms: u64 },

    /// 服务尚未初始化
    #[error("service not initialized")]
    NotInitialized,

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,

    /// 正在关闭
    #[error("shutdown in progress")]
    Shutdown,

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),
}

impl IpcError {
    /// 主动关闭引起的错误，只记 info。
    pub fn is_shutdown(&self) -> bool {
        matches!(self, IpcError::Shutdown | IpcError::ChannelClosed)
    }

    /// 配置类错误，会话不再重试。
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::Config(_) | IpcError::Credentials(_))
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Codec(err.to_string())
    }
}
