//! IPC 流式会话能力模块
//!
//! 编排进程侧：
//! - `SourceReader`：读取协议 adapter 服务的数据源
//! - `TargetWriter`：向目标服务写入批次并接收确认结果
//! - `MetricsReader` / `MetricsWriter`：指标读取与写入
//! - `SessionRegistry`：按服务端地址去重建立上述会话
//!
//! 服务进程侧：
//! - `SessionHost`：托管 adapter / 目标 / 指标服务
//! - `HealthProbeService`：HTTP 健康探针
//!
//! 底层：端点凭证解析、证书到期监控、连接管理与行分隔 JSON 帧。

pub mod cert_expiry;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod health;
pub mod host;
pub mod metrics;
pub mod outbound;
pub mod registry;
pub mod session;
pub mod source_read;
pub mod target_write;
pub mod wire;

pub use cert_expiry::{CertificateInfo, ExpiryMonitor, ExpiryStatus};
pub use connection::{Connection, ConnectionManager};
pub use credentials::{Credentials, resolve_credentials, server_tls_config};
pub use error::IpcError;
pub use health::{HealthCheck, HealthProbeService, UnhealthyAction};
pub use host::{
    AdapterFactory, HostServices, MetricsSink, MetricsSinkFactory, ProtocolAdapter, SessionHost,
    TargetFactory, TargetHosting, TargetSink,
};
pub use metrics::{MetricsConsumer, MetricsReader, MetricsWriter};
pub use outbound::{EnqueuePolicy, OutboundQueue};
pub use registry::{AdapterRoute, SessionRegistry};
pub use session::{SessionConfig, SessionHandle, SessionRole, SessionState, StreamEnd, spawn_session};
pub use source_read::{ReadResultConsumer, SourceReadRequest, SourceReader};
pub use target_write::{TargetResultHandler, TargetWriter, TargetWriterOptions};
pub use wire::{Frame, MAX_FRAME_LEN, ServiceKind};
