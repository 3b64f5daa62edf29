//! 数据源读取会话（编排进程侧）
//!
//! 向协议 adapter 服务下发配置子集，然后以固定间隔读取数据源，
//! 按收到的顺序把每批结果交给消费者。消费者返回 false 时会话正常结束。

use crate::connection::{Connection, ConnectionManager};
use crate::error::IpcError;
use crate::metrics::{MetricsConsumer, MetricsReader};
use crate::session::{SessionConfig, SessionHandle, SessionRole, SessionState, StreamEnd, spawn_session};
use crate::wire::{Frame, ServiceKind};
use async_trait::async_trait;
use domain::{AcknowledgmentPolicy, ReadResult};
use edge_config::{ConfigSubset, ConnectionSecurity, EndpointConfig};
use edge_telemetry::record_read_received;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// 读取结果消费者；返回 false 停止读取。
#[async_trait]
pub trait ReadResultConsumer: Send + Sync {
    async fn consume(&self, result: ReadResult) -> bool;
}

/// 读取请求：数据源 -> 通道 ID 列表，以及读取间隔。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReadRequest {
    pub sources: BTreeMap<String, Vec<String>>,
    pub interval: Duration,
}

struct SourceReadRole {
    handoff: ConfigSubset,
    request: SourceReadRequest,
    consumer: Arc<dyn ReadResultConsumer>,
    connection_type: ConnectionSecurity,
    initialized: Arc<AtomicBool>,
}

#[async_trait]
impl SessionRole for SourceReadRole {
    fn name(&self) -> &'static str {
        "source_read"
    }

    async fn initialize(&self, connection: &Connection) -> Result<(), IpcError> {
        let request = Frame::Initialize {
            service: ServiceKind::Adapter,
            configuration: self.handoff.configuration.clone(),
            secrets: self.handoff.secrets.clone(),
            target_id: None,
            policy: AcknowledgmentPolicy::none(),
        };
        let reply = connection.call(&request).await.inspect_err(|err| {
            if self.connection_type == ConnectionSecurity::PlainText && looks_like_tls(err) {
                warn!(
                    target: "edge.ipc",
                    address = %connection.address(),
                    "adapter server may require a TLS connection, check the ConnectionType of the server"
                );
            }
        })?;
        expect_initialized(reply)?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stream(&self, connection: &Connection) -> Result<StreamEnd, IpcError> {
        let (mut reader, mut writer) = connection.open_stream().await?;
        writer
            .send(&Frame::ReadValues {
                sources: self.request.sources.clone(),
                interval_ms: self.request.interval.as_millis() as u64,
            })
            .await?;

        loop {
            match reader.next().await? {
                Some(Frame::ReadReply { result }) => {
                    record_read_received();
                    debug!(target: "edge.ipc", sources = result.sources.len(), "read_result_received");
                    if !self.consumer.consume(result).await {
                        return Ok(StreamEnd::Stopped);
                    }
                }
                Some(Frame::Error { message }) => return Err(IpcError::Remote(message)),
                Some(other) => {
                    warn!(target: "edge.ipc", frame = other.kind(), "unexpected_frame");
                }
                None => return Ok(StreamEnd::Completed),
            }
        }
    }

    async fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }
}

/// 明文连接到 TLS 服务端时的典型错误。
fn looks_like_tls(err: &IpcError) -> bool {
    match err {
        IpcError::Codec(_) => true,
        IpcError::Connection(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("reset") || message.contains("handshake") || message.contains("closed")
        }
        _ => false,
    }
}

pub(crate) fn expect_initialized(reply: Frame) -> Result<(), IpcError> {
    match reply {
        Frame::InitializeReply {
            initialized: true, ..
        } => Ok(()),
        Frame::InitializeReply { message, .. } => Err(IpcError::Initialize(message)),
        other => Err(IpcError::Codec(format!(
            "expected initialize_reply, got {}",
            other.kind()
        ))),
    }
}

/// 数据源读取会话。
pub struct SourceReader {
    manager: Arc<ConnectionManager>,
    session: SessionHandle,
    initialized: Arc<AtomicBool>,
}

impl SourceReader {
    pub fn start(
        endpoint: EndpointConfig,
        handoff: ConfigSubset,
        request: SourceReadRequest,
        consumer: Arc<dyn ReadResultConsumer>,
        config: SessionConfig,
    ) -> Self {
        let initialized = Arc::new(AtomicBool::new(false));
        let role = Arc::new(SourceReadRole {
            handoff,
            request,
            consumer,
            connection_type: endpoint.connection_type,
            initialized: Arc::clone(&initialized),
        });
        let manager = Arc::new(ConnectionManager::new(endpoint));
        let session = spawn_session(role, Arc::clone(&manager), config);
        Self {
            manager,
            session,
            initialized,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// 同一 adapter 服务上的指标读取，所属会话初始化后开始。
    pub fn metrics_reader(
        &self,
        interval: Duration,
        consumer: Arc<dyn MetricsConsumer>,
        config: SessionConfig,
    ) -> MetricsReader {
        MetricsReader::start(
            self.manager.endpoint().clone(),
            Arc::clone(&self.initialized),
            interval,
            consumer,
            config,
        )
    }

    pub async fn stop(self) -> Result<(), IpcError> {
        self.session.stop().await
    }

    /// 等待会话自行结束（消费者要求停止或配置错误）。
    pub async fn join(self) -> Result<(), IpcError> {
        self.session.join().await
    }
}
