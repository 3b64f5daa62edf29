//! 指标会话
//!
//! - `MetricsReader`：编排进程从 adapter / 目标进程拉取指标；所属会话未初始化时只轮询等待
//! - `MetricsWriter`：adapter / 目标进程把指标推送到指标写入服务，自带容量为 1 的发送队列

use crate::connection::{Connection, ConnectionManager};
use crate::error::IpcError;
use crate::outbound::{EnqueuePolicy, OutboundQueue};
use crate::session::{SessionConfig, SessionHandle, SessionRole, SessionState, StreamEnd, spawn_session, stopped};
use crate::source_read::expect_initialized;
use crate::wire::{Frame, ServiceKind};
use async_trait::async_trait;
use domain::{AcknowledgmentPolicy, MetricsData};
use edge_config::{ConfigSubset, EndpointConfig};
use edge_telemetry::{record_metrics_read, record_metrics_written};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// 指标写入队列容量
pub const METRICS_QUEUE_CAPACITY: usize = 1;

/// 指标消费者；返回 false 停止读取。
#[async_trait]
pub trait MetricsConsumer: Send + Sync {
    async fn consume_metrics(&self, data: MetricsData) -> bool;
}

struct MetricsReadRole {
    owner_initialized: Arc<AtomicBool>,
    interval: Duration,
    consumer: Arc<dyn MetricsConsumer>,
}

#[async_trait]
impl SessionRole for MetricsReadRole {
    fn name(&self) -> &'static str {
        "metrics_read"
    }

    fn ready(&self) -> bool {
        self.owner_initialized.load(Ordering::SeqCst)
    }

    /// 对端已由所属会话初始化。
    async fn initialize(&self, _connection: &Connection) -> Result<(), IpcError> {
        Ok(())
    }

    async fn stream(&self, connection: &Connection) -> Result<StreamEnd, IpcError> {
        let (mut reader, mut writer) = connection.open_stream().await?;
        writer
            .send(&Frame::ReadMetrics {
                interval_ms: self.interval.as_millis() as u64,
            })
            .await?;

        loop {
            match reader.next().await? {
                Some(Frame::MetricsData { data }) => {
                    if data.is_empty() {
                        continue;
                    }
                    record_metrics_read();
                    if !self.consumer.consume_metrics(data).await {
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
}

/// 指标读取会话。
pub struct MetricsReader {
    session: SessionHandle,
}

impl MetricsReader {
    pub fn start(
        endpoint: EndpointConfig,
        owner_initialized: Arc<AtomicBool>,
        interval: Duration,
        consumer: Arc<dyn MetricsConsumer>,
        config: SessionConfig,
    ) -> Self {
        let role = Arc::new(MetricsReadRole {
            owner_initialized,
            interval,
            consumer,
        });
        let manager = Arc::new(ConnectionManager::new(endpoint));
        Self {
            session: spawn_session(role, manager, config),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn stop(self) -> Result<(), IpcError> {
        self.session.stop().await
    }
}

struct MetricsWriteRole {
    handoff: ConfigSubset,
    queue: Arc<OutboundQueue<MetricsData>>,
    initialized: Arc<AtomicBool>,
}

#[async_trait]
impl SessionRole for MetricsWriteRole {
    fn name(&self) -> &'static str {
        "metrics_write"
    }

    async fn initialize(&self, connection: &Connection) -> Result<(), IpcError> {
        let reply = connection
            .call(&Frame::Initialize {
                service: ServiceKind::Metrics,
                configuration: self.handoff.configuration.clone(),
                secrets: self.handoff.secrets.clone(),
                target_id: None,
                policy: AcknowledgmentPolicy::none(),
            })
            .await?;
        expect_initialized(reply)?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stream(&self, connection: &Connection) -> Result<StreamEnd, IpcError> {
        let (mut reader, mut writer) = connection.open_stream().await?;
        loop {
            tokio::select! {
                biased;
                inbound = reader.next() => match inbound? {
                    Some(Frame::Error { message }) => return Err(IpcError::Remote(message)),
                    Some(other) => {
                        warn!(target: "edge.ipc", frame = other.kind(), "unexpected_frame");
                    }
                    None => return Ok(StreamEnd::Completed),
                },
                item = self.queue.next() => {
                    let Some(data) = item else {
                        return Ok(StreamEnd::Stopped);
                    };
                    let frame = Frame::WriteMetrics { data };
                    if let Err(err) = writer.send(&frame).await {
                        if let Frame::WriteMetrics { data } = frame {
                            self.queue.requeue_all([data]).await;
                        }
                        return Err(err);
                    }
                    record_metrics_written();
                }
            }
        }
    }

    async fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }
}

/// 指标写入会话。
pub struct MetricsWriter {
    queue: Arc<OutboundQueue<MetricsData>>,
    session: SessionHandle,
    initialized: Arc<AtomicBool>,
}

impl MetricsWriter {
    pub fn start(
        endpoint: EndpointConfig,
        handoff: ConfigSubset,
        enqueue: EnqueuePolicy,
        config: SessionConfig,
    ) -> Self {
        let queue = Arc::new(OutboundQueue::new(METRICS_QUEUE_CAPACITY, enqueue));
        let initialized = Arc::new(AtomicBool::new(false));
        let role = Arc::new(MetricsWriteRole {
            handoff,
            queue: Arc::clone(&queue),
            initialized: Arc::clone(&initialized),
        });
        let manager = Arc::new(ConnectionManager::new(endpoint));
        Self {
            queue,
            session: spawn_session(role, manager, config),
            initialized,
        }
    }

    /// 入队待写出的指标；会话停止时立即返回 `Shutdown`。
    pub async fn write_metrics(&self, data: MetricsData) -> Result<(), IpcError> {
        if self.session.is_finished() {
            return Err(IpcError::Shutdown);
        }
        let mut stop = self.session.stop_signal();
        tokio::select! {
            result = self.queue.enqueue(data) => result,
            _ = stopped(&mut stop) => Err(IpcError::Shutdown),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn stop(self) -> Result<(), IpcError> {
        self.session.stop().await
    }
}
