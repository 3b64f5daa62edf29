//! 目标写入会话与确认协议（编排进程侧）
//!
//! 生产者调用 `write_target_data` 入队；发送循环把队列中的批次按入队顺序写入对端，
//! 同时读取对端回传的写入结果，经单消费者通道按收到的顺序交给结果处理器。
//!
//! 已发送的批次留在在途窗口中，直到宿主回传 `received`。连接重置时窗口内的批次
//! 按原顺序放回队首，重连后重发；宿主按 serial 去重。
//!
//! 确认策略在初始化握手中下发一次；没有结果处理器时下发全 `None`。

use crate::connection::{Connection, ConnectionManager};
use crate::error::IpcError;
use crate::metrics::{MetricsConsumer, MetricsReader};
use crate::outbound::{EnqueuePolicy, OutboundQueue};
use crate::session::{SessionConfig, SessionHandle, SessionRole, SessionState, StreamEnd, spawn_session, stopped};
use crate::source_read::expect_initialized;
use crate::wire::{Frame, ServiceKind};
use async_trait::async_trait;
use domain::{AcknowledgmentPolicy, TargetData, TargetResult};
use edge_config::{ConfigSubset, EndpointConfig};
use edge_telemetry::{record_ack_received, record_batch_enqueued, record_batch_transmitted};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 目标批次队列容量
pub const TARGET_QUEUE_CAPACITY: usize = 100;
/// 结果通道容量
pub const RESULT_CHANNEL_CAPACITY: usize = 100;

/// 写入结果处理器。
#[async_trait]
pub trait TargetResultHandler: Send + Sync {
    /// 需要对端返回的结果粒度。
    fn policy(&self) -> AcknowledgmentPolicy;

    async fn handle_result(&self, result: TargetResult);
}

/// 写入会话参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetWriterOptions {
    pub capacity: usize,
    pub enqueue: EnqueuePolicy,
    pub session: SessionConfig,
}

impl Default for TargetWriterOptions {
    fn default() -> Self {
        Self {
            capacity: TARGET_QUEUE_CAPACITY,
            enqueue: EnqueuePolicy::default(),
            session: SessionConfig::default(),
        }
    }
}

/// 已发送、尚未被宿主确认收到的批次。
type InFlight = Arc<Mutex<VecDeque<TargetData>>>;

struct TargetWriteRole {
    target_id: String,
    handoff: ConfigSubset,
    policy: AcknowledgmentPolicy,
    queue: Arc<OutboundQueue<TargetData>>,
    in_flight: InFlight,
    max_in_flight: usize,
    results: Option<mpsc::Sender<TargetResult>>,
    initialized: Arc<AtomicBool>,
}

impl TargetWriteRole {
    /// 宿主按顺序处理批次，确认到的 serial 及其之前的批次都已送达。
    async fn confirm(&self, serial: &str) {
        let mut in_flight = self.in_flight.lock().await;
        let Some(position) = in_flight.iter().position(|data| data.serial == serial) else {
            debug!(target: "edge.ipc", target_id = %self.target_id, serial, "unknown_receipt");
            return;
        };
        for _ in in_flight.drain(..=position) {
            record_batch_transmitted();
        }
        debug!(target: "edge.ipc", target_id = %self.target_id, serial, "batch_delivered");
    }

    async fn forward_result(&self, result: TargetResult) {
        record_ack_received();
        match &self.results {
            Some(results) => {
                if results.send(result).await.is_err() {
                    warn!(target: "edge.ipc", target_id = %self.target_id, "result_handler_closed");
                }
            }
            None => {
                debug!(target: "edge.ipc", target_id = %self.target_id, "target_result_dropped");
            }
        }
    }
}

#[async_trait]
impl SessionRole for TargetWriteRole {
    fn name(&self) -> &'static str {
        "target_write"
    }

    async fn initialize(&self, connection: &Connection) -> Result<(), IpcError> {
        let reply = connection
            .call(&Frame::Initialize {
                service: ServiceKind::Target,
                configuration: self.handoff.configuration.clone(),
                secrets: self.handoff.secrets.clone(),
                target_id: Some(self.target_id.clone()),
                policy: self.policy,
            })
            .await?;
        expect_initialized(reply)?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stream(&self, connection: &Connection) -> Result<StreamEnd, IpcError> {
        let (mut reader, mut writer) = connection.open_stream().await?;

        loop {
            let window_open = self.in_flight.lock().await.len() < self.max_in_flight;
            tokio::select! {
                biased;
                inbound = reader.next() => match inbound? {
                    Some(Frame::Received { serial }) => self.confirm(&serial).await,
                    Some(Frame::TargetResult { result }) => self.forward_result(result).await,
                    Some(Frame::Error { message }) => return Err(IpcError::Remote(message)),
                    Some(other) => {
                        warn!(target: "edge.ipc", frame = other.kind(), "unexpected_frame");
                    }
                    None => {
                        return Err(IpcError::Connection(format!(
                            "{}: target stream closed by server",
                            connection.address()
                        )));
                    }
                },
                item = self.queue.next(), if window_open => {
                    let Some(data) = item else {
                        return Ok(StreamEnd::Stopped);
                    };
                    let serial = data.serial.clone();
                    self.in_flight.lock().await.push_back(data.clone());
                    writer.send(&Frame::WriteValues { data }).await?;
                    debug!(target: "edge.ipc", target_id = %self.target_id, serial = %serial, "batch_sent");
                }
            }
        }
    }

    async fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        let unconfirmed: Vec<TargetData> = self.in_flight.lock().await.drain(..).collect();
        if !unconfirmed.is_empty() {
            debug!(
                target: "edge.ipc",
                target_id = %self.target_id,
                batches = unconfirmed.len(),
                "batches_requeued"
            );
            self.queue.requeue_all(unconfirmed).await;
        }
    }
}

/// 目标写入会话。
pub struct TargetWriter {
    target_id: String,
    manager: Arc<ConnectionManager>,
    queue: Arc<OutboundQueue<TargetData>>,
    in_flight: InFlight,
    session: SessionHandle,
    result_task: Option<JoinHandle<()>>,
    initialized: Arc<AtomicBool>,
}

impl TargetWriter {
    pub fn start(
        endpoint: EndpointConfig,
        target_id: impl Into<String>,
        handoff: ConfigSubset,
        handler: Option<Arc<dyn TargetResultHandler>>,
        options: TargetWriterOptions,
    ) -> Self {
        let target_id = target_id.into();
        let queue = Arc::new(OutboundQueue::new(options.capacity, options.enqueue));
        let in_flight: InFlight = Arc::new(Mutex::new(VecDeque::new()));
        let initialized = Arc::new(AtomicBool::new(false));

        let policy = handler
            .as_ref()
            .map(|handler| handler.policy())
            .unwrap_or_else(AcknowledgmentPolicy::none);

        let (results, result_task) = match handler {
            Some(handler) => {
                let (tx, mut rx) = mpsc::channel::<TargetResult>(RESULT_CHANNEL_CAPACITY);
                let task = tokio::spawn(async move {
                    while let Some(result) = rx.recv().await {
                        handler.handle_result(result).await;
                    }
                });
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let role = Arc::new(TargetWriteRole {
            target_id: target_id.clone(),
            handoff,
            policy,
            queue: Arc::clone(&queue),
            in_flight: Arc::clone(&in_flight),
            max_in_flight: options.capacity.max(1),
            results,
            initialized: Arc::clone(&initialized),
        });
        let manager = Arc::new(ConnectionManager::new(endpoint));
        let session = spawn_session(role, Arc::clone(&manager), options.session);

        Self {
            target_id,
            manager,
            queue,
            in_flight,
            session,
            result_task,
            initialized,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// 入队一个批次，返回时已在队列中。
    ///
    /// 队列持续满时在等待预算耗尽后返回 `IpcError::Backpressure`；会话停止时返回 `Shutdown`。
    pub async fn write_target_data(&self, data: TargetData) -> Result<(), IpcError> {
        if self.session.is_finished() {
            return Err(IpcError::Shutdown);
        }
        let mut stop = self.session.stop_signal();
        tokio::select! {
            result = self.queue.enqueue(data) => {
                result?;
                record_batch_enqueued();
                Ok(())
            }
            _ = stopped(&mut stop) => Err(IpcError::Shutdown),
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

    /// 尚未确认送达的批次数（队列中与在途的）。
    pub async fn pending(&self) -> usize {
        self.queue.len().await + self.in_flight.lock().await.len()
    }

    /// 同一目标服务上的指标读取，所属会话初始化后开始。
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

    /// 停止会话，等待结果处理器处理完已收到的结果。
    pub async fn stop(self) -> Result<(), IpcError> {
        let result = self.session.stop().await;
        if let Some(task) = self.result_task {
            let _ = task.await;
        }
        result
    }
}
