//! 会话宿主（adapter / 目标 / 指标服务进程侧）
//!
//! 监听本进程端点，每条入站流由首帧决定处理方式：
//!
//! - `initialize`：关闭旧实例后按服务类型创建新的协议 adapter / 目标 / 指标写入实例
//! - `read_values`：按间隔读取数据源并推送读取结果
//! - `write_values`：写入批次，每批回传 `received`，并按确认策略回传写入结果；
//!   重发的批次按 serial 去重
//! - `read_metrics`：按间隔推送实例指标，未初始化时推送空指标
//! - `write_metrics`：把收到的指标交给指标写入实例

use crate::cert_expiry::{ExpiryMonitor, inspect_certificates};
use crate::credentials::{load_certificates, server_tls_config};
use crate::error::IpcError;
use crate::health::HealthCheck;
use crate::session::stopped;
use crate::target_write::{RESULT_CHANNEL_CAPACITY, TargetResultHandler};
use crate::wire::{Frame, FrameReader, FrameWriter, ServiceKind, split_stream};
use async_trait::async_trait;
use domain::{
    AcknowledgmentPolicy, MetricsData, ReadResult, SourceReadResult, TargetData, TargetResult,
    now_epoch_ms,
};
use edge_config::EndpointConfig;
use edge_config::subset::{
    ADAPTER_SERVERS, METRICS, METRICS_SERVER, METRICS_WRITER, TARGET_SERVER, TARGET_SERVERS,
    TARGET_TYPE, TARGETS, parse_document,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// 关闭旧实例的最长等待
pub const INSTANCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// 启动后的健康宽限期
pub const HEALTH_GRACE_PERIOD: Duration = Duration::from_secs(10);
/// 用于去重的最近已处理 serial 数
pub const DELIVERED_SERIALS_WINDOW: usize = 1024;

/// 协议 adapter 实例。
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// 读取一次数据源；`sources` 为数据源 -> 通道 ID。
    async fn read(&self, sources: &BTreeMap<String, Vec<String>>) -> Result<ReadResult, IpcError>;

    async fn metrics(&self) -> Option<MetricsData> {
        None
    }

    async fn close(&self);
}

/// 目标实例。写入结果经创建时传入的结果处理器回传。
#[async_trait]
pub trait TargetSink: Send + Sync {
    async fn write(&self, data: TargetData) -> Result<(), IpcError>;

    async fn metrics(&self) -> Option<MetricsData> {
        None
    }

    async fn close(&self);
}

/// 指标写入实例。
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write_metrics(&self, data: MetricsData) -> Result<(), IpcError>;

    async fn close(&self);
}

#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(
        &self,
        configuration: &Value,
        secrets: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ProtocolAdapter>, IpcError>;
}

#[async_trait]
pub trait TargetFactory: Send + Sync {
    /// 本进程实现的目标类型（`TargetType`）。
    fn target_type(&self) -> &str;

    /// 创建目标；确认策略不要求返回任何内容时 `results` 为 `None`。
    async fn create(
        &self,
        target_id: &str,
        configuration: &Value,
        secrets: &BTreeMap<String, String>,
        results: Option<Arc<dyn TargetResultHandler>>,
    ) -> Result<Arc<dyn TargetSink>, IpcError>;
}

#[async_trait]
pub trait MetricsSinkFactory: Send + Sync {
    async fn create(
        &self,
        configuration: &Value,
        secrets: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn MetricsSink>, IpcError>;
}

/// 目标服务托管参数。
#[derive(Clone)]
pub struct TargetHosting {
    pub factory: Arc<dyn TargetFactory>,
    /// 启动时绑定的目标 ID；设置后只接受该目标的初始化
    pub target_id: Option<String>,
}

/// 本进程托管的服务。
#[derive(Clone, Default)]
pub struct HostServices {
    pub adapter: Option<Arc<dyn AdapterFactory>>,
    pub target: Option<TargetHosting>,
    pub metrics: Option<Arc<dyn MetricsSinkFactory>>,
}

impl HostServices {
    pub fn with_adapter(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.adapter = Some(factory);
        self
    }

    pub fn with_target(mut self, factory: Arc<dyn TargetFactory>, target_id: Option<String>) -> Self {
        self.target = Some(TargetHosting { factory, target_id });
        self
    }

    pub fn with_metrics(mut self, factory: Arc<dyn MetricsSinkFactory>) -> Self {
        self.metrics = Some(factory);
        self
    }
}

/// 按确认策略裁剪后写入结果通道。
struct ChannelResultHandler {
    policy: AcknowledgmentPolicy,
    sender: mpsc::Sender<TargetResult>,
}

#[async_trait]
impl TargetResultHandler for ChannelResultHandler {
    fn policy(&self) -> AcknowledgmentPolicy {
        self.policy
    }

    async fn handle_result(&self, result: TargetResult) {
        let result = self.policy.apply(result);
        if result.is_empty() {
            return;
        }
        if self.sender.send(result).await.is_err() {
            debug!(target: "edge.host", "target_result_discarded");
        }
    }
}

/// 最近已处理的批次 serial，跨重新初始化保留，目标 ID 变化时清空。
#[derive(Default)]
struct DeliveredSerials {
    target_id: String,
    order: VecDeque<String>,
    serials: HashSet<String>,
}

impl DeliveredSerials {
    /// 首次出现返回 true。
    fn insert(&mut self, target_id: &str, serial: &str) -> bool {
        if self.target_id != target_id {
            self.target_id = target_id.to_string();
            self.order.clear();
            self.serials.clear();
        }
        if !self.serials.insert(serial.to_string()) {
            return false;
        }
        self.order.push_back(serial.to_string());
        if self.order.len() > DELIVERED_SERIALS_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.serials.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Clone)]
struct TargetInstance {
    target_id: String,
    sink: Arc<dyn TargetSink>,
    handler: Option<Arc<dyn TargetResultHandler>>,
    results: Arc<Mutex<mpsc::Receiver<TargetResult>>>,
}

struct HostInner {
    endpoint: EndpointConfig,
    services: HostServices,
    local_addr: SocketAddr,
    started_at: Instant,
    listening: AtomicBool,
    /// 回复是否压缩，由最近一次初始化的服务端配置决定
    compress_replies: AtomicBool,
    stop: watch::Sender<bool>,
    adapter: RwLock<Option<Arc<dyn ProtocolAdapter>>>,
    target: RwLock<Option<TargetInstance>>,
    metrics_sink: RwLock<Option<Arc<dyn MetricsSink>>>,
    delivered: Mutex<DeliveredSerials>,
    monitor: Mutex<ExpiryMonitor>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// 会话宿主句柄，可在多个任务间克隆共享。
#[derive(Clone)]
pub struct SessionHost {
    inner: Arc<HostInner>,
}

impl SessionHost {
    /// 校验端点、加载服务端证书并开始监听。
    pub async fn start(endpoint: EndpointConfig, services: HostServices) -> Result<Self, IpcError> {
        let endpoint = endpoint.for_server();
        endpoint.validate()?;
        let listener = TcpListener::bind(endpoint.address_str())
            .await
            .map_err(|e| IpcError::Connection(format!("{}: {}", endpoint.address_str(), e)))?;
        Self::with_listener(listener, endpoint, services).await
    }

    /// 在已绑定的监听器上启动。
    pub async fn with_listener(
        listener: TcpListener,
        endpoint: EndpointConfig,
        services: HostServices,
    ) -> Result<Self, IpcError> {
        let endpoint = endpoint.for_server();
        let acceptor = server_tls_config(&endpoint)?.map(TlsAcceptor::from);

        let mut certificates = Vec::new();
        for path in endpoint.monitored_certificates() {
            certificates.extend(load_certificates(&path)?);
        }
        let monitor = ExpiryMonitor::start(
            inspect_certificates(&certificates),
            endpoint.expiration_warning_period,
        );

        let local_addr = listener.local_addr()?;
        let (stop, _) = watch::channel(false);
        let compress_replies = AtomicBool::new(endpoint.compression);
        let inner = Arc::new(HostInner {
            endpoint,
            services,
            local_addr,
            started_at: Instant::now(),
            listening: AtomicBool::new(true),
            compress_replies,
            stop,
            adapter: RwLock::new(None),
            target: RwLock::new(None),
            metrics_sink: RwLock::new(None),
            delivered: Mutex::new(DeliveredSerials::default()),
            monitor: Mutex::new(monitor),
            accept_task: Mutex::new(None),
        });

        info!(
            target: "edge.host",
            address = %local_addr,
            connection_type = %inner.endpoint.connection_type,
            "session_host_started"
        );

        let task = tokio::spawn(accept_loop(Arc::clone(&inner), listener, acceptor));
        *inner.accept_task.lock().await = Some(task);
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.inner.endpoint
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// 停止监听并关闭所有实例；可重复调用。
    pub async fn stop(&self) {
        if self.inner.stop.send_replace(true) {
            return;
        }
        if let Some(task) = self.inner.accept_task.lock().await.take() {
            let _ = task.await;
        }

        if let Some(adapter) = self.inner.adapter.write().await.take() {
            close_instance("adapter", adapter.close()).await;
        }
        if let Some(target) = self.inner.target.write().await.take() {
            close_instance("target", target.sink.close()).await;
        }
        if let Some(sink) = self.inner.metrics_sink.write().await.take() {
            close_instance("metrics", sink.close()).await;
        }
        self.inner.monitor.lock().await.stop();
        info!(target: "edge.host", address = %self.inner.local_addr, "session_host_stopped");
    }
}

impl HealthCheck for SessionHost {
    /// 启动宽限期内视为健康，之后要求监听仍在运行。
    fn is_healthy(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        if self.inner.started_at.elapsed() < HEALTH_GRACE_PERIOD {
            return true;
        }
        self.inner.listening.load(Ordering::SeqCst)
    }
}

async fn accept_loop(inner: Arc<HostInner>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    let mut stop = inner.stop.subscribe();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stopped(&mut stop) => break,
        };
        let (tcp, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(target: "edge.host", error = %e, "accept_failed");
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);

        let inner = Arc::clone(&inner);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(stream) => inner.serve_stream(stream).await,
                    Err(e) => Err(IpcError::Connection(format!("{}: {}", peer, e))),
                },
                None => inner.serve_stream(tcp).await,
            };
            match result {
                Ok(()) => debug!(target: "edge.host", peer = %peer, "stream_closed"),
                Err(e) if e.is_shutdown() => {}
                Err(e) => warn!(target: "edge.host", peer = %peer, error = %e, "stream_failed"),
            }
        });
    }
    inner.listening.store(false, Ordering::SeqCst);
}

async fn close_instance(kind: &'static str, close: impl Future<Output = ()>) {
    if tokio::time::timeout(INSTANCE_CLOSE_TIMEOUT, close).await.is_err() {
        warn!(target: "edge.host", kind, "instance_close_timeout");
    }
}

/// 读取失败时每个数据源都返回同一错误。
fn read_error(sources: &BTreeMap<String, Vec<String>>, error: &IpcError) -> ReadResult {
    let timestamp_ms = now_epoch_ms();
    let mut result = ReadResult::default();
    for source_id in sources.keys() {
        result.insert(
            source_id.clone(),
            SourceReadResult::Error {
                error: error.to_string(),
                timestamp_ms,
            },
        );
    }
    result
}

fn tick_interval(interval_ms: u64) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl HostInner {
    async fn serve_stream<S>(&self, stream: S) -> Result<(), IpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = split_stream(stream);
        writer.set_compression(self.compress_replies.load(Ordering::SeqCst));
        let mut stop = self.stop.subscribe();
        let first = tokio::select! {
            first = reader.next() => first?,
            _ = stopped(&mut stop) => return Ok(()),
        };
        let Some(first) = first else {
            return Ok(());
        };

        match first {
            Frame::Initialize {
                service,
                configuration,
                secrets,
                target_id,
                policy,
            } => {
                let reply = match self
                    .initialize(service, &configuration, &secrets, target_id, policy)
                    .await
                {
                    Ok(()) => Frame::InitializeReply {
                        initialized: true,
                        message: String::new(),
                    },
                    Err(e) => {
                        error!(target: "edge.host", service = service.as_str(), error = %e, "initialize_failed");
                        Frame::InitializeReply {
                            initialized: false,
                            message: e.to_string(),
                        }
                    }
                };
                writer.send(&reply).await?;
            }
            Frame::ReadValues {
                sources,
                interval_ms,
            } => self.serve_reads(reader, &mut writer, stop, sources, interval_ms).await?,
            Frame::WriteValues { data } => self.serve_writes(reader, &mut writer, stop, data).await?,
            Frame::ReadMetrics { interval_ms } => {
                self.serve_metrics_reads(reader, &mut writer, stop, interval_ms).await?
            }
            Frame::WriteMetrics { data } => {
                self.serve_metrics_writes(reader, &mut writer, stop, data).await?
            }
            other => {
                writer
                    .send(&Frame::error(format!("unexpected {} frame", other.kind())))
                    .await?
            }
        }
        writer.shutdown().await
    }

    async fn initialize(
        &self,
        service: ServiceKind,
        configuration: &str,
        secrets: &BTreeMap<String, String>,
        target_id: Option<String>,
        policy: AcknowledgmentPolicy,
    ) -> Result<(), IpcError> {
        let document = parse_document(configuration)?;
        let mut served_target = None;
        match service {
            ServiceKind::Adapter => {
                let factory = self.services.adapter.as_ref().ok_or_else(|| not_hosted(service))?;
                let mut slot = self.adapter.write().await;
                if let Some(previous) = slot.take() {
                    close_instance("adapter", previous.close()).await;
                }
                *slot = Some(factory.create(&document, secrets).await?);
            }
            ServiceKind::Target => {
                let hosting = self.services.target.as_ref().ok_or_else(|| not_hosted(service))?;
                let target_id = check_target(hosting, &document, target_id)?;
                let mut slot = self.target.write().await;
                if let Some(previous) = slot.take() {
                    close_instance("target", previous.sink.close()).await;
                }

                let (sender, receiver) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
                let handler: Option<Arc<dyn TargetResultHandler>> = if policy.returns_any_data() {
                    Some(Arc::new(ChannelResultHandler { policy, sender }))
                } else {
                    None
                };
                let sink = hosting
                    .factory
                    .create(&target_id, &document, secrets, handler.clone())
                    .await?;
                served_target = Some(target_id.clone());
                *slot = Some(TargetInstance {
                    target_id,
                    sink,
                    handler,
                    results: Arc::new(Mutex::new(receiver)),
                });
            }
            ServiceKind::Metrics => {
                let factory = self.services.metrics.as_ref().ok_or_else(|| not_hosted(service))?;
                let mut slot = self.metrics_sink.write().await;
                if let Some(previous) = slot.take() {
                    close_instance("metrics", previous.close()).await;
                }
                *slot = Some(factory.create(&document, secrets).await?);
            }
        }
        let compression = self.endpoint.compression
            || reply_compression(service, &document, served_target.as_deref());
        self.compress_replies.store(compression, Ordering::SeqCst);
        info!(
            target: "edge.host",
            service = service.as_str(),
            secrets = secrets.len(),
            compression,
            "service_initialized"
        );
        Ok(())
    }

    async fn serve_reads(
        &self,
        mut reader: FrameReader,
        writer: &mut FrameWriter,
        mut stop: watch::Receiver<bool>,
        sources: BTreeMap<String, Vec<String>>,
        interval_ms: u64,
    ) -> Result<(), IpcError> {
        let mut ticker = tick_interval(interval_ms);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => return Ok(()),
                inbound = reader.next() => match inbound? {
                    Some(other) => warn!(target: "edge.host", frame = other.kind(), "unexpected_frame"),
                    None => return Ok(()),
                },
                _ = ticker.tick() => {
                    let adapter = self.adapter.read().await.clone();
                    let Some(adapter) = adapter else {
                        writer.send(&Frame::error("protocol adapter is not initialized")).await?;
                        return Ok(());
                    };
                    let result = match adapter.read(&sources).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(target: "edge.host", error = %e, "source_read_failed");
                            read_error(&sources, &e)
                        }
                    };
                    writer.send(&Frame::ReadReply { result }).await?;
                }
            }
        }
    }

    async fn serve_writes(
        &self,
        mut reader: FrameReader,
        writer: &mut FrameWriter,
        mut stop: watch::Receiver<bool>,
        first: TargetData,
    ) -> Result<(), IpcError> {
        let instance = self.target.read().await.clone();
        let Some(instance) = instance else {
            writer.send(&Frame::error("target is not initialized")).await?;
            return Ok(());
        };
        let mut results = instance.results.lock().await;
        // 确认策略不要求返回内容时结果通道已关闭，流仍继续接收批次
        let mut results_open = instance.handler.is_some();

        let mut next = Some(first);
        loop {
            if let Some(data) = next.take() {
                let serial = data.serial.clone();
                let first_delivery = self.delivered.lock().await.insert(&instance.target_id, &serial);
                if first_delivery {
                    write_target(&instance, data).await;
                } else {
                    debug!(target: "edge.host", target_id = %instance.target_id, serial = %serial, "duplicate_batch_skipped");
                }
                writer.send(&Frame::Received { serial }).await?;
            }
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => return Ok(()),
                result = results.recv(), if results_open => match result {
                    Some(result) => writer.send(&Frame::TargetResult { result }).await?,
                    None => results_open = false,
                },
                inbound = reader.next() => match inbound? {
                    Some(Frame::WriteValues { data }) => next = Some(data),
                    Some(other) => warn!(target: "edge.host", frame = other.kind(), "unexpected_frame"),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn serve_metrics_reads(
        &self,
        mut reader: FrameReader,
        writer: &mut FrameWriter,
        mut stop: watch::Receiver<bool>,
        interval_ms: u64,
    ) -> Result<(), IpcError> {
        let mut ticker = tick_interval(interval_ms);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => return Ok(()),
                inbound = reader.next() => match inbound? {
                    Some(other) => warn!(target: "edge.host", frame = other.kind(), "unexpected_frame"),
                    None => return Ok(()),
                },
                _ = ticker.tick() => {
                    let data = self.current_metrics().await.unwrap_or_else(MetricsData::empty);
                    writer.send(&Frame::MetricsData { data }).await?;
                }
            }
        }
    }

    async fn serve_metrics_writes(
        &self,
        mut reader: FrameReader,
        writer: &mut FrameWriter,
        mut stop: watch::Receiver<bool>,
        first: MetricsData,
    ) -> Result<(), IpcError> {
        let mut next = Some(first);
        loop {
            if let Some(data) = next.take() {
                let sink = self.metrics_sink.read().await.clone();
                let Some(sink) = sink else {
                    writer.send(&Frame::error("metrics writer is not initialized")).await?;
                    return Ok(());
                };
                if let Err(e) = sink.write_metrics(data).await {
                    warn!(target: "edge.host", error = %e, "metrics_write_failed");
                }
            }
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => return Ok(()),
                inbound = reader.next() => match inbound? {
                    Some(Frame::WriteMetrics { data }) => next = Some(data),
                    Some(other) => warn!(target: "edge.host", frame = other.kind(), "unexpected_frame"),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn current_metrics(&self) -> Option<MetricsData> {
        let adapter = self.adapter.read().await.clone();
        if let Some(adapter) = adapter {
            return adapter.metrics().await;
        }
        let target = self.target.read().await.clone();
        match target {
            Some(target) => target.sink.metrics().await,
            None => None,
        }
    }
}

/// 写入失败的批次作为出错结果回传。
async fn write_target(instance: &TargetInstance, data: TargetData) {
    let serial = data.serial.clone();
    let fallback = instance.handler.as_ref().map(|_| data.clone());
    if let Err(e) = instance.sink.write(data).await {
        warn!(target: "edge.host", target_id = %instance.target_id, serial = %serial, error = %e, "target_write_failed");
        if let (Some(handler), Some(data)) = (&instance.handler, fallback) {
            handler
                .handle_result(TargetResult::new(instance.target_id.clone()).errored(data))
                .await;
        }
    }
}

/// 按下发的服务端配置段决定回复是否压缩。
fn reply_compression(service: ServiceKind, document: &Value, target_id: Option<&str>) -> bool {
    let server = match service {
        ServiceKind::Adapter => document
            .get(ADAPTER_SERVERS)
            .and_then(Value::as_object)
            .and_then(|servers| servers.values().next()),
        ServiceKind::Target => target_id
            .and_then(|id| document.get(TARGETS)?.get(id)?.get(TARGET_SERVER)?.as_str())
            .and_then(|server_id| document.get(TARGET_SERVERS)?.get(server_id)),
        ServiceKind::Metrics => document
            .get(METRICS)
            .and_then(|metrics| metrics.get(METRICS_WRITER))
            .and_then(|writer| writer.get(METRICS_SERVER)),
    };
    server
        .and_then(|server| server.get("Compression"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn not_hosted(service: ServiceKind) -> IpcError {
    IpcError::Initialize(format!("{} service is not hosted by this process", service.as_str()))
}

/// 确认初始化的目标存在，且类型与本进程实现的一致。
fn check_target(
    hosting: &TargetHosting,
    document: &Value,
    requested: Option<String>,
) -> Result<String, IpcError> {
    let target_id = match (requested, &hosting.target_id) {
        (Some(requested), Some(bound)) if &requested != bound => {
            return Err(IpcError::Initialize(format!(
                "target \"{}\" requested, this process serves \"{}\"",
                requested, bound
            )));
        }
        (Some(requested), _) => requested,
        (None, Some(bound)) => bound.clone(),
        (None, None) => {
            return Err(IpcError::Initialize("no target id in initialize request".to_string()));
        }
    };

    let target = document
        .get(TARGETS)
        .and_then(|targets| targets.get(&target_id))
        .ok_or_else(|| {
            IpcError::Initialize(format!("target \"{}\" is not in the configuration", target_id))
        })?;
    let target_type = target.get(TARGET_TYPE).and_then(Value::as_str).unwrap_or_default();
    let expected = hosting.factory.target_type();
    if target_type != expected {
        return Err(IpcError::Initialize(format!(
            "target \"{}\" has type \"{}\", expected \"{}\"",
            target_id, target_type, expected
        )));
    }
    Ok(target_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ReturnedData;
    use serde_json::json;

    struct NamedFactory(&'static str);

    #[async_trait]
    impl TargetFactory for NamedFactory {
        fn target_type(&self) -> &str {
            self.0
        }

        async fn create(
            &self,
            _target_id: &str,
            _configuration: &Value,
            _secrets: &BTreeMap<String, String>,
            _results: Option<Arc<dyn TargetResultHandler>>,
        ) -> Result<Arc<dyn TargetSink>, IpcError> {
            Err(IpcError::Initialize("not used".to_string()))
        }
    }

    fn hosting(bound: Option<&str>) -> TargetHosting {
        TargetHosting {
            factory: Arc::new(NamedFactory("DEBUG-TARGET")),
            target_id: bound.map(str::to_string),
        }
    }

    fn document() -> Value {
        json!({
            "Targets": {
                "debug": {"TargetType": "DEBUG-TARGET"},
                "s3": {"TargetType": "AWS-S3"}
            }
        })
    }

    #[test]
    fn test_check_target() {
        let doc = document();
        assert_eq!(
            check_target(&hosting(None), &doc, Some("debug".to_string())).expect("debug"),
            "debug"
        );
        assert_eq!(check_target(&hosting(Some("debug")), &doc, None).expect("bound"), "debug");
        assert!(check_target(&hosting(None), &doc, Some("s3".to_string())).is_err());
        assert!(check_target(&hosting(None), &doc, Some("missing".to_string())).is_err());
        assert!(check_target(&hosting(Some("debug")), &doc, Some("s3".to_string())).is_err());
        assert!(check_target(&hosting(None), &doc, None).is_err());
    }

    #[test]
    fn test_delivered_serials_window() {
        let mut delivered = DeliveredSerials::default();
        assert!(delivered.insert("debug", "1"));
        assert!(!delivered.insert("debug", "1"));
        assert!(delivered.insert("debug", "2"));

        // 其他目标重新开始记录
        assert!(delivered.insert("s3", "1"));
        assert!(delivered.insert("debug", "1"));

        for serial in 0..DELIVERED_SERIALS_WINDOW {
            delivered.insert("debug", &format!("w{}", serial));
        }
        assert_eq!(delivered.order.len(), DELIVERED_SERIALS_WINDOW);
        assert!(delivered.insert("debug", "1"), "oldest serial left the window");
    }

    #[test]
    fn test_reply_compression_from_server_sections() {
        let doc = json!({
            "Targets": {
                "router": {"TargetType": "ROUTER", "TargetServer": "router-server"},
                "debug": {"TargetType": "DEBUG-TARGET"}
            },
            "TargetServers": {"router-server": {"Address": "localhost", "Port": 50060, "Compression": true}},
            "AdapterServers": {"opcua-server": {"Address": "localhost", "Port": 50051, "Compression": true}},
            "Metrics": {"Writer": {"MetricsServer": {"Port": 50070}}}
        });
        assert!(reply_compression(ServiceKind::Target, &doc, Some("router")));
        assert!(!reply_compression(ServiceKind::Target, &doc, Some("debug")));
        assert!(reply_compression(ServiceKind::Adapter, &doc, None));
        assert!(!reply_compression(ServiceKind::Metrics, &doc, None));
    }

    #[test]
    fn test_read_error_covers_every_source() {
        let sources = BTreeMap::from([
            ("a".to_string(), vec!["x".to_string()]),
            ("b".to_string(), Vec::new()),
        ]);
        let result = read_error(&sources, &IpcError::Remote("device offline".to_string()));
        assert_eq!(result.sources.len(), 2);
        assert!(result.sources.values().all(SourceReadResult::is_error));
    }

    #[tokio::test]
    async fn test_channel_handler_applies_policy() {
        let (sender, mut receiver) = mpsc::channel(4);
        let handler = ChannelResultHandler {
            policy: AcknowledgmentPolicy::new(ReturnedData::Serials, ReturnedData::None, ReturnedData::None),
            sender,
        };
        let batch = TargetData::new("schedule", "serial-1", json!({}));

        handler
            .handle_result(TargetResult::new("debug").acknowledged(batch.clone()))
            .await;
        // 策略裁剪后为空的结果不回传
        handler.handle_result(TargetResult::new("debug").rejected(batch)).await;
        drop(handler);

        let first = receiver.recv().await.expect("result");
        assert_eq!(first.ack_serials, vec!["serial-1".to_string()]);
        assert!(first.ack_messages.is_empty());
        assert!(receiver.recv().await.is_none());
    }
}
