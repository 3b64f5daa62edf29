//! 追踪、请求 ID 与 IPC 会话计数。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// IPC 计数快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcSnapshot {
    pub connections_created: u64,
    pub connection_resets: u64,
    pub reconnect_backoffs: u64,
    pub initialize_failures: u64,
    pub batches_enqueued: u64,
    pub batches_transmitted: u64,
    pub backpressure_failures: u64,
    pub acks_received: u64,
    pub reads_received: u64,
    pub metrics_read: u64,
    pub metrics_written: u64,
    pub certificate_warnings: u64,
}

/// 进程内 IPC 计数。
pub struct IpcMetrics {
    connections_created: AtomicU64,
    connection_resets: AtomicU64,
    reconnect_backoffs: AtomicU64,
    initialize_failures: AtomicU64,
    batches_enqueued: AtomicU64,
    batches_transmitted: AtomicU64,
    backpressure_failures: AtomicU64,
    acks_received: AtomicU64,
    reads_received: AtomicU64,
    metrics_read: AtomicU64,
    metrics_written: AtomicU64,
    certificate_warnings: AtomicU64,
}

impl IpcMetrics {
    pub fn new() -> Self {
        Self {
            connections_created: AtomicU64::new(0),
            connection_resets: AtomicU64::new(0),
            reconnect_backoffs: AtomicU64::new(0),
            initialize_failures: AtomicU64::new(0),
            batches_enqueued: AtomicU64::new(0),
            batches_transmitted: AtomicU64::new(0),
            backpressure_failures: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            reads_received: AtomicU64::new(0),
            metrics_read: AtomicU64::new(0),
            metrics_written: AtomicU64::new(0),
            certificate_warnings: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> IpcSnapshot {
        IpcSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_resets: self.connection_resets.load(Ordering::Relaxed),
            reconnect_backoffs: self.reconnect_backoffs.load(Ordering::Relaxed),
            initialize_failures: self.initialize_failures.load(Ordering::Relaxed),
            batches_enqueued: self.batches_enqueued.load(Ordering::Relaxed),
            batches_transmitted: self.batches_transmitted.load(Ordering::Relaxed),
            backpressure_failures: self.backpressure_failures.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            reads_received: self.reads_received.load(Ordering::Relaxed),
            metrics_read: self.metrics_read.load(Ordering::Relaxed),
            metrics_written: self.metrics_written.load(Ordering::Relaxed),
            certificate_warnings: self.certificate_warnings.load(Ordering::Relaxed),
        }
    }
}

impl Default for IpcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<IpcMetrics> = OnceLock::new();

/// 获取全局计数实例。
pub fn metrics() -> &'static IpcMetrics {
    METRICS.get_or_init(IpcMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 记录新建连接次数。
pub fn record_connection_created() {
    metrics().connections_created.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接重置次数。
pub fn record_connection_reset() {
    metrics().connection_resets.fetch_add(1, Ordering::Relaxed);
}

/// 记录重连退避次数。
pub fn record_reconnect_backoff() {
    metrics().reconnect_backoffs.fetch_add(1, Ordering::Relaxed);
}

/// 记录初始化握手失败次数。
pub fn record_initialize_failure() {
    metrics().initialize_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录目标批次入队次数。
pub fn record_batch_enqueued() {
    metrics().batches_enqueued.fetch_add(1, Ordering::Relaxed);
}

/// 记录目标批次发送次数。
pub fn record_batch_transmitted() {
    metrics().batches_transmitted.fetch_add(1, Ordering::Relaxed);
}

/// 记录入队超出等待预算次数。
pub fn record_backpressure_failure() {
    metrics().backpressure_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录收到的目标结果次数。
pub fn record_ack_received() {
    metrics().acks_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录收到的读取结果次数。
pub fn record_read_received() {
    metrics().reads_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录读取指标次数。
pub fn record_metrics_read() {
    metrics().metrics_read.fetch_add(1, Ordering::Relaxed);
}

/// 记录写出指标次数。
pub fn record_metrics_written() {
    metrics().metrics_written.fetch_add(1, Ordering::Relaxed);
}

/// 记录证书到期告警次数。
pub fn record_certificate_warning() {
    metrics().certificate_warnings.fetch_add(1, Ordering::Relaxed);
}
