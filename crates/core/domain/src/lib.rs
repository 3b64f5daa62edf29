//! IPC 层共享的领域载荷：读取结果、目标批次、确认结果与指标数据。

pub mod ack;
pub mod data;
pub mod metrics;

pub use ack::{AcknowledgmentPolicy, ReturnedData, TargetResult};
pub use data::{ChannelValue, ReadResult, SourceReadResult, TargetData};
pub use metrics::{MetricsData, MetricsDataPoint, MetricsSourceType, MetricsValue};

/// 获取当前时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
