use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 通道读取值（可选带值级时间戳）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

impl ChannelValue {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            timestamp_ms: None,
        }
    }
}

/// 单个数据源的读取结果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceReadResult {
    Success {
        values: BTreeMap<String, ChannelValue>,
        timestamp_ms: i64,
    },
    Error {
        error: String,
        timestamp_ms: i64,
    },
}

impl SourceReadResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// 一次读取周期的结果，按 source_id 索引。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    pub sources: BTreeMap<String, SourceReadResult>,
}

impl ReadResult {
    pub fn insert(&mut self, source_id: impl Into<String>, result: SourceReadResult) {
        self.sources.insert(source_id.into(), result);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// 发往目标的数据批次。
///
/// `serial` 是批次在确认流中的关联标识；`sources` 的内部结构由目标自行解释。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub schedule: String,
    pub serial: String,
    #[serde(default)]
    pub sources: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub no_buffering: bool,
    pub timestamp_ms: i64,
}

impl TargetData {
    pub fn new(schedule: impl Into<String>, serial: impl Into<String>, sources: serde_json::Value) -> Self {
        Self {
            schedule: schedule.into(),
            serial: serial.into(),
            sources,
            metadata: BTreeMap::new(),
            no_buffering: false,
            timestamp_ms: crate::now_epoch_ms(),
        }
    }
}
