use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 指标来源类型。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSourceType {
    #[default]
    ProtocolAdapter,
    TargetWriter,
    Core,
}

/// 指标值：单值或统计值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricsValue {
    Single(f64),
    Statistics {
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
    },
}

/// 单个指标数据点。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDataPoint {
    pub name: String,
    pub value: MetricsValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
    pub timestamp_ms: i64,
}

/// 一次采集的指标集合。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsData {
    pub source: String,
    pub source_type: MetricsSourceType,
    #[serde(default)]
    pub data_points: Vec<MetricsDataPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common_dimensions: BTreeMap<String, String>,
}

impl MetricsData {
    /// 空指标（对端尚未初始化时按周期发送）。
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data_points.is_empty()
    }
}
