//! 确认协议：目标写入结果与返回粒度协商。

use crate::data::TargetData;
use serde::{Deserialize, Serialize};

/// 单个结果类别的返回粒度。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnedData {
    /// 不返回任何内容
    #[default]
    None,
    /// 仅返回批次 serial
    Serials,
    /// 返回完整批次
    Messages,
}

/// 确认策略：送达 / 拒绝 / 出错三个类别各自的返回粒度。
///
/// 在初始化握手时下发一次，对端据此裁剪确认流。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgmentPolicy {
    pub ack: ReturnedData,
    pub nack: ReturnedData,
    pub error: ReturnedData,
}

impl AcknowledgmentPolicy {
    /// 三个类别都不返回。
    pub const fn none() -> Self {
        Self {
            ack: ReturnedData::None,
            nack: ReturnedData::None,
            error: ReturnedData::None,
        }
    }

    pub const fn new(ack: ReturnedData, nack: ReturnedData, error: ReturnedData) -> Self {
        Self { ack, nack, error }
    }

    pub fn returns_any_data(&self) -> bool {
        self.ack != ReturnedData::None
            || self.nack != ReturnedData::None
            || self.error != ReturnedData::None
    }

    /// 按策略裁剪写入结果。
    ///
    /// `Serials` 类别只保留 serial（缺失时由完整批次推导），`Messages` 类别只保留完整批次。
    pub fn apply(&self, result: TargetResult) -> TargetResult {
        let TargetResult {
            target_id,
            ack_serials,
            ack_messages,
            nack_serials,
            nack_messages,
            error_serials,
            error_messages,
        } = result;

        let (ack_serials, ack_messages) = restrict(self.ack, ack_serials, ack_messages);
        let (nack_serials, nack_messages) = restrict(self.nack, nack_serials, nack_messages);
        let (error_serials, error_messages) = restrict(self.error, error_serials, error_messages);

        TargetResult {
            target_id,
            ack_serials,
            ack_messages,
            nack_serials,
            nack_messages,
            error_serials,
            error_messages,
        }
    }
}

fn restrict(
    returned: ReturnedData,
    serials: Vec<String>,
    messages: Vec<TargetData>,
) -> (Vec<String>, Vec<TargetData>) {
    match returned {
        ReturnedData::None => (Vec::new(), Vec::new()),
        ReturnedData::Serials if serials.is_empty() => {
            (messages.into_iter().map(|m| m.serial).collect(), Vec::new())
        }
        ReturnedData::Serials => (serials, Vec::new()),
        ReturnedData::Messages => (Vec::new(), messages),
    }
}

/// 目标写入结果（确认流中的一条消息）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ack_serials: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ack_messages: Vec<TargetData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nack_serials: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nack_messages: Vec<TargetData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_serials: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<TargetData>,
}

impl TargetResult {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            ..Self::default()
        }
    }

    /// 以完整批次记录送达结果（serial 同步记录）。
    pub fn acknowledged(mut self, data: TargetData) -> Self {
        self.ack_serials.push(data.serial.clone());
        self.ack_messages.push(data);
        self
    }

    pub fn rejected(mut self, data: TargetData) -> Self {
        self.nack_serials.push(data.serial.clone());
        self.nack_messages.push(data);
        self
    }

    pub fn errored(mut self, data: TargetData) -> Self {
        self.error_serials.push(data.serial.clone());
        self.error_messages.push(data);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ack_serials.is_empty()
            && self.ack_messages.is_empty()
            && self.nack_serials.is_empty()
            && self.nack_messages.is_empty()
            && self.error_serials.is_empty()
            && self.error_messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(serial: &str) -> TargetData {
        TargetData::new("schedule", serial, serde_json::json!({}))
    }

    #[test]
    fn test_apply_serials_derived_from_messages() {
        let mut result = TargetResult::new("t1");
        result.nack_messages.push(batch("7"));
        let policy = AcknowledgmentPolicy::new(
            ReturnedData::None,
            ReturnedData::Serials,
            ReturnedData::None,
        );
        let applied = policy.apply(result);
        assert_eq!(applied.nack_serials, vec!["7".to_string()]);
        assert!(applied.nack_messages.is_empty());
    }

    #[test]
    fn test_none_policy_empties_result() {
        let result = TargetResult::new("t1")
            .acknowledged(batch("1"))
            .rejected(batch("2"))
            .errored(batch("3"));
        assert!(AcknowledgmentPolicy::none().apply(result).is_empty());
        assert!(!AcknowledgmentPolicy::none().returns_any_data());
    }
}
