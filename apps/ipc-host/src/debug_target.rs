//! 调试目标：记录收到的批次，并按确认策略逐批确认。

use async_trait::async_trait;
use domain::{
    MetricsData, MetricsDataPoint, MetricsSourceType, MetricsValue, TargetData, TargetResult,
    now_epoch_ms,
};
use edge_ipc::{IpcError, TargetFactory, TargetResultHandler, TargetSink};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub struct DebugTarget {
    target_id: String,
    results: Option<Arc<dyn TargetResultHandler>>,
    written: AtomicU64,
}

#[async_trait]
impl TargetSink for DebugTarget {
    async fn write(&self, data: TargetData) -> Result<(), IpcError> {
        self.written.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "edge.host",
            target_id = %self.target_id,
            schedule = %data.schedule,
            serial = %data.serial,
            data = %data.sources,
            "debug_target_write"
        );
        if let Some(results) = &self.results {
            results
                .handle_result(TargetResult::new(self.target_id.clone()).acknowledged(data))
                .await;
        }
        Ok(())
    }

    async fn metrics(&self) -> Option<MetricsData> {
        Some(MetricsData {
            source: self.target_id.clone(),
            source_type: MetricsSourceType::TargetWriter,
            data_points: vec![MetricsDataPoint {
                name: "MessagesWritten".to_string(),
                value: MetricsValue::Single(self.written.swap(0, Ordering::Relaxed) as f64),
                units: Some("Count".to_string()),
                dimensions: BTreeMap::new(),
                timestamp_ms: now_epoch_ms(),
            }],
            common_dimensions: BTreeMap::new(),
        })
    }

    async fn close(&self) {
        info!(target: "edge.host", target_id = %self.target_id, "debug_target_closed");
    }
}

pub struct DebugTargetFactory {
    target_type: String,
}

impl DebugTargetFactory {
    pub fn new(target_type: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
        }
    }
}

#[async_trait]
impl TargetFactory for DebugTargetFactory {
    fn target_type(&self) -> &str {
        &self.target_type
    }

    async fn create(
        &self,
        target_id: &str,
        _configuration: &Value,
        _secrets: &BTreeMap<String, String>,
        results: Option<Arc<dyn TargetResultHandler>>,
    ) -> Result<Arc<dyn TargetSink>, IpcError> {
        info!(
            target: "edge.host",
            target_id,
            acknowledgments = results.is_some(),
            "debug_target_created"
        );
        Ok(Arc::new(DebugTarget {
            target_id: target_id.to_string(),
            results,
            written: AtomicU64::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::AcknowledgmentPolicy;
    use tokio::sync::Mutex;

    struct Collect(Mutex<Vec<TargetResult>>);

    #[async_trait]
    impl TargetResultHandler for Collect {
        fn policy(&self) -> AcknowledgmentPolicy {
            AcknowledgmentPolicy::none()
        }

        async fn handle_result(&self, result: TargetResult) {
            self.0.lock().await.push(result);
        }
    }

    #[tokio::test]
    async fn test_acknowledges_and_counts() {
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let handler: Arc<dyn TargetResultHandler> = collect.clone();
        let factory = DebugTargetFactory::new("DEBUG-TARGET");
        let target = factory
            .create("debug", &Value::Null, &BTreeMap::new(), Some(handler))
            .await
            .unwrap();

        target
            .write(TargetData::new("s", "1", serde_json::json!({})))
            .await
            .unwrap();

        let results = collect.0.lock().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ack_serials, vec!["1".to_string()]);

        let metrics = target.metrics().await.unwrap();
        assert_eq!(metrics.data_points[0].value, MetricsValue::Single(1.0));
    }
}
