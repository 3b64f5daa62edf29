//! 会话注册表（编排进程侧）
//!
//! 按服务端身份（地址与端口）建立会话：同一 adapter 服务上的数据源共用一个读取会话，
//! 同一目标服务上的目标共用一个写入会话。初始化载荷由配置子集与其中引用的密钥组成。

use crate::error::IpcError;
use crate::metrics::MetricsWriter;
use crate::outbound::EnqueuePolicy;
use crate::session::SessionConfig;
use crate::source_read::{ReadResultConsumer, SourceReadRequest, SourceReader};
use crate::target_write::{TargetResultHandler, TargetWriter, TargetWriterOptions};
use domain::TargetData;
use edge_config::subset::{
    ADAPTER_SERVER, ADAPTER_SERVERS, METRICS, METRICS_SERVER, METRICS_WRITER, PROTOCOL_ADAPTERS,
    SOURCE_PROTOCOL_ADAPTER, SOURCES, TARGET_SERVER, TARGET_SERVERS, TARGETS,
    adapter_configuration, metrics_configuration, target_configuration,
};
use edge_config::{ConfigError, ConfigSubset, EndpointConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 数据源所在的 adapter 服务。
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterRoute {
    pub adapter_id: String,
    pub endpoint: EndpointConfig,
}

/// 按服务端去重的会话集合。
pub struct SessionRegistry {
    document: Value,
    secrets: BTreeMap<String, String>,
    readers: BTreeMap<String, SourceReader>,
    writers: BTreeMap<String, TargetWriter>,
    /// 目标 ID -> 写入会话所在服务端
    target_servers: BTreeMap<String, String>,
    metrics_writer: Option<MetricsWriter>,
}

impl SessionRegistry {
    pub fn new(document: Value, secrets: BTreeMap<String, String>) -> Self {
        Self {
            document,
            secrets,
            readers: BTreeMap::new(),
            writers: BTreeMap::new(),
            target_servers: BTreeMap::new(),
            metrics_writer: None,
        }
    }

    /// 数据源经由的 adapter 服务；进程内 adapter 返回 `None`。
    pub fn adapter_route(&self, source_id: &str) -> Result<Option<AdapterRoute>, IpcError> {
        let adapter_id = self
            .document
            .get(SOURCES)
            .and_then(|sources| sources.get(source_id))
            .and_then(|source| source.get(SOURCE_PROTOCOL_ADAPTER))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                missing(SOURCES, format!("source \"{}\" has no protocol adapter", source_id))
            })?;
        let adapter = self
            .document
            .get(PROTOCOL_ADAPTERS)
            .and_then(|adapters| adapters.get(adapter_id))
            .ok_or_else(|| {
                missing(PROTOCOL_ADAPTERS, format!("adapter \"{}\" does not exist", adapter_id))
            })?;
        let Some(server_id) = adapter.get(ADAPTER_SERVER).and_then(Value::as_str) else {
            return Ok(None);
        };
        let endpoint = server_endpoint(&self.document, ADAPTER_SERVERS, server_id)?;
        Ok(Some(AdapterRoute {
            adapter_id: adapter_id.to_string(),
            endpoint,
        }))
    }

    /// 为调度的数据源启动读取会话，每个 adapter 服务一个；返回新启动的会话数。
    pub fn start_source_readers(
        &mut self,
        sources: &BTreeMap<String, Vec<String>>,
        interval: Duration,
        consumer: Arc<dyn ReadResultConsumer>,
        config: SessionConfig,
    ) -> Result<usize, IpcError> {
        let mut groups: BTreeMap<String, (AdapterRoute, BTreeMap<String, Vec<String>>)> =
            BTreeMap::new();
        for (source_id, channels) in sources {
            let Some(route) = self.adapter_route(source_id)? else {
                debug!(target: "edge.ipc", source = %source_id, "source_served_in_process");
                continue;
            };
            groups
                .entry(route.endpoint.address_str())
                .or_insert_with(|| (route, BTreeMap::new()))
                .1
                .insert(source_id.clone(), channels.clone());
        }

        let mut started = 0;
        for (server, (route, sources)) in groups {
            if self.readers.contains_key(&server) {
                continue;
            }
            let scheduled: Vec<String> = sources.keys().cloned().collect();
            let subset = adapter_configuration(&self.document, &route.adapter_id, &scheduled)?;
            let handoff = ConfigSubset::build(&subset, &self.secrets)?;
            info!(
                target: "edge.ipc",
                server = %server,
                adapter = %route.adapter_id,
                sources = scheduled.len(),
                "source_reader_registered"
            );
            let reader = SourceReader::start(
                route.endpoint,
                handoff,
                SourceReadRequest { sources, interval },
                Arc::clone(&consumer),
                config,
            );
            self.readers.insert(server, reader);
            started += 1;
        }
        Ok(started)
    }

    /// 为目标启动写入会话，每个目标服务一个；进程内目标跳过。返回新启动的会话数。
    pub fn start_target_writers(
        &mut self,
        target_ids: &[String],
        handler: Option<Arc<dyn TargetResultHandler>>,
        options: TargetWriterOptions,
    ) -> Result<usize, IpcError> {
        let mut started = 0;
        for target_id in target_ids {
            let target = self
                .document
                .get(TARGETS)
                .and_then(|targets| targets.get(target_id))
                .ok_or_else(|| missing(TARGETS, format!("target \"{}\" does not exist", target_id)))?;
            let Some(server_id) = target
                .get(TARGET_SERVER)
                .and_then(Value::as_str)
                .filter(|server_id| !server_id.is_empty())
            else {
                debug!(target: "edge.ipc", target_id = %target_id, "target_served_in_process");
                continue;
            };
            let endpoint = server_endpoint(&self.document, TARGET_SERVERS, server_id)?;
            let server = endpoint.address_str();
            self.target_servers.insert(target_id.clone(), server.clone());
            if self.writers.contains_key(&server) {
                continue;
            }

            let subset = target_configuration(&self.document, target_id)?;
            let handoff = ConfigSubset::build(&subset, &self.secrets)?;
            info!(target: "edge.ipc", server = %server, target_id = %target_id, "target_writer_registered");
            let writer = TargetWriter::start(endpoint, target_id.clone(), handoff, handler.clone(), options);
            self.writers.insert(server, writer);
            started += 1;
        }
        Ok(started)
    }

    /// 启动指标写入会话（`Metrics.Writer.MetricsServer`）；未配置时返回 false。
    pub fn start_metrics_writer(
        &mut self,
        enqueue: EnqueuePolicy,
        config: SessionConfig,
    ) -> Result<bool, IpcError> {
        if self.metrics_writer.is_some() {
            return Ok(false);
        }
        let Some(server) = self
            .document
            .get(METRICS)
            .and_then(|metrics| metrics.get(METRICS_WRITER))
            .and_then(|writer| writer.get(METRICS_SERVER))
        else {
            return Ok(false);
        };
        let endpoint = EndpointConfig::from_value(server)?;
        endpoint.validate()?;
        let subset = metrics_configuration(&self.document)?;
        let handoff = ConfigSubset::build(&subset, &self.secrets)?;
        info!(target: "edge.ipc", server = %endpoint.address_str(), "metrics_writer_registered");
        self.metrics_writer = Some(MetricsWriter::start(endpoint, handoff, enqueue, config));
        Ok(true)
    }

    /// 写入目标批次，经由该目标所在服务的写入会话。
    pub async fn write_target_data(&self, target_id: &str, data: TargetData) -> Result<(), IpcError> {
        let writer = self.target_writer(target_id).ok_or_else(|| {
            IpcError::Config(missing(TARGETS, format!("no writer for target \"{}\"", target_id)))
        })?;
        writer.write_target_data(data).await
    }

    pub fn target_writer(&self, target_id: &str) -> Option<&TargetWriter> {
        self.target_servers
            .get(target_id)
            .and_then(|server| self.writers.get(server))
    }

    /// 服务端地址 -> 读取会话。
    pub fn source_reader(&self, server: &str) -> Option<&SourceReader> {
        self.readers.get(server)
    }

    pub fn metrics_writer(&self) -> Option<&MetricsWriter> {
        self.metrics_writer.as_ref()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// 停止全部会话，返回遇到的第一个错误。
    pub async fn stop(self) -> Result<(), IpcError> {
        let mut first_error = None;
        for (_, reader) in self.readers {
            if let Err(e) = reader.stop().await {
                first_error.get_or_insert(e);
            }
        }
        for (_, writer) in self.writers {
            if let Err(e) = writer.stop().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(writer) = self.metrics_writer {
            if let Err(e) = writer.stop().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn server_endpoint(document: &Value, section: &str, server_id: &str) -> Result<EndpointConfig, IpcError> {
    let server = document
        .get(section)
        .and_then(|servers| servers.get(server_id))
        .ok_or_else(|| missing(section, format!("server \"{}\" does not exist", server_id)))?;
    let endpoint = EndpointConfig::from_value(server)?;
    endpoint.validate()?;
    Ok(endpoint)
}

fn missing(section: &str, message: String) -> ConfigError {
    ConfigError::Section(section.to_string(), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "Sources": {
                "boiler": {"ProtocolAdapter": "opcua-1"},
                "pump": {"ProtocolAdapter": "opcua-2"},
                "local": {"ProtocolAdapter": "in-process"}
            },
            "ProtocolAdapters": {
                "opcua-1": {"AdapterType": "OPCUA", "AdapterServer": "opcua-server"},
                "opcua-2": {"AdapterType": "OPCUA", "AdapterServer": "opcua-server"},
                "in-process": {"AdapterType": "SIM"}
            },
            "AdapterServers": {"opcua-server": {"Address": "127.0.0.1", "Port": 50051}}
        })
    }

    #[test]
    fn test_adapter_route() {
        let registry = SessionRegistry::new(document(), BTreeMap::new());
        let route = registry.adapter_route("pump").expect("route").expect("remote");
        assert_eq!(route.adapter_id, "opcua-2");
        assert_eq!(route.endpoint.address_str(), "127.0.0.1:50051");

        assert!(registry.adapter_route("local").expect("route").is_none());
        assert!(matches!(
            registry.adapter_route("missing"),
            Err(IpcError::Config(ConfigError::Section(..)))
        ));
    }
}
