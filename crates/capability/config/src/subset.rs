//! 配置子集提取。
//!
//! 初始化对端时只发送从目标 adapter / target / 指标服务可达的配置段，
//! 与之无关的顶层段不会出现在子集中。输出基于有序 map 序列化，
//! 对同一输入重复提取得到逐字节相同的结果。

use crate::ConfigError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const SOURCES: &str = "Sources";
pub const CHANNELS: &str = "Channels";
pub const PROTOCOL_ADAPTERS: &str = "ProtocolAdapters";
pub const ADAPTER_SERVERS: &str = "AdapterServers";
pub const ADAPTER_TYPE: &str = "AdapterType";
pub const ADAPTER_SERVER: &str = "AdapterServer";
pub const SOURCE_PROTOCOL_ADAPTER: &str = "ProtocolAdapter";
pub const METRICS: &str = "Metrics";
pub const METRICS_INTERVAL: &str = "Interval";
pub const METRICS_WRITER: &str = "Writer";
pub const METRICS_NAMESPACE: &str = "Namespace";
pub const METRICS_SERVER: &str = "MetricsServer";
pub const TARGETS: &str = "Targets";
pub const TARGET_TYPE: &str = "TargetType";
pub const TARGET_TYPES: &str = "TargetTypes";
pub const TARGET_SERVER: &str = "TargetServer";
pub const TARGET_SERVERS: &str = "TargetServers";
pub const CREDENTIAL_PROVIDER_CLIENT: &str = "CredentialProviderClient";
pub const CREDENTIAL_PROVIDER_CLIENTS: &str = "AwsIotCredentialProviderClients";
pub const LOG_WRITER: &str = "LogWriter";
pub const AWS_VERSION: &str = "AWSVersion";

/// adapter 用不到的通道属性（由编排进程自身处理）。
const CHANNEL_KEYS_NOT_USED_BY_ADAPTER: [&str; 6] = [
    "Name",
    "Description",
    "Transformation",
    "Metadata",
    "ChangeFilter",
    "ValueFilter",
];

/// 初始化握手载荷：序列化后的配置子集与其中实际引用的密钥。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSubset {
    pub configuration: String,
    pub secrets: BTreeMap<String, String>,
}

impl ConfigSubset {
    /// 序列化子集并筛选其中出现的密钥值。
    pub fn build(subset: &Value, secrets: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let configuration =
            serde_json::to_string(subset).map_err(|e| ConfigError::Document(e.to_string()))?;
        let secrets = used_secrets(secrets, &configuration);
        Ok(Self {
            configuration,
            secrets,
        })
    }
}

/// 仅保留值在配置文本中出现过的密钥。
pub fn used_secrets(secrets: &BTreeMap<String, String>, configuration: &str) -> BTreeMap<String, String> {
    secrets
        .iter()
        .filter(|(_, value)| !value.is_empty() && configuration.contains(value.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// 解析完整配置文档。
pub fn parse_document(json: &str) -> Result<Value, ConfigError> {
    let document: Value =
        serde_json::from_str(json).map_err(|e| ConfigError::Document(e.to_string()))?;
    if !document.is_object() {
        return Err(ConfigError::Document("configuration must be a JSON object".to_string()));
    }
    Ok(document)
}

/// 协议 adapter 服务的配置子集。
///
/// 包含：与调度数据源同一 adapter 服务上的数据源（去除 adapter 不使用的通道属性）、
/// adapter 自身配置段、其服务端配置段，以及指标的 Interval / Writer / Namespace。
pub fn adapter_configuration(
    document: &Value,
    adapter_id: &str,
    scheduled_sources: &[String],
) -> Result<Value, ConfigError> {
    let adapters = section(document, PROTOCOL_ADAPTERS)?;
    let adapter = adapters.get(adapter_id).ok_or_else(|| {
        ConfigError::Section(
            PROTOCOL_ADAPTERS.to_string(),
            format!("adapter \"{}\" does not exist", adapter_id),
        )
    })?;
    let adapter_type = adapter.get(ADAPTER_TYPE).and_then(Value::as_str);

    // 同类型 adapter -> 服务端
    let adapter_servers: BTreeMap<&str, &str> = adapters
        .iter()
        .filter(|(_, a)| a.get(ADAPTER_TYPE).and_then(Value::as_str) == adapter_type)
        .filter_map(|(id, a)| {
            a.get(ADAPTER_SERVER)
                .and_then(Value::as_str)
                .map(|server| (id.as_str(), server))
        })
        .collect();

    let all_sources = section(document, SOURCES)?;
    let source_servers: BTreeMap<&str, &str> = all_sources
        .iter()
        .filter_map(|(id, source)| {
            let adapter = source.get(SOURCE_PROTOCOL_ADAPTER).and_then(Value::as_str)?;
            adapter_servers.get(adapter).map(|server| (id.as_str(), *server))
        })
        .collect();

    let used_servers: BTreeSet<&str> = scheduled_sources
        .iter()
        .filter_map(|id| source_servers.get(id.as_str()).copied())
        .collect();

    let mut sources = Map::new();
    for (id, source) in all_sources {
        let served = source_servers
            .get(id.as_str())
            .is_some_and(|server| used_servers.contains(server));
        if served {
            sources.insert(id.clone(), strip_channel_details(source));
        }
    }

    let mut output = Map::new();
    output.insert(SOURCES.to_string(), Value::Object(sources));
    output.insert(
        PROTOCOL_ADAPTERS.to_string(),
        Value::Object(single(adapter_id, adapter.clone())),
    );

    if let Some(server_id) = adapter.get(ADAPTER_SERVER).and_then(Value::as_str) {
        if let Some(server) = document
            .get(ADAPTER_SERVERS)
            .and_then(|servers| servers.get(server_id))
        {
            output.insert(
                ADAPTER_SERVERS.to_string(),
                Value::Object(single(server_id, server.clone())),
            );
        }
    }

    if let Some(metrics) = document.get(METRICS).and_then(Value::as_object) {
        let shared: Map<String, Value> = metrics
            .iter()
            .filter(|(key, _)| {
                [METRICS_INTERVAL, METRICS_WRITER, METRICS_NAMESPACE].contains(&key.as_str())
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !shared.is_empty() {
            output.insert(METRICS.to_string(), Value::Object(shared));
        }
    }

    Ok(Value::Object(output))
}

/// 目标服务的配置子集。
///
/// 沿子目标链（目标段内的 `Targets` 列表）递归收集目标，并只包含这些目标
/// 引用的进程内目标类型、目标服务端与凭证客户端。
pub fn target_configuration(document: &Value, target_id: &str) -> Result<Value, ConfigError> {
    let targets = section(document, TARGETS)?;
    let used_targets = used_targets(targets, target_id)?;

    let mut output = Map::new();
    for key in [AWS_VERSION, LOG_WRITER, METRICS] {
        if let Some(value) = document.get(key) {
            output.insert(key.to_string(), value.clone());
        }
    }

    let mut included = Map::new();
    let mut target_types = Map::new();
    let mut target_servers = Map::new();
    let mut clients = Map::new();

    for id in &used_targets {
        let Some(target) = targets.get(id) else {
            continue;
        };
        included.insert(id.clone(), target.clone());

        match target.get(TARGET_SERVER).and_then(Value::as_str) {
            Some(server_id) if !server_id.is_empty() => {
                if let Some(server) = document
                    .get(TARGET_SERVERS)
                    .and_then(|servers| servers.get(server_id))
                {
                    target_servers.insert(server_id.to_string(), server.clone());
                }
            }
            _ if id != target_id => {
                if let Some(target_type) = target.get(TARGET_TYPE).and_then(Value::as_str) {
                    if let Some(in_process) = document
                        .get(TARGET_TYPES)
                        .and_then(|types| types.get(target_type))
                    {
                        target_types.insert(target_type.to_string(), in_process.clone());
                    }
                }
            }
            _ => {}
        }

        if let Some(client_id) = target.get(CREDENTIAL_PROVIDER_CLIENT).and_then(Value::as_str) {
            let client = document
                .get(CREDENTIAL_PROVIDER_CLIENTS)
                .and_then(|all| all.get(client_id))
                .ok_or_else(|| {
                    ConfigError::Section(
                        CREDENTIAL_PROVIDER_CLIENTS.to_string(),
                        format!("client \"{}\" used by target \"{}\" does not exist", client_id, id),
                    )
                })?;
            clients.insert(client_id.to_string(), client.clone());
        }
    }

    output.insert(TARGETS.to_string(), Value::Object(included));
    if !target_types.is_empty() {
        output.insert(TARGET_TYPES.to_string(), Value::Object(target_types));
    }
    if !target_servers.is_empty() {
        output.insert(TARGET_SERVERS.to_string(), Value::Object(target_servers));
    }
    if !clients.is_empty() {
        output.insert(CREDENTIAL_PROVIDER_CLIENTS.to_string(), Value::Object(clients));
    }

    Ok(Value::Object(output))
}

/// 指标写入服务的配置子集。
///
/// `Metrics.Writer` 只保留 `MetricsServer`；凭证客户端按 `CredentialProviderClient`
/// 在指标段中递归查找。
pub fn metrics_configuration(document: &Value) -> Result<Value, ConfigError> {
    let mut metrics = section(document, METRICS)?.clone();

    let writer_server = metrics
        .get(METRICS_WRITER)
        .and_then(|writer| writer.get(METRICS_SERVER))
        .cloned();
    if let Some(server) = writer_server {
        metrics.insert(
            METRICS_WRITER.to_string(),
            Value::Object(single(METRICS_SERVER, server)),
        );
    }

    let mut output = Map::new();
    if let Some(version) = document.get(AWS_VERSION) {
        output.insert(AWS_VERSION.to_string(), version.clone());
    }
    if let Some(log_writer) = document.get(LOG_WRITER) {
        output.insert(LOG_WRITER.to_string(), log_writer.clone());
    }

    let metrics = Value::Object(metrics);
    if let Some(client_id) = find_value(&metrics, CREDENTIAL_PROVIDER_CLIENT).and_then(Value::as_str) {
        if let Some(client) = document
            .get(CREDENTIAL_PROVIDER_CLIENTS)
            .and_then(|all| all.get(client_id))
        {
            output.insert(
                CREDENTIAL_PROVIDER_CLIENTS.to_string(),
                Value::Object(single(client_id, client.clone())),
            );
        }
    }
    output.insert(METRICS.to_string(), metrics);

    Ok(Value::Object(output))
}

/// 目标及其所有子目标的 ID（含自身）。
fn used_targets(targets: &Map<String, Value>, target_id: &str) -> Result<BTreeSet<String>, ConfigError> {
    if !targets.contains_key(target_id) {
        return Err(ConfigError::Section(
            TARGETS.to_string(),
            format!("target \"{}\" does not exist", target_id),
        ));
    }

    let mut used = BTreeSet::new();
    let mut pending = vec![target_id.to_string()];
    while let Some(id) = pending.pop() {
        if !used.insert(id.clone()) {
            continue;
        }
        let Some(target) = targets.get(&id) else {
            return Err(ConfigError::Section(
                TARGETS.to_string(),
                format!("sub-target \"{}\" does not exist", id),
            ));
        };
        if let Some(sub_targets) = target.get(TARGETS).and_then(Value::as_array) {
            pending.extend(sub_targets.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }
    Ok(used)
}

fn section<'a>(document: &'a Value, name: &str) -> Result<&'a Map<String, Value>, ConfigError> {
    document
        .get(name)
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::Section(name.to_string(), "section is missing".to_string()))
}

fn single(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

fn strip_channel_details(source: &Value) -> Value {
    let mut source = source.clone();
    if let Some(channels) = source.get_mut(CHANNELS).and_then(Value::as_object_mut) {
        for channel in channels.values_mut() {
            if let Some(channel) = channel.as_object_mut() {
                for key in CHANNEL_KEYS_NOT_USED_BY_ADAPTER {
                    channel.remove(key);
                }
            }
        }
    }
    source
}

fn find_value<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    for (key, child) in object {
        if key == name && !child.is_null() {
            return Some(child);
        }
        if let Some(found) = find_value(child, name) {
            return Some(found);
        }
    }
    None
}
