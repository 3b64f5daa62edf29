use edge_config::ConfigSubset;
use edge_config::subset::{
    adapter_configuration, metrics_configuration, parse_document, target_configuration,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;

fn document() -> Value {
    json!({
        "AWSVersion": "2022-04-02",
        "Name": "plant-1",
        "LogLevel": "Info",
        "Schedules": [{"Name": "fast", "Interval": 1000}],
        "Transformations": {"Celsius": [{"Operator": "Multiply", "Operand": 1.8}]},
        "LogWriter": {"LogWriterType": "console"},
        "Metrics": {
            "Interval": 10,
            "Namespace": "Edge",
            "CollectCoreMetrics": true,
            "Writer": {
                "MetricsWriterType": "ipc",
                "MetricsServer": {"Address": "localhost", "Port": 50070, "CredentialProviderClient": "metrics-client"}
            }
        },
        "Sources": {
            "boiler": {
                "ProtocolAdapter": "opcua-1",
                "Channels": {
                    "temp": {"NodeId": "ns=2;s=Temp", "Name": "Temperature", "Transformation": "Celsius", "ValueFilter": "f1"}
                }
            },
            "pump": {"ProtocolAdapter": "opcua-2", "Channels": {"rpm": {"NodeId": "ns=2;s=Rpm"}}},
            "press": {"ProtocolAdapter": "modbus-1", "Channels": {"p": {"Address": 40001}}}
        },
        "ProtocolAdapters": {
            "opcua-1": {"AdapterType": "OPCUA", "AdapterServer": "opcua-server"},
            "opcua-2": {"AdapterType": "OPCUA", "AdapterServer": "opcua-server"},
            "modbus-1": {"AdapterType": "MODBUS", "AdapterServer": "modbus-server"}
        },
        "AdapterServers": {
            "opcua-server": {"Address": "localhost", "Port": 50051},
            "modbus-server": {"Address": "localhost", "Port": 50052}
        },
        "Targets": {
            "router": {"TargetType": "ROUTER", "TargetServer": "router-server", "Targets": ["s3", "debug"]},
            "s3": {"TargetType": "AWS-S3", "CredentialProviderClient": "s3-client"},
            "debug": {"TargetType": "DEBUG-TARGET"},
            "unrelated": {"TargetType": "AWS-SQS", "TargetServer": "sqs-server"}
        },
        "TargetTypes": {
            "AWS-S3": {"JarFiles": ["s3.jar"]},
            "DEBUG-TARGET": {"JarFiles": ["debug.jar"]},
            "AWS-SQS": {"JarFiles": ["sqs.jar"]}
        },
        "TargetServers": {
            "router-server": {"Address": "localhost", "Port": 50060},
            "sqs-server": {"Address": "localhost", "Port": 50061}
        },
        "AwsIotCredentialProviderClients": {
            "s3-client": {"IotCredentialEndpoint": "x.credentials.iot"},
            "metrics-client": {"IotCredentialEndpoint": "m.credentials.iot"},
            "unused-client": {"IotCredentialEndpoint": "u.credentials.iot"}
        }
    })
}

#[test]
fn adapter_subset_contains_only_reachable_sections() {
    let doc = document();
    let subset = adapter_configuration(&doc, "opcua-1", &["boiler".to_string()]).expect("subset");
    let object = subset.as_object().expect("object");

    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["AdapterServers", "Metrics", "ProtocolAdapters", "Sources"]);

    // 同一 adapter 服务上的数据源都包含在内
    let sources = subset["Sources"].as_object().expect("sources");
    assert!(sources.contains_key("boiler"));
    assert!(sources.contains_key("pump"));
    assert!(!sources.contains_key("press"));

    let channel = &subset["Sources"]["boiler"]["Channels"]["temp"];
    assert_eq!(channel["NodeId"], "ns=2;s=Temp");
    assert!(channel.get("Name").is_none());
    assert!(channel.get("Transformation").is_none());
    assert!(channel.get("ValueFilter").is_none());

    assert_eq!(subset["ProtocolAdapters"].as_object().map(|m| m.len()), Some(1));
    assert!(subset["AdapterServers"].get("opcua-server").is_some());
    assert!(subset["AdapterServers"].get("modbus-server").is_none());
    assert!(subset["Metrics"].get("CollectCoreMetrics").is_none());
    assert_eq!(subset["Metrics"]["Namespace"], "Edge");
}

#[test]
fn target_subset_follows_sub_targets() {
    let doc = document();
    let subset = target_configuration(&doc, "router").expect("subset");

    let targets = subset["Targets"].as_object().expect("targets");
    let mut ids: Vec<&str> = targets.keys().map(String::as_str).collect();
    ids.sort();
    assert_eq!(ids, vec!["debug", "router", "s3"]);

    let types = subset["TargetTypes"].as_object().expect("types");
    assert!(types.contains_key("AWS-S3"));
    assert!(types.contains_key("DEBUG-TARGET"));
    assert!(!types.contains_key("AWS-SQS"));

    let servers = subset["TargetServers"].as_object().expect("servers");
    assert_eq!(servers.len(), 1);
    assert!(servers.contains_key("router-server"));

    let clients = subset["AwsIotCredentialProviderClients"].as_object().expect("clients");
    assert_eq!(clients.len(), 1);
    assert!(clients.contains_key("s3-client"));
    assert_eq!(subset["AWSVersion"], "2022-04-02");
    assert!(subset.get("Sources").is_none());
}

#[test]
fn target_subset_missing_credential_client_is_error() {
    let mut doc = document();
    doc["Targets"]["s3"]["CredentialProviderClient"] = json!("missing-client");
    assert!(target_configuration(&doc, "router").is_err());
}

#[test]
fn metrics_subset_reduces_writer_to_server() {
    let doc = document();
    let subset = metrics_configuration(&doc).expect("subset");
    let writer = subset["Metrics"]["Writer"].as_object().expect("writer");
    assert_eq!(writer.len(), 1);
    assert!(writer.contains_key("MetricsServer"));
    let clients = subset["AwsIotCredentialProviderClients"].as_object().expect("clients");
    assert_eq!(clients.len(), 1);
    assert!(clients.contains_key("metrics-client"));
    assert!(subset.get("LogWriter").is_some());
}

#[test]
fn extraction_is_idempotent_and_minimal() {
    let doc = document();
    let secrets = BTreeMap::new();

    let first = ConfigSubset::build(
        &adapter_configuration(&doc, "opcua-1", &["boiler".to_string()]).expect("subset"),
        &secrets,
    )
    .expect("build");
    let second = ConfigSubset::build(
        &adapter_configuration(&doc, "opcua-1", &["boiler".to_string()]).expect("subset"),
        &secrets,
    )
    .expect("build");
    assert_eq!(first.configuration, second.configuration);

    let mut reduced = doc.clone();
    let object = reduced.as_object_mut().expect("object");
    for unrelated in ["Schedules", "Transformations", "Name", "LogLevel", "TargetServers"] {
        object.remove(unrelated);
    }
    let third = ConfigSubset::build(
        &adapter_configuration(&reduced, "opcua-1", &["boiler".to_string()]).expect("subset"),
        &secrets,
    )
    .expect("build");
    assert_eq!(first.configuration, third.configuration);

    let target_full = serde_json::to_string(&target_configuration(&doc, "router").expect("t")).expect("json");
    let mut without_sources = doc.clone();
    without_sources.as_object_mut().expect("object").remove("Sources");
    let target_reduced =
        serde_json::to_string(&target_configuration(&without_sources, "router").expect("t")).expect("json");
    assert_eq!(target_full, target_reduced);
}

#[test]
fn handoff_carries_only_referenced_secrets() {
    let mut doc = document();
    doc["AdapterServers"]["opcua-server"]["Password"] = json!("pa55word");
    let mut secrets = BTreeMap::new();
    secrets.insert("opcua-password".to_string(), "pa55word".to_string());
    secrets.insert("s3-key".to_string(), "AKIA-not-sent".to_string());

    let subset = ConfigSubset::build(
        &adapter_configuration(&doc, "opcua-1", &["boiler".to_string()]).expect("subset"),
        &secrets,
    )
    .expect("build");
    assert_eq!(subset.secrets.len(), 1);
    assert!(subset.secrets.contains_key("opcua-password"));
}

#[test]
fn parse_document_rejects_non_object() {
    assert!(parse_document("[1, 2]").is_err());
    assert!(parse_document(r#"{"Targets": {}}"#).is_ok());
}
