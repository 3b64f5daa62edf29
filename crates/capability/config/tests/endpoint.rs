use edge_config::{ConfigError, ConnectionSecurity, EndpointConfig};
use std::path::PathBuf;

fn temp_file(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("edge-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join(name);
    std::fs::write(&path, "placeholder").expect("write temp file");
    path
}

#[test]
fn mutual_tls_client_requires_all_three_files() {
    let cert = temp_file("client.crt");
    let key = temp_file("client.key");
    let ca = temp_file("ca.crt");

    let complete = EndpointConfig::new("localhost", 5000)
        .with_connection_type(ConnectionSecurity::MutualTls)
        .with_client_credentials(&cert, &key, &ca);
    complete.validate().expect("complete mutual tls config");
    assert_eq!(complete.monitored_certificates(), vec![ca.clone(), cert.clone()]);

    let mut missing_cert = complete.clone();
    missing_cert.client_certificate = None;
    let mut missing_key = complete.clone();
    missing_key.client_private_key = None;
    let mut missing_ca = complete.clone();
    missing_ca.ca_certificate = None;

    for (config, key_name) in [
        (missing_cert, "ClientCertificate"),
        (missing_key, "ClientPrivateKey"),
        (missing_ca, "CaCertificate"),
    ] {
        match config.validate() {
            Err(ConfigError::Missing(message)) => assert!(message.starts_with(key_name)),
            other => panic!("expected missing {}, got {:?}", key_name, other),
        }
    }
}

#[test]
fn configured_file_must_exist() {
    let endpoint = EndpointConfig::new("localhost", 5000)
        .with_connection_type(ConnectionSecurity::ServerSideTls)
        .with_server_certificate("/nonexistent/server.crt");
    assert!(matches!(endpoint.validate(), Err(ConfigError::Invalid(key, _)) if key == "ServerCertificate"));
}

#[test]
fn mutual_tls_host_uses_server_side_files() {
    let cert = temp_file("server.crt");
    let key = temp_file("server.key");
    let ca = temp_file("server-ca.crt");

    let endpoint = EndpointConfig::new("0.0.0.0", 5001)
        .with_connection_type(ConnectionSecurity::MutualTls)
        .with_server_certificate(&cert)
        .with_server_private_key(&key)
        .with_ca_certificate(&ca)
        .for_server();
    endpoint.validate().expect("server mutual tls");
    assert_eq!(endpoint.monitored_certificates(), vec![cert, ca]);
}
