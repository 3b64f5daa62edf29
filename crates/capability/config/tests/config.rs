use edge_config::{AppConfig, ConnectionSecurity};

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("EDGE_IPC_PORT", "50061");
        std::env::set_var("EDGE_IPC_ADDRESS", "127.0.0.1");
        std::env::set_var("EDGE_IPC_TARGET_ID", "debug");
        std::env::set_var("EDGE_HEALTH_PROBE_PORT", "8182");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.ipc_port, 50061);
    assert_eq!(config.ipc_address, "127.0.0.1");
    assert_eq!(config.connection_type, ConnectionSecurity::PlainText);
    assert_eq!(config.target_id.as_deref(), Some("debug"));
    assert_eq!(config.shutdown_timeout_seconds, 15);

    let endpoint = config.endpoint().expect("endpoint");
    assert!(endpoint.used_by_server);
    assert_eq!(endpoint.address_str(), "127.0.0.1:50061");
    let probe = endpoint.health_probe.expect("health probe");
    assert_eq!(probe.port, 8182);
    assert_eq!(probe.route_path(), "/health");
}
