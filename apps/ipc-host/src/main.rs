//! 目标服务进程：在 IPC 端点上托管调试目标，并按配置启动健康探针。

mod debug_target;

use debug_target::DebugTargetFactory;
use edge_config::AppConfig;
use edge_ipc::{HealthCheck, HealthProbeService, HostServices, SessionHost};
use edge_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    // 证书与私钥在此校验，缺失时直接退出
    let endpoint = config.endpoint()?;
    let services = HostServices::default().with_target(
        Arc::new(DebugTargetFactory::new(config.target_type.clone())),
        config.target_id.clone(),
    );
    let host = SessionHost::start(endpoint.clone(), services).await?;

    // 持续不健康时通知主任务退出
    let unhealthy = Arc::new(Notify::new());
    let probe = match endpoint.health_probe.clone() {
        Some(probe_config) => {
            let notify = Arc::clone(&unhealthy);
            let check: Arc<dyn HealthCheck> = Arc::new(host.clone());
            HealthProbeService::start(probe_config, check, Arc::new(move || notify.notify_one()))
                .await?
        }
        None => None,
    };

    let failed = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!(target: "edge.host", "shutdown_requested");
            false
        }
        _ = unhealthy.notified() => {
            error!(target: "edge.host", "shutdown_unhealthy");
            true
        }
    };

    if tokio::time::timeout(config.shutdown_timeout(), host.stop())
        .await
        .is_err()
    {
        error!(target: "edge.host", "shutdown_timeout");
    }
    if let Some(probe) = probe {
        probe.stop().await;
    }
    info!(target: "edge.host", counters = ?metrics().snapshot(), "host_exited");

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
