//! 健康探针 HTTP 服务
//!
//! GET 返回配置的响应文本，HEAD 返回空 200，不健康返回 503。
//! 支持每秒请求限流（429）、来源 IP 白名单（403）与检查结果缓存；
//! 持续不健康超过 `StopAfterUnhealthyPeriod` 时执行停止动作。

use crate::error::IpcError;
use crate::session::stopped;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use edge_config::HealthProbeConfig;
use edge_telemetry::new_request_ids;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, warn};

/// 探针服务未运行时的重启检查间隔
const RESTART_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// 被探测的健康状态。
pub trait HealthCheck: Send + Sync {
    fn is_healthy(&self) -> bool;
}

/// 持续不健康时的停止动作。
pub type UnhealthyAction = Arc<dyn Fn() + Send + Sync>;

struct ProbeCache {
    checked_at: Option<Instant>,
    healthy: bool,
    first_unhealthy: Option<Instant>,
    stop_triggered: bool,
    window_start: Instant,
    window_requests: u32,
}

/// 探针共享状态。
pub struct ProbeState {
    config: HealthProbeConfig,
    check: Arc<dyn HealthCheck>,
    on_unhealthy: UnhealthyAction,
    cache: Mutex<ProbeCache>,
}

impl ProbeState {
    pub fn new(
        config: HealthProbeConfig,
        check: Arc<dyn HealthCheck>,
        on_unhealthy: UnhealthyAction,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            check,
            on_unhealthy,
            cache: Mutex::new(ProbeCache {
                checked_at: None,
                healthy: true,
                first_unhealthy: None,
                stop_triggered: false,
                window_start: Instant::now(),
                window_requests: 0,
            }),
        })
    }

    fn ip_allowed(&self, peer: Option<SocketAddr>) -> bool {
        let Some(allowed) = self.config.allowed_ip_addresses.as_ref() else {
            return true;
        };
        if allowed.is_empty() {
            return true;
        }
        match peer {
            Some(peer) => {
                let ip = peer.ip().to_string();
                allowed.iter().any(|address| address == &ip)
            }
            None => false,
        }
    }

    async fn within_rate_limit(&self) -> bool {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        if now.duration_since(cache.window_start) >= Duration::from_secs(1) {
            cache.window_start = now;
            cache.window_requests = 0;
        }
        cache.window_requests += 1;
        cache.window_requests <= self.config.rate_limit
    }

    /// 在保持期内复用上次结果。
    async fn healthy(&self) -> bool {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        let fresh = cache
            .checked_at
            .is_some_and(|at| now.duration_since(at) < self.config.retain_state());
        if !fresh {
            cache.healthy = self.check.is_healthy();
            cache.checked_at = Some(now);
        }

        if cache.healthy {
            cache.first_unhealthy = None;
            return true;
        }

        let since = *cache.first_unhealthy.get_or_insert(now);
        if let Some(limit) = self.config.stop_after_unhealthy() {
            if !cache.stop_triggered && now.duration_since(since) >= limit {
                cache.stop_triggered = true;
                error!(
                    target: "edge.host",
                    unhealthy_ms = now.duration_since(since).as_millis() as u64,
                    "health_probe_stop"
                );
                (self.on_unhealthy)();
            }
        }
        false
    }
}

/// 探针路由。
pub fn router(state: Arc<ProbeState>) -> Router {
    let path = state.config.route_path();
    Router::new()
        .route(&path, get(probe))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_context)),
        )
}

async fn probe(
    State(state): State<Arc<ProbeState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if !state.ip_allowed(connect.map(|ConnectInfo(addr)| addr)) {
        return no_cache(StatusCode::FORBIDDEN, String::new());
    }
    if !state.within_rate_limit().await {
        return no_cache(StatusCode::TOO_MANY_REQUESTS, String::new());
    }
    if !state.healthy().await {
        return no_cache(StatusCode::SERVICE_UNAVAILABLE, String::new());
    }
    // HEAD 请求由 axum 去掉响应体
    no_cache(StatusCode::OK, state.config.response.clone())
}

fn no_cache(status: StatusCode, body: String) -> Response {
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let ids = new_request_ids();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ids.clone());

    let span = tracing::info_span!(
        "health_probe",
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        method = %method,
        path = %path
    );

    let mut response = next.run(req).instrument(span).await;
    response.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&ids.request_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response.headers_mut().insert(
        "x-trace-id",
        HeaderValue::from_str(&ids.trace_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response
}

/// 运行中的探针服务。
pub struct HealthProbeService {
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl HealthProbeService {
    /// 启动探针；配置为非激活时返回 `None`。
    pub async fn start(
        config: HealthProbeConfig,
        check: Arc<dyn HealthCheck>,
        on_unhealthy: UnhealthyAction,
    ) -> Result<Option<Self>, IpcError> {
        config.validate()?;
        if !config.active {
            info!(target: "edge.host", "health_probe_inactive");
            return Ok(None);
        }

        let bind_address = config.bind_address();
        let listener = TcpListener::bind(&bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(
            target: "edge.host",
            address = %local_addr,
            path = %config.route_path(),
            "health_probe_started"
        );

        let app = router(ProbeState::new(config, check, on_unhealthy));
        let (stop, stop_rx) = watch::channel(false);
        let first = serve(listener, app.clone(), stop_rx.clone());
        let supervisor = tokio::spawn(supervise(first, bind_address, app, stop_rx));

        Ok(Some(Self {
            stop,
            supervisor,
            local_addr,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.supervisor.await;
    }
}

fn serve(listener: TcpListener, app: Router, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async move { stopped(&mut stop).await })
            .await
        {
            error!(target: "edge.host", error = %e, "health_probe_failed");
        }
    })
}

/// 每分钟检查一次，探针服务意外停止时重新监听。
async fn supervise(
    first: JoinHandle<()>,
    bind_address: String,
    app: Router,
    mut stop: watch::Receiver<bool>,
) {
    let mut server = Some(first);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(RESTART_CHECK_INTERVAL) => {}
            _ = stopped(&mut stop) => break,
        }
        if server.as_ref().is_some_and(|task| !task.is_finished()) {
            continue;
        }
        warn!(target: "edge.host", address = %bind_address, "health_probe_restart");
        server = match TcpListener::bind(&bind_address).await {
            Ok(listener) => Some(serve(listener, app.clone(), stop.clone())),
            Err(e) => {
                error!(target: "edge.host", address = %bind_address, error = %e, "health_probe_bind_failed");
                None
            }
        };
    }
    if let Some(task) = server {
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Flag(AtomicBool);

    impl HealthCheck for Flag {
        fn is_healthy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config() -> HealthProbeConfig {
        let mut config = HealthProbeConfig::new("/health", 8181);
        config.retain_state_period = 0;
        config
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let mut config = config();
        config.rate_limit = 2;
        let state = ProbeState::new(config, Arc::new(Flag(AtomicBool::new(true))), Arc::new(|| {}));
        assert!(state.within_rate_limit().await);
        assert!(state.within_rate_limit().await);
        assert!(!state.within_rate_limit().await);
    }

    #[tokio::test]
    async fn test_ip_filter() {
        let mut config = config();
        config.allowed_ip_addresses = Some(vec!["10.0.0.1".to_string()]);
        let state = ProbeState::new(config, Arc::new(Flag(AtomicBool::new(true))), Arc::new(|| {}));
        assert!(state.ip_allowed(Some("10.0.0.1:5000".parse().expect("addr"))));
        assert!(!state.ip_allowed(Some("10.0.0.2:5000".parse().expect("addr"))));
        assert!(!state.ip_allowed(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_sustained_unhealthy() {
        let mut config = config();
        config.stop_after_unhealthy_period = Some(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let state = ProbeState::new(
            config,
            Arc::new(Flag(AtomicBool::new(false))),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!state.healthy().await);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!state.healthy().await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!state.healthy().await);
        assert!(!state.healthy().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_retained_within_period() {
        let mut config = config();
        config.retain_state_period = 1000;
        let flag = Arc::new(Flag(AtomicBool::new(true)));
        let state = ProbeState::new(config, flag.clone(), Arc::new(|| {}));

        assert!(state.healthy().await);
        flag.0.store(false, Ordering::SeqCst);
        assert!(state.healthy().await);
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!state.healthy().await);
    }
}
