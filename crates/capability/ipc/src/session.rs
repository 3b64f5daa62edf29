//! 通用会话
//!
//! 一个会话绑定一个端点和一个角色（读取数据源 / 写入目标 / 指标），以独立任务运行：
//!
//! ```text
//! Idle ─► Connecting ─► Initializing ─► Streaming
//!             ▲                             │ 错误
//!             └────────── Backoff ◄─────────┘
//! 任意状态 ─(stop)─► Stopped
//! ```
//!
//! 角色只实现握手与流处理，连接获取、重置与退避由会话统一处理。

use crate::connection::{Connection, ConnectionManager};
use crate::error::IpcError;
use async_trait::async_trait;
use edge_telemetry::{record_initialize_failure, record_reconnect_backoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 会话运行参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// 传输错误后的固定重连间隔
    pub reconnect_delay: Duration,
    /// 角色未就绪时的轮询间隔
    pub readiness_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
            readiness_poll: Duration::from_secs(1),
        }
    }
}

/// 会话状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// 等待角色就绪（指标读取等待所属会话初始化）
    Waiting,
    Connecting,
    Initializing,
    Streaming,
    /// 本轮连接失败，即将重置并退避
    Error,
    Backoff,
    Stopped,
}

/// 流处理结束方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// 消费者要求停止，会话结束
    Stopped,
    /// 对端结束了流，重连
    Completed,
}

/// 会话角色。
#[async_trait]
pub trait SessionRole: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// 为 false 时会话按 `readiness_poll` 轮询等待。
    fn ready(&self) -> bool {
        true
    }

    /// 配置下发握手。
    async fn initialize(&self, connection: &Connection) -> Result<(), IpcError>;

    /// 数据流处理，直到出错或结束。
    async fn stream(&self, connection: &Connection) -> Result<StreamEnd, IpcError>;

    /// 连接被重置后调用。
    async fn reset(&self) {}
}

/// 运行中会话的句柄。
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), IpcError>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// 会话停止信号，用于让挂起的调用方感知关闭。
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 等待进入指定状态。
    pub async fn wait_for(&self, expected: SessionState) -> Result<(), IpcError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == expected)
            .await
            .map(|_| ())
            .map_err(|_| IpcError::Shutdown)
    }

    /// 请求停止并等待会话结束。
    pub async fn stop(self) -> Result<(), IpcError> {
        let _ = self.stop.send(true);
        self.join().await
    }

    /// 等待会话自行结束。
    pub async fn join(self) -> Result<(), IpcError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(IpcError::Connection(format!("session task failed: {}", e))),
        }
    }
}

/// 启动会话任务。
pub fn spawn_session<R: SessionRole>(
    role: Arc<R>,
    manager: Arc<ConnectionManager>,
    config: SessionConfig,
) -> SessionHandle {
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(role, manager, config, state_tx, stop_rx));
    SessionHandle {
        state: state_rx,
        stop: stop_tx,
        task,
    }
}

async fn run<R: SessionRole>(
    role: Arc<R>,
    manager: Arc<ConnectionManager>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), IpcError> {
    let address = manager.endpoint().address_str();
    let name = role.name();
    info!(target: "edge.ipc", role = name, address = %address, "session_started");

    let result = loop {
        if !role.ready() {
            state.send_replace(SessionState::Waiting);
            tokio::select! {
                _ = tokio::time::sleep(config.readiness_poll) => continue,
                _ = stopped(&mut stop) => break Ok(()),
            }
        }

        let attempt = async {
            state.send_replace(SessionState::Connecting);
            let connection = manager.acquire().await?;

            state.send_replace(SessionState::Initializing);
            if let Err(err) = role.initialize(&connection).await {
                record_initialize_failure();
                return Err(err);
            }
            info!(target: "edge.ipc", role = name, address = %address, "session_initialized");

            state.send_replace(SessionState::Streaming);
            role.stream(&connection).await
        };

        let outcome = tokio::select! {
            outcome = attempt => outcome,
            _ = stopped(&mut stop) => break Ok(()),
        };

        match outcome {
            Ok(StreamEnd::Stopped) => {
                info!(target: "edge.ipc", role = name, address = %address, "session_stream_stopped");
                break Ok(());
            }
            Ok(StreamEnd::Completed) => {
                info!(target: "edge.ipc", role = name, address = %address, "session_stream_completed");
            }
            Err(err) if err.is_fatal() => {
                error!(target: "edge.ipc", role = name, address = %address, error = %err, "session_failed");
                break Err(err);
            }
            Err(err) if err.is_shutdown() => {
                state.send_replace(SessionState::Error);
                info!(target: "edge.ipc", role = name, address = %address, error = %err, "session_peer_shutdown");
            }
            Err(err) => {
                state.send_replace(SessionState::Error);
                error!(target: "edge.ipc", role = name, address = %address, error = %err, "session_error");
            }
        }

        manager.reset().await;
        role.reset().await;

        state.send_replace(SessionState::Backoff);
        record_reconnect_backoff();
        info!(
            target: "edge.ipc",
            role = name,
            address = %address,
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "session_backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = stopped(&mut stop) => break Ok(()),
        }
    };

    manager.close().await;
    role.reset().await;
    state.send_replace(SessionState::Stopped);
    info!(target: "edge.ipc", role = name, address = %address, "session_stopped");
    result
}

/// 停止信号置位或发送端释放时返回。
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
