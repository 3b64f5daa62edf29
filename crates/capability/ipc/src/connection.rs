//! 连接与连接管理
//!
//! `Connection` 绑定一个端点及其凭证，每个 RPC 调用通过 `open_stream` 打开独立的流。
//! `ConnectionManager` 在互斥锁下持有至多一个 `Connection`：首次 `acquire` 时解析凭证并创建，
//! `reset` / `close` 时停止到期监控并释放。

use crate::cert_expiry::{ExpiryMonitor, inspect_certificates};
use crate::credentials::{Credentials, resolve_credentials, server_name};
use crate::error::IpcError;
use crate::wire::{Frame, FrameReader, FrameWriter, split_stream};
use edge_config::EndpointConfig;
use edge_telemetry::{record_connection_created, record_connection_reset};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// 一个端点的通道句柄。
pub struct Connection {
    address: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    compression: bool,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(endpoint: &EndpointConfig, credentials: &Credentials) -> Result<Self, IpcError> {
        let tls = match &credentials.tls {
            Some(config) => Some((
                TlsConnector::from(Arc::clone(config)),
                server_name(&endpoint.address)?,
            )),
            None => None,
        };
        Ok(Self {
            address: endpoint.address_str(),
            tls,
            compression: endpoint.compression,
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// 打开一条新的双向流；端点启用 `Compression` 时发送端压缩。
    pub async fn open_stream(&self) -> Result<(FrameReader, FrameWriter), IpcError> {
        let (reader, mut writer) = self.open_raw_stream().await?;
        writer.set_compression(self.compression);
        Ok((reader, writer))
    }

    async fn open_raw_stream(&self) -> Result<(FrameReader, FrameWriter), IpcError> {
        if self.is_closed() {
            return Err(IpcError::Shutdown);
        }

        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|e| IpcError::Connection(format!("{}: {}", self.address, e)))?;
        tcp.set_nodelay(true)?;

        match &self.tls {
            Some((connector, name)) => {
                let stream = connector
                    .connect(name.clone(), tcp)
                    .await
                    .map_err(|e| IpcError::Connection(format!("{}: {}", self.address, e)))?;
                debug!(target: "edge.ipc", address = %self.address, "tls_stream_opened");
                Ok(split_stream(stream))
            }
            None => {
                debug!(target: "edge.ipc", address = %self.address, "stream_opened");
                Ok(split_stream(tcp))
            }
        }
    }

    /// 单次请求-应答调用。
    pub async fn call(&self, request: &Frame) -> Result<Frame, IpcError> {
        let (mut reader, mut writer) = self.open_stream().await?;
        writer.send(request).await?;
        match reader.next().await? {
            Some(Frame::Error { message }) => Err(IpcError::Remote(message)),
            Some(reply) => Ok(reply),
            None => Err(IpcError::Connection(format!(
                "{}: stream closed before reply",
                self.address
            ))),
        }
    }

    /// 标记关闭，之后不再打开新流。
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ActiveConnection {
    connection: Arc<Connection>,
    monitor: ExpiryMonitor,
}

/// 单端点连接管理器。
pub struct ConnectionManager {
    endpoint: EndpointConfig,
    active: Mutex<Option<ActiveConnection>>,
}

impl ConnectionManager {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            active: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// 返回现有连接，没有则解析凭证后创建。
    pub async fn acquire(&self) -> Result<Arc<Connection>, IpcError> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            return Ok(Arc::clone(&existing.connection));
        }

        let credentials = resolve_credentials(&self.endpoint).await?;
        let connection = Arc::new(Connection::new(&self.endpoint, &credentials)?);
        let monitor = ExpiryMonitor::start(
            inspect_certificates(&credentials.certificates),
            self.endpoint.expiration_warning_period,
        );

        record_connection_created();
        info!(
            target: "edge.ipc",
            address = %self.endpoint.address_str(),
            connection_type = %self.endpoint.connection_type,
            "connection_created"
        );

        *active = Some(ActiveConnection {
            connection: Arc::clone(&connection),
            monitor,
        });
        Ok(connection)
    }

    /// 释放当前连接，下次 `acquire` 重新创建。
    pub async fn reset(&self) {
        if self.release().await {
            record_connection_reset();
            info!(target: "edge.ipc", address = %self.endpoint.address_str(), "connection_reset");
        }
    }

    /// 最终关闭；可重复调用。
    pub async fn close(&self) {
        if self.release().await {
            info!(target: "edge.ipc", address = %self.endpoint.address_str(), "connection_closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn release(&self) -> bool {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(mut previous) => {
                previous.monitor.stop();
                previous.connection.close();
                true
            }
            None => false,
        }
    }
}
