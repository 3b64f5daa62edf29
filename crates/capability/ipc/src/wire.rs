//! 帧格式与编解码
//!
//! 每个 RPC 调用独占一条 TCP/TLS 流，帧为一行 JSON（`\n` 分隔）。
//! 启用压缩的一端发送 gzip 记录：`0x00`、4 字节大端长度、gzip 数据。
//! 读取端两种格式都接受。
//!
//! ```text
//! 初始化：  Initialize ──► InitializeReply
//! 读取数据：ReadValues ──► ReadReply*
//! 写入目标：WriteValues* ◄─► (Received | TargetResult)*
//! 读取指标：ReadMetrics ──► MetricsData*
//! 写入指标：WriteMetrics*
//! ```

use crate::error::IpcError;
use domain::{AcknowledgmentPolicy, ReadResult, TargetData};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// 单帧（解压后）最大字节数
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const COMPRESSED_MARKER: u8 = 0x00;
const COMPRESSED_HEADER_LEN: usize = 5;

/// 初始化握手的目标服务。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Adapter,
    Target,
    Metrics,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Adapter => "adapter",
            ServiceKind::Target => "target",
            ServiceKind::Metrics => "metrics",
        }
    }
}

/// 线上帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Initialize {
        service: ServiceKind,
        configuration: String,
        #[serde(default)]
        secrets: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default)]
        policy: AcknowledgmentPolicy,
    },
    InitializeReply {
        initialized: bool,
        #[serde(default)]
        message: String,
    },
    ReadValues {
        /// 数据源 -> 通道 ID 列表
        sources: BTreeMap<String, Vec<String>>,
        interval_ms: u64,
    },
    ReadReply {
        result: ReadResult,
    },
    WriteValues {
        data: TargetData,
    },
    /// 宿主已处理该批次（与确认策略无关）
    Received {
        serial: String,
    },
    TargetResult {
        result: domain::TargetResult,
    },
    ReadMetrics {
        interval_ms: u64,
    },
    MetricsData {
        data: domain::MetricsData,
    },
    WriteMetrics {
        data: domain::MetricsData,
    },
    Error {
        message: String,
    },
}

impl Frame {
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Initialize { .. } => "initialize",
            Frame::InitializeReply { .. } => "initialize_reply",
            Frame::ReadValues { .. } => "read_values",
            Frame::ReadReply { .. } => "read_reply",
            Frame::WriteValues { .. } => "write_values",
            Frame::Received { .. } => "received",
            Frame::TargetResult { .. } => "target_result",
            Frame::ReadMetrics { .. } => "read_metrics",
            Frame::MetricsData { .. } => "metrics_data",
            Frame::WriteMetrics { .. } => "write_metrics",
            Frame::Error { .. } => "error",
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 拆分读写两端。
pub fn split_stream<S>(stream: S) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        FrameReader::new(Box::new(reader)),
        FrameWriter::new(Box::new(writer)),
    )
}

/// 帧读取端。
///
/// `next` 可在 `select!` 中被取消，已读到的字节保留在缓冲区。
pub struct FrameReader {
    inner: BufReader<BoxedReader>,
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            inner: BufReader::new(reader),
            buffer: Vec::new(),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// 读取下一帧；对端关闭时返回 `None`。
    pub async fn next(&mut self) -> Result<Option<Frame>, IpcError> {
        loop {
            if let Some(frame) = self.parse_buffered(false)? {
                return Ok(Some(frame));
            }
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return self.parse_buffered(true);
            }
            let n = available.len();
            self.buffer.extend_from_slice(available);
            self.inner.consume(n);
        }
    }

    fn parse_buffered(&mut self, eof: bool) -> Result<Option<Frame>, IpcError> {
        let Some(start) = self.buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buffer.clear();
            return Ok(None);
        };
        self.buffer.drain(..start);

        if self.buffer[0] == COMPRESSED_MARKER {
            if self.buffer.len() < COMPRESSED_HEADER_LEN {
                return incomplete(eof);
            }
            let len = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;
            if len > self.max_frame_len {
                return Err(too_large(len, self.max_frame_len));
            }
            if self.buffer.len() < COMPRESSED_HEADER_LEN + len {
                return incomplete(eof);
            }
            let record: Vec<u8> = self
                .buffer
                .drain(..COMPRESSED_HEADER_LEN + len)
                .skip(COMPRESSED_HEADER_LEN)
                .collect();
            let json = decompress(&record, self.max_frame_len)?;
            return decode(&json).map(Some);
        }

        match self.buffer.iter().position(|b| *b == b'\n') {
            Some(end) if end > self.max_frame_len => Err(too_large(end, self.max_frame_len)),
            Some(end) => {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                decode(&line).map(Some)
            }
            None if self.buffer.len() > self.max_frame_len => {
                Err(too_large(self.buffer.len(), self.max_frame_len))
            }
            None if eof => {
                let line = std::mem::take(&mut self.buffer);
                decode(&line).map(Some)
            }
            None => Ok(None),
        }
    }
}

fn incomplete(eof: bool) -> Result<Option<Frame>, IpcError> {
    if eof {
        Err(IpcError::Codec("stream closed inside a compressed frame".to_string()))
    } else {
        Ok(None)
    }
}

fn too_large(len: usize, max: usize) -> IpcError {
    IpcError::Codec(format!("frame of {} bytes exceeds the limit of {} bytes", len, max))
}

fn decode(bytes: &[u8]) -> Result<Frame, IpcError> {
    serde_json::from_slice(bytes).map_err(|e| IpcError::Codec(format!("invalid frame: {}", e)))
}

fn decompress(record: &[u8], max: usize) -> Result<Vec<u8>, IpcError> {
    let mut json = Vec::new();
    GzDecoder::new(record)
        .take(max as u64 + 1)
        .read_to_end(&mut json)
        .map_err(|e| IpcError::Codec(format!("invalid compressed frame: {}", e)))?;
    if json.len() > max {
        return Err(too_large(json.len(), max));
    }
    Ok(json)
}

fn compress(json: &[u8]) -> Result<Vec<u8>, IpcError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json)?;
    Ok(encoder.finish()?)
}

/// 帧写入端。
pub struct FrameWriter {
    inner: BoxedWriter,
    compression: bool,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: writer,
            compression: false,
        }
    }

    /// 之后发送的帧是否 gzip 压缩。
    pub fn set_compression(&mut self, compression: bool) {
        self.compression = compression;
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), IpcError> {
        let json = serde_json::to_vec(frame)?;
        if self.compression {
            let record = compress(&json)?;
            let len = u32::try_from(record.len())
                .map_err(|_| too_large(record.len(), u32::MAX as usize))?;
            self.inner.write_all(&[COMPRESSED_MARKER]).await?;
            self.inner.write_all(&len.to_be_bytes()).await?;
            self.inner.write_all(&record).await?;
        } else {
            let mut line = json;
            line.push(b'\n');
            self.inner.write_all(&line).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// 关闭写方向，通知对端流结束。
    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
