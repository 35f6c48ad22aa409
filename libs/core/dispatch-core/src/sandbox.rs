//! Sandbox record protocol and the reusable-container handle abstraction
//! that `ContainerPool` (C2) and `WorkerPool` (C5) build on.
//!
//! A sandbox accepts one JSON context per execution on stdin (newline
//! terminated) and emits newline-delimited JSON records on stdout. Two
//! stdout transports are supported transparently: raw newline-delimited
//! lines, and an 8-byte framing header (byte 0 in {1, 2} selects
//! stdout/stderr, bytes 4..7 are a big-endian record length). The reader
//! auto-detects which transport is in use on its first read and locks into
//! that mode for the sandbox's lifetime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{DispatchError, DispatchResult};

/// The marker a liveness probe response must carry.
pub const ALIVE_MARKER: &str = "check_alive_output";

/// Coarse classification used by the worker pool to decide how to
/// accumulate a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// type 1
    Success,
    /// type 2
    Failure,
    /// type 3
    Pending,
    /// type -1
    Unknown,
}

impl RecordKind {
    pub fn code(&self) -> i32 {
        match self {
            RecordKind::Success => 1,
            RecordKind::Failure => 2,
            RecordKind::Pending => 3,
            RecordKind::Unknown => -1,
        }
    }
}

/// A single record read from a sandbox's stdout stream.
#[derive(Debug, Clone)]
pub enum SandboxRecord {
    /// Accumulate as success. `fetched_data`, if present, is concatenated
    /// across successive `Result` records for the same job.
    Result {
        payload: Value,
        fetched_data: Option<Vec<Value>>,
    },
    Log {
        message: String,
    },
    Pending,
    /// Treated as success but the message is retained for diagnostics.
    IgnoredException {
        message: String,
    },
    /// `error` or `exception`: failure, but the sandbox keeps draining
    /// until `completed`.
    Failure {
        message: String,
    },
    Completed,
    /// Liveness probe response.
    AliveAck,
    Unknown {
        raw_type: String,
        payload: Value,
    },
}

impl SandboxRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            SandboxRecord::Result { .. } | SandboxRecord::IgnoredException { .. } => RecordKind::Success,
            SandboxRecord::Failure { .. } => RecordKind::Failure,
            SandboxRecord::Pending => RecordKind::Pending,
            SandboxRecord::Log { .. } | SandboxRecord::Completed | SandboxRecord::AliveAck => {
                RecordKind::Pending
            }
            SandboxRecord::Unknown { .. } => RecordKind::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxRecord::Completed)
    }

    fn from_raw(raw: RawRecord) -> Self {
        match raw.record_type.as_str() {
            "result" => {
                let fetched_data = raw
                    .payload
                    .get("fetched_data")
                    .and_then(|v| v.as_array())
                    .map(|items| items.clone());
                SandboxRecord::Result {
                    payload: raw.payload,
                    fetched_data,
                }
            }
            "log" => SandboxRecord::Log {
                message: message_of(&raw.payload),
            },
            "pending" => SandboxRecord::Pending,
            "ignored_exception" => SandboxRecord::IgnoredException {
                message: message_of(&raw.payload),
            },
            "error" | "exception" => SandboxRecord::Failure {
                message: message_of(&raw.payload),
            },
            "completed" => SandboxRecord::Completed,
            ALIVE_MARKER => SandboxRecord::AliveAck,
            other => SandboxRecord::Unknown {
                raw_type: other.to_string(),
                payload: raw.payload,
            },
        }
    }
}

fn message_of(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Deserialize, Serialize)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(flatten)]
    payload: Value,
}

/// Which wire transport a sandbox's stdout is using. Detected once, per
/// sandbox, on the first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameMode {
    Raw,
    Framed,
}

/// Reader over a sandbox's stdout that transparently handles both
/// transports. Buffered leftover bytes are owned by the reader and never
/// shared across sandboxes.
pub struct FramedReader<R> {
    inner: BufReader<R>,
    mode: Option<FrameMode>,
    /// The first byte consumed while detecting the transport, re-injected
    /// into the next read so no data is lost.
    pushback: Option<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            mode: None,
            pushback: None,
        }
    }

    /// Read one record, blocking until a full record is available or EOF.
    pub async fn read_record(&mut self) -> DispatchResult<Option<SandboxRecord>> {
        let mode = match self.mode {
            Some(m) => m,
            None => self.detect_mode().await?,
        };

        let line = match mode {
            FrameMode::Raw => self.read_raw_line().await?,
            FrameMode::Framed => self.read_framed_line().await?,
        };

        let Some(line) = line else {
            return Ok(None);
        };

        let raw: RawRecord = serde_json::from_str(line.trim())
            .map_err(|e| DispatchError::Decode(format!("malformed sandbox record: {e}")))?;
        Ok(Some(SandboxRecord::from_raw(raw)))
    }

    async fn detect_mode(&mut self) -> DispatchResult<FrameMode> {
        let mut first_byte = [0u8; 1];
        let n = self
            .inner
            .read(&mut first_byte)
            .await
            .map_err(|e| DispatchError::SandboxProtocol(e.to_string()))?;
        if n == 0 {
            // Empty stream: mode doesn't matter, default to raw.
            self.mode = Some(FrameMode::Raw);
            return Ok(FrameMode::Raw);
        }

        let mode = if first_byte[0] == 1 || first_byte[0] == 2 {
            FrameMode::Framed
        } else {
            FrameMode::Raw
        };
        self.mode = Some(mode);

        // Stash the byte we already consumed by prepending via an internal
        // one-byte pushback buffer.
        self.pushback = Some(first_byte[0]);
        Ok(mode)
    }

    async fn read_raw_line(&mut self) -> DispatchResult<Option<String>> {
        let mut line = String::new();
        if let Some(b) = self.pushback.take() {
            line.push(b as char);
        }
        let n = self
            .inner
            .read_line(&mut line)
            .await
            .map_err(|e| DispatchError::SandboxProtocol(e.to_string()))?;
        if n == 0 && line.is_empty() {
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn read_framed_line(&mut self) -> DispatchResult<Option<String>> {
        let mut header = [0u8; 8];
        let start = if let Some(b) = self.pushback.take() {
            header[0] = b;
            1
        } else {
            0
        };
        if start < 8 {
            let n = self
                .inner
                .read_exact(&mut header[start..])
                .await
                .map_err(|e| DispatchError::SandboxProtocol(e.to_string()));
            match n {
                Ok(_) => {}
                Err(_) => return Ok(None),
            }
        }

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| DispatchError::SandboxProtocol(e.to_string()))?;

        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| DispatchError::Decode(format!("non-utf8 framed record: {e}")))
    }
}

/// A live sandbox's I/O surface. Implemented by a real child process in
/// production and by an in-memory fake in tests.
#[async_trait]
pub trait SandboxIo: Send + Sync {
    async fn write_context(&mut self, context: &str) -> DispatchResult<()>;
    async fn read_record(&mut self, timeout: Duration) -> DispatchResult<Option<SandboxRecord>>;
    async fn kill(&mut self) -> DispatchResult<()>;
}

/// stdin/stdout pair driving the framed protocol over any async
/// read/write half, used by both the real process-backed sandbox and
/// tests.
pub struct PipeSandboxIo<W, R> {
    stdin: W,
    reader: FramedReader<R>,
}

impl<W: AsyncWrite + Unpin + Send, R: AsyncRead + Unpin + Send> PipeSandboxIo<W, R> {
    pub fn new(stdin: W, stdout: R) -> Self {
        Self {
            stdin,
            reader: FramedReader::new(stdout),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send, R: AsyncRead + Unpin + Send> SandboxIo for PipeSandboxIo<W, R> {
    async fn write_context(&mut self, context: &str) -> DispatchResult<()> {
        self.stdin
            .write_all(context.as_bytes())
            .await
            .map_err(|e| DispatchError::SandboxProtocol(e.to_string()))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| DispatchError::SandboxProtocol(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| DispatchError::SandboxProtocol(e.to_string()))?;
        Ok(())
    }

    async fn read_record(&mut self, timeout: Duration) -> DispatchResult<Option<SandboxRecord>> {
        match tokio::time::timeout(timeout, self.reader.read_record()).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::SandboxProtocol("read timed out".to_string())),
        }
    }

    async fn kill(&mut self) -> DispatchResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn raw_mode_reads_newline_delimited_records() {
        let data = b"{\"type\":\"result\",\"message\":\"ok\"}\n{\"type\":\"completed\"}\n".to_vec();
        let mut reader = FramedReader::new(Cursor::new(data));
        let first = reader.read_record().await.unwrap().unwrap();
        assert!(matches!(first, SandboxRecord::Result { .. }));
        let second = reader.read_record().await.unwrap().unwrap();
        assert!(second.is_terminal());
    }

    #[tokio::test]
    async fn framed_mode_is_detected_and_decoded() {
        let body = b"{\"type\":\"completed\"}".to_vec();
        let mut frame = vec![1u8, 0, 0, 0];
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let mut reader = FramedReader::new(Cursor::new(frame));
        let record = reader.read_record().await.unwrap().unwrap();
        assert!(record.is_terminal());
    }

    #[tokio::test]
    async fn unknown_type_is_preserved_as_unknown() {
        let data = b"{\"type\":\"weird_tag\",\"x\":1}\n".to_vec();
        let mut reader = FramedReader::new(Cursor::new(data));
        let record = reader.read_record().await.unwrap().unwrap();
        match record {
            SandboxRecord::Unknown { raw_type, .. } => assert_eq!(raw_type, "weird_tag"),
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(RecordKind::Unknown.code(), -1);
    }

    #[tokio::test]
    async fn result_records_carry_fetched_data() {
        let data =
            b"{\"type\":\"result\",\"fetched_data\":[{\"a\":1},{\"a\":2}]}\n".to_vec();
        let mut reader = FramedReader::new(Cursor::new(data));
        let record = reader.read_record().await.unwrap().unwrap();
        match record {
            SandboxRecord::Result { fetched_data, .. } => {
                assert_eq!(fetched_data.unwrap().len(), 2);
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }
}
