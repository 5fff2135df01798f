//! Shared wire protocol: message types and length-prefixed framing.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by a
//! UTF-8 JSON payload of exactly that length.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! A zero length is never valid, and a length above the configured maximum is
//! rejected before anything is allocated for the body.

use crate::config::ProtocolConfig;
use crate::error::{BridgeError, ErrorKind, HandlerError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client-to-server request naming an operation on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub operation: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub request_id: String,
}

impl CommandMessage {
    pub fn new(
        operation: impl Into<String>,
        arguments: Map<String, Value>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            arguments,
            request_id: request_id.into(),
        }
    }
}

/// Outcome marker of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// Server-to-client reply correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

impl ResponseMessage {
    /// Create a success response.
    pub fn ok(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(
        request_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(ErrorBody::new(kind, message)),
        }
    }

    pub fn from_handler_error(request_id: impl Into<String>, err: HandlerError) -> Self {
        Self::error(request_id, err.kind, err.message)
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Turn the response into the call's result, rebuilding remote failures.
    pub fn into_result(self, operation: &str) -> Result<Value> {
        match self.status {
            ResponseStatus::Ok => Ok(self.result.unwrap_or(Value::Null)),
            ResponseStatus::Error => {
                let body = self.error.unwrap_or_else(|| {
                    ErrorBody::new(
                        ErrorKind::HandlerExecutionError,
                        "error response without an error object",
                    )
                });
                Err(BridgeError::from_remote(operation, &body.kind, body.message))
            }
        }
    }
}

/// Serialize a message into a complete frame (prefix + payload).
pub fn encode<T: Serialize>(message: &T, max_len: usize) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    encode_frame(&payload, max_len)
}

/// Prefix a raw payload with its length.
pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Vec<u8>> {
    check_length(payload.len(), max_len)?;
    let mut frame = Vec::with_capacity(ProtocolConfig::HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a frame payload into a message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| BridgeError::malformed("payload is not valid UTF-8"))?;
    Ok(serde_json::from_str(text)?)
}

/// Read one length-prefixed frame from an async reader.
///
/// Returns `None` when the peer closes cleanly on a frame boundary. A close
/// anywhere inside a frame is a [`BridgeError::MalformedFrame`].
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; ProtocolConfig::HEADER_SIZE];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(|e| BridgeError::lost(format!("read failed: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(BridgeError::malformed(format!(
                "stream closed inside frame header ({} of {} bytes)",
                filled,
                header.len()
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    check_length(len, max_len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BridgeError::malformed(format!("stream closed inside {}-byte frame body", len))
        } else {
            BridgeError::lost(format!("read failed: {}", e))
        }
    })?;

    Ok(Some(payload))
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload, max_len)?;
    write_encoded(writer, &frame).await
}

/// Write an already-encoded frame in full and flush it.
pub async fn write_encoded<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| BridgeError::lost(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::lost(format!("flush failed: {}", e)))?;
    Ok(())
}

fn check_length(len: usize, max_len: usize) -> Result<()> {
    if len == 0 {
        return Err(BridgeError::malformed("zero-length frame"));
    }
    if len > max_len || len > u32::MAX as usize {
        return Err(BridgeError::malformed(format!(
            "frame size {} exceeds maximum {}",
            len, max_len
        )));
    }
    Ok(())
}
