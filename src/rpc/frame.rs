//! Wire format of the RPC channel.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. The JSON object carries its kind in a `type` field:
//!
//! ```text
//! 00 00 00 4a {"type":"REQUEST_STREAM","stream_id":1,"route":"greetings","data":{"name":"Jane"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::Credentials;

/// Stream id used for frames about the connection as a whole.
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Why a request or connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or invalid credentials
    Rejected,
    /// No handler for the requested route
    InvalidRoute,
    /// Request data could not be understood
    InvalidData,
    /// The handler failed
    ApplicationError,
    /// The peer broke the protocol (bad frame, reused stream id, ...)
    Protocol,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::InvalidRoute => "INVALID_ROUTE",
            ErrorCode::InvalidData => "INVALID_DATA",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
            ErrorCode::Protocol => "PROTOCOL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the RPC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// First frame from the requester, optionally carrying credentials for
    /// the whole connection.
    Setup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Credentials>,
    },
    /// Ask for an unbounded stream of `Next` frames.
    RequestStream {
        stream_id: u32,
        route: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Credentials>,
        #[serde(default)]
        data: Value,
    },
    /// Ask for a single `Next` followed by `Complete`.
    RequestResponse {
        stream_id: u32,
        route: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Credentials>,
        #[serde(default)]
        data: Value,
    },
    Next {
        stream_id: u32,
        data: Value,
    },
    Complete {
        stream_id: u32,
    },
    Error {
        stream_id: u32,
        code: ErrorCode,
        message: String,
    },
    /// Requester no longer wants the stream.
    Cancel {
        stream_id: u32,
    },
}

impl Frame {
    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            stream_id,
            code,
            message: message.into(),
        }
    }

    /// The stream this frame belongs to; `None` for `Setup`.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::Setup { .. } => None,
            Frame::RequestStream { stream_id, .. }
            | Frame::RequestResponse { stream_id, .. }
            | Frame::Next { stream_id, .. }
            | Frame::Complete { stream_id }
            | Frame::Error { stream_id, .. }
            | Frame::Cancel { stream_id } => Some(*stream_id),
        }
    }

    /// Whether no further frames follow on this stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Complete { .. } | Frame::Error { .. })
    }
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
/// Frames larger than `max_frame_bytes` are a protocol error.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> AppResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(AppError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_frame_bytes}"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| AppError::Protocol(format!("undecodable frame: {e}")))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let data = serde_json::to_vec(frame)?;
    let len = u32::try_from(data.len())
        .map_err(|_| AppError::Protocol(format!("frame of {} bytes too large", data.len())))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;

    Ok(())
}

/// Drain `outbound` onto `writer` until the channel closes or `closed` fires.
///
/// Frames already queued when `closed` fires are still written. A write
/// failure cancels `closed`, which tells the rest of the connection to wind
/// down.
pub(crate) async fn pump_frames<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;

            _ = closed.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(error = %e, "Failed to write RPC frame, closing connection");
            closed.cancel();
            break;
        }
    }

    // Best effort: let the peer see a clean close
    let _ = writer.shutdown().await;
    debug!("RPC writer stopped");
}
