//! Frame codec.
//!
//! Wire shape: `[1 byte kind][8 bytes job id, BE][4 bytes length, BE][length bytes payload]`.
//! Payload is capped at `MAX_PAYLOAD` bytes; larger bodies are split across
//! multiple frames by the caller. Both `read_frame` and `write_frame` treat
//! any I/O error, EOF mid-frame, or an over-cap length as `LinkError::LinkLost`
//! / `ProtocolViolation` respectively — the socket is unusable afterwards and
//! the caller (the link manager) must reconnect.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LinkError, Result};

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

const HEADER_LEN: usize = 1 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// ship -> offshore: full serialized HTTP/1.1 request.
    HttpReq,
    /// offshore -> ship: a slice of the upstream response, streamed.
    HttpRespChunk,
    /// offshore -> ship: end of response for this job id.
    HttpRespEnd,
    /// ship -> offshore: payload is `host:port`.
    ConnectOpen,
    /// offshore -> ship: tunnel open.
    ConnectOk,
    /// offshore -> ship: payload is a short reason string, tunnel rejected.
    ConnectFail,
    /// both directions: opaque tunnel bytes for the active job id.
    Data,
    /// both directions: clean end of one tunnel direction. Payload is one byte:
    /// 0 = remote->local, 1 = local->remote.
    Close,
    /// offshore -> ship: payload is a UTF-8 reason; ship surfaces a 502.
    Error,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::HttpReq => 0,
            FrameKind::HttpRespChunk => 1,
            FrameKind::HttpRespEnd => 2,
            FrameKind::ConnectOpen => 3,
            FrameKind::ConnectOk => 4,
            FrameKind::ConnectFail => 5,
            FrameKind::Data => 6,
            FrameKind::Close => 7,
            FrameKind::Error => 8,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => FrameKind::HttpReq,
            1 => FrameKind::HttpRespChunk,
            2 => FrameKind::HttpRespEnd,
            3 => FrameKind::ConnectOpen,
            4 => FrameKind::ConnectOk,
            5 => FrameKind::ConnectFail,
            6 => FrameKind::Data,
            7 => FrameKind::Close,
            8 => FrameKind::Error,
            other => {
                return Err(LinkError::ProtocolViolation(format!(
                    "unknown frame kind byte {other}"
                )))
            }
        })
    }
}

/// Direction byte carried by a `Close` frame's single-byte payload.
pub const CLOSE_REMOTE_TO_LOCAL: u8 = 0;
pub const CLOSE_LOCAL_TO_REMOTE: u8 = 1;

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub job_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, job_id: u64, payload: impl Into<Bytes>) -> Self {
        Frame {
            kind,
            job_id,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: FrameKind, job_id: u64) -> Self {
        Frame::new(kind, job_id, Bytes::new())
    }
}

/// Write one whole frame. Fails with `LinkLost` on any I/O error.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(LinkError::ProtocolViolation(format!(
            "payload of {} bytes exceeds {} byte cap",
            frame.payload.len(),
            MAX_PAYLOAD
        )));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0] = frame.kind.to_byte();
    header[1..9].copy_from_slice(&frame.job_id.to_be_bytes());
    header[9..13].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());

    w.write_all(&header).await?;
    if !frame.payload.is_empty() {
        w.write_all(&frame.payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Read one whole frame. Fails with `LinkLost` on any I/O error or EOF
/// mid-frame, and `ProtocolViolation` on an unknown kind byte or an
/// over-cap length.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            LinkError::LinkLost("eof while reading frame header".to_string())
        } else {
            LinkError::from(e)
        }
    })?;

    let kind = FrameKind::from_byte(header[0])?;
    let job_id = u64::from_be_bytes(header[1..9].try_into().unwrap());
    let len = u32::from_be_bytes(header[9..13].try_into().unwrap()) as usize;

    if len > MAX_PAYLOAD {
        return Err(LinkError::ProtocolViolation(format!(
            "frame length {len} exceeds {MAX_PAYLOAD} byte cap"
        )));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                LinkError::LinkLost("eof mid-frame payload".to_string())
            } else {
                LinkError::from(e)
            }
        })?;
    }

    Ok(Frame {
        kind,
        job_id,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        let frame = Frame::new(FrameKind::HttpReq, 42, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"));
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back.kind, FrameKind::HttpReq);
        assert_eq!(read_back.job_id, 42);
        assert_eq!(&read_back.payload[..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn rejects_oversized_payload_on_write() {
        let mut buf = Vec::new();
        let oversized = vec![0u8; MAX_PAYLOAD + 1];
        let frame = Frame::new(FrameKind::Data, 1, oversized);
        let err = write_frame(&mut buf, &frame).await.unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_length_on_read() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = FrameKind::Data.to_byte();
        header[9..13].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        let mut cursor = Cursor::new(header.to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_link_lost() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = FrameKind::Data.to_byte();
        header[9..13].copy_from_slice(&10u32.to_be_bytes());
        // Declare 10 payload bytes but supply none.
        let mut cursor = Cursor::new(header.to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, LinkError::LinkLost(_)));
    }

    #[tokio::test]
    async fn unknown_kind_byte_is_protocol_violation() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 0xAA;
        let mut cursor = Cursor::new(header.to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation(_)));
    }
}
