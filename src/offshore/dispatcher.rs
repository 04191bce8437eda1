//! Per-request upstream transport.
//!
//! Parses one `HTTP_REQ` frame's head, reads the body (if any) from the
//! `DATA` frames the ship worker sends after it, dials the origin, and
//! streams the response back as `HTTP_RESP_CHUNK`/`HTTP_RESP_END` frames. For
//! `CONNECT_OPEN`, dials the origin and, on success, hands off to a tunnel
//! pump symmetric to `crate::ship::tunnel`.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::{LinkError, Result};
use crate::frame::{self, Frame, FrameKind, CLOSE_REMOTE_TO_LOCAL};
use crate::http1;

/// Dial timeout, both for HTTP origin dials and CONNECT tunnels.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout for an upstream read or write.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bytes are read from origin and forwarded in chunks no larger
/// than this (well under the 1 MiB frame cap).
const RESP_CHUNK: usize = 64 * 1024;

/// Serve every frame on one accepted link connection, sequentially, until
/// the peer disconnects or a protocol violation forces the connection shut.
pub async fn serve_link(stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut link_read, mut link_write) = stream.into_split();

    loop {
        let frame = match frame::read_frame(&mut link_read).await {
            Ok(f) => f,
            Err(LinkError::LinkLost(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match frame.kind {
            FrameKind::HttpReq => {
                if let Err(e) =
                    handle_http_req(&mut link_read, &mut link_write, frame.job_id, frame.payload).await
                {
                    warn!(job_id = frame.job_id, error = %e, "http job ended the link");
                    return Err(e);
                }
            }
            FrameKind::ConnectOpen => {
                link_write = handle_connect(&mut link_read, link_write, frame.job_id, frame.payload).await?;
            }
            other => {
                return Err(LinkError::ProtocolViolation(format!(
                    "frame kind {other:?} is not valid as the start of a job"
                )));
            }
        }
    }
}

async fn send_error(link_write: &mut OwnedWriteHalf, job_id: u64, reason: String) -> Result<()> {
    warn!(job_id, %reason, "upstream failure");
    frame::write_frame(
        link_write,
        &Frame::new(FrameKind::Error, job_id, Bytes::from(reason.into_bytes())),
    )
    .await
}

async fn handle_http_req(
    link_read: &mut OwnedReadHalf,
    link_write: &mut OwnedWriteHalf,
    job_id: u64,
    head_payload: Bytes,
) -> Result<()> {
    let parsed = match http1::parse_request_head(&head_payload) {
        Ok(p) => p,
        Err(e) => return send_error(link_write, job_id, e.to_string()).await,
    };

    let mut body = Vec::with_capacity(parsed.content_length);
    while body.len() < parsed.content_length {
        let frame = frame::read_frame(link_read).await?;
        if frame.job_id != job_id {
            return Err(LinkError::ProtocolViolation(format!(
                "frame for job {} arrived while job {} was reading its body",
                frame.job_id, job_id
            )));
        }
        match frame.kind {
            FrameKind::Data => body.extend_from_slice(&frame.payload),
            other => {
                return Err(LinkError::ProtocolViolation(format!(
                    "unexpected frame kind {other:?} while reading request body"
                )));
            }
        }
    }

    let host_header = parsed
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let (host, port) = http1::split_host_port(host_header, 80);

    let mut origin = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port))).await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return send_error(link_write, job_id, format!("upstream dial failed: {e}")).await,
        Err(_) => return send_error(link_write, job_id, "upstream dial timed out".to_string()).await,
    };
    let _ = origin.set_nodelay(true);

    let write_result = tokio::time::timeout(IDLE_TIMEOUT, async {
        origin.write_all(&head_payload).await?;
        origin.write_all(&body).await?;
        origin.flush().await
    })
    .await;
    match write_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return send_error(link_write, job_id, format!("upstream write failed: {e}")).await,
        Err(_) => return send_error(link_write, job_id, "upstream write timed out".to_string()).await,
    }

    // Accumulate until the response head (status line + headers) is fully
    // in hand, so `Transfer-Encoding` can be inspected before any body bytes
    // are forwarded — a chunk-framed origin body must be dechunked here, not
    // passed through raw, or the client sees chunk-size lines as data.
    let mut buf = Vec::new();
    let (resp_head, head_len) = loop {
        match http1::parse_response_head(&buf) {
            Ok(Some((head, consumed))) => break (head, consumed),
            Ok(None) => {}
            Err(e) => return send_error(link_write, job_id, format!("malformed upstream response: {e}")).await,
        }
        match read_more(&mut origin, &mut buf).await {
            Ok(()) => {}
            Err(e) => return send_error(link_write, job_id, e.to_string()).await,
        }
    };

    send_body_bytes(link_write, job_id, &buf[..head_len]).await?;
    let leftover = buf[head_len..].to_vec();

    let is_chunked = resp_head
        .headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length = resp_head
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let body_result = if is_chunked {
        stream_dechunked_body(&mut origin, leftover, link_write, job_id).await
    } else if let Some(length) = content_length {
        stream_fixed_length_body(&mut origin, leftover, length, link_write, job_id).await
    } else {
        stream_until_eof_body(&mut origin, leftover, link_write, job_id).await
    };
    if let Err(e) = body_result {
        return send_error(link_write, job_id, e.to_string()).await;
    }

    frame::write_frame(link_write, &Frame::empty(FrameKind::HttpRespEnd, job_id)).await
}

/// Write `data` to the link as however many `HTTP_RESP_CHUNK` frames it takes
/// to stay under the per-frame payload cap.
async fn send_body_bytes(link_write: &mut OwnedWriteHalf, job_id: u64, data: &[u8]) -> Result<()> {
    for piece in data.chunks(RESP_CHUNK) {
        let frame = Frame::new(FrameKind::HttpRespChunk, job_id, Bytes::copy_from_slice(piece));
        frame::write_frame(link_write, &frame).await?;
    }
    Ok(())
}

/// Read more bytes from `origin` into `buf`, subject to the idle timeout.
async fn read_more(origin: &mut TcpStream, buf: &mut Vec<u8>) -> Result<()> {
    let mut tmp = vec![0u8; RESP_CHUNK];
    match tokio::time::timeout(IDLE_TIMEOUT, origin.read(&mut tmp)).await {
        Ok(Ok(0)) => Err(LinkError::UpstreamIoFailure("upstream closed mid-response".to_string())),
        Ok(Ok(n)) => {
            buf.extend_from_slice(&tmp[..n]);
            Ok(())
        }
        Ok(Err(e)) => Err(LinkError::UpstreamIoFailure(e.to_string())),
        Err(_) => Err(LinkError::UpstreamIoFailure("upstream read timed out".to_string())),
    }
}

/// Body framing for a response that declared `Content-Length`: read until
/// `buf` holds exactly that many bytes, then forward them.
async fn stream_fixed_length_body(
    origin: &mut TcpStream,
    mut buf: Vec<u8>,
    length: usize,
    link_write: &mut OwnedWriteHalf,
    job_id: u64,
) -> Result<()> {
    while buf.len() < length {
        read_more(origin, &mut buf).await?;
    }
    send_body_bytes(link_write, job_id, &buf[..length]).await
}

/// Body framing for a response with no declared length (HTTP/1.0 or a
/// close-delimited body): forward bytes as they arrive until EOF.
async fn stream_until_eof_body(
    origin: &mut TcpStream,
    buf: Vec<u8>,
    link_write: &mut OwnedWriteHalf,
    job_id: u64,
) -> Result<()> {
    send_body_bytes(link_write, job_id, &buf).await?;
    let mut tmp = vec![0u8; RESP_CHUNK];
    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, origin.read(&mut tmp)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => send_body_bytes(link_write, job_id, &tmp[..n]).await?,
            Ok(Err(e)) => return Err(LinkError::UpstreamIoFailure(e.to_string())),
            Err(_) => return Err(LinkError::UpstreamIoFailure("upstream read timed out".to_string())),
        }
    }
}

/// Decode a `Transfer-Encoding: chunked` body and forward the decoded bytes.
/// The chunk framing (size lines, trailing CRLFs, optional trailer headers)
/// is consumed here and never reaches the client — only the origin's actual
/// body bytes are framed as `HTTP_RESP_CHUNK`.
async fn stream_dechunked_body(
    origin: &mut TcpStream,
    mut buf: Vec<u8>,
    link_write: &mut OwnedWriteHalf,
    job_id: u64,
) -> Result<()> {
    loop {
        let size_line_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n") {
                break pos;
            }
            read_more(origin, &mut buf).await?;
        };
        let size_str = std::str::from_utf8(&buf[..size_line_end])
            .map_err(|_| LinkError::ProtocolViolation("invalid chunk size line".to_string()))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| LinkError::ProtocolViolation(format!("invalid chunk size {size_str}")))?;
        buf.drain(..size_line_end + 2);

        if size == 0 {
            // What remains is the trailer section: zero or more
            // `header CRLF` lines, terminated by a lone blank line.
            loop {
                let line_end = loop {
                    if let Some(pos) = find_subslice(&buf, b"\r\n") {
                        break pos;
                    }
                    read_more(origin, &mut buf).await?;
                };
                buf.drain(..line_end + 2);
                if line_end == 0 {
                    return Ok(());
                }
            }
        }

        while buf.len() < size + 2 {
            read_more(origin, &mut buf).await?;
        }
        send_body_bytes(link_write, job_id, &buf[..size]).await?;
        buf.drain(..size + 2);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn handle_connect(
    link_read: &mut OwnedReadHalf,
    mut link_write: OwnedWriteHalf,
    job_id: u64,
    payload: Bytes,
) -> Result<OwnedWriteHalf> {
    let host_port = String::from_utf8_lossy(&payload).to_string();
    let (host, port) = http1::split_host_port(&host_port, 443);

    let origin = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let reason = format!("upstream dial failed: {e}");
            warn!(job_id, %reason, "connect tunnel rejected");
            frame::write_frame(
                &mut link_write,
                &Frame::new(FrameKind::ConnectFail, job_id, Bytes::from(reason.into_bytes())),
            )
            .await?;
            return Ok(link_write);
        }
        Err(_) => {
            let reason = "upstream dial timed out".to_string();
            warn!(job_id, %reason, "connect tunnel rejected");
            frame::write_frame(
                &mut link_write,
                &Frame::new(FrameKind::ConnectFail, job_id, Bytes::from(reason.into_bytes())),
            )
            .await?;
            return Ok(link_write);
        }
    };
    let _ = origin.set_nodelay(true);

    frame::write_frame(&mut link_write, &Frame::empty(FrameKind::ConnectOk, job_id)).await?;
    run_tunnel(link_read, link_write, job_id, origin).await
}

/// Offshore-side tunnel pump, symmetric to `crate::ship::tunnel::run`: the
/// origin-read direction is a spawned task that owns the link's write half
/// and hands it back once the origin socket hits EOF; this function's own
/// loop owns the link's read half and stops on the first `CLOSE` frame.
async fn run_tunnel(
    link_read: &mut OwnedReadHalf,
    link_write: OwnedWriteHalf,
    job_id: u64,
    origin: TcpStream,
) -> Result<OwnedWriteHalf> {
    let (mut origin_read, mut origin_write) = origin.into_split();

    let downlink = tokio::spawn(async move {
        let mut link_write = link_write;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match origin_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Frame::new(FrameKind::Data, job_id, Bytes::copy_from_slice(&buf[..n]));
                    if frame::write_frame(&mut link_write, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        let close = Frame::new(FrameKind::Close, job_id, Bytes::from_static(&[CLOSE_REMOTE_TO_LOCAL]));
        let _ = frame::write_frame(&mut link_write, &close).await;
        link_write
    });

    loop {
        let frame = frame::read_frame(link_read).await?;
        if frame.job_id != job_id {
            return Err(LinkError::ProtocolViolation(format!(
                "frame for job {} arrived while tunnel {} was active",
                frame.job_id, job_id
            )));
        }
        match frame.kind {
            FrameKind::Data => {
                let _ = origin_write.write_all(&frame.payload).await;
            }
            FrameKind::Close => break,
            other => {
                return Err(LinkError::ProtocolViolation(format!(
                    "unexpected frame kind {other:?} during tunnel"
                )));
            }
        }
    }

    let _ = origin_write.shutdown().await;
    downlink
        .await
        .map_err(|e| LinkError::ProtocolViolation(format!("tunnel downlink task panicked: {e}")))
}
