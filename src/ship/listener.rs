//! Ship-side client listener / proxy parser.
//!
//! Accepts local client connections, parses one proxy request per
//! connection (absolute-form HTTP or `CONNECT`), enqueues a job, and streams
//! bytes between the client socket and the worker until the job completes.
//! Built directly on `hyper::server::conn::http1` and
//! `hyper::service::service_fn`, the same shape `cmux-proxy::spawn_proxy`
//! uses — the difference is that the service here enqueues a job and streams
//! the worker's frames back instead of issuing a second outbound HTTP
//! request itself.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame as BodyFrame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::http1;
use crate::ship::job::{ConnectJob, ConnectOutcome, HttpJob, Job, JobKind, ResponseEvent};
use crate::ship::ShipCore;

type RespBody = BoxBody<Bytes, std::io::Error>;

fn boxed<B>(body: B) -> RespBody
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    body.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        .boxed()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(boxed(Full::new(body.into())))
        .unwrap()
}

/// Bind and serve the client proxy port until `shutdown` resolves.
pub async fn spawn(
    core: ShipCore,
    listen: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let bound = listener.local_addr()?;
    info!(%bound, "ship listening for local proxy clients");

    let notify = std::sync::Arc::new(Notify::new());
    let notify_clone = notify.clone();
    tokio::spawn(async move {
        shutdown.await;
        notify_clone.notify_waiters();
    });

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    info!("ship listener shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let core = core.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    handle_request(core.clone(), remote_addr, req)
                                });
                                let conn = hyper::server::conn::http1::Builder::new()
                                    .serve_connection(io, service)
                                    .with_upgrades();
                                if let Err(err) = conn.await {
                                    warn!(%err, "client connection error");
                                }
                            });
                        }
                        Err(err) => error!(%err, "accept error"),
                    }
                }
            }
        }
    });

    Ok((bound, handle))
}

async fn handle_request(
    core: ShipCore,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<RespBody>, Infallible> {
    if req.method() == Method::CONNECT {
        Ok(handle_connect(core, remote_addr, req).await)
    } else {
        Ok(handle_http(core, remote_addr, req).await)
    }
}

async fn handle_http(core: ShipCore, remote_addr: SocketAddr, req: Request<Incoming>) -> Response<RespBody> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return text_response(StatusCode::BAD_REQUEST, format!("failed to read body: {e}"));
        }
    };

    if parts.uri.authority().is_none() && !parts.headers.contains_key(http::header::HOST) {
        return text_response(
            StatusCode::BAD_REQUEST,
            "absolute-form URI or Host header required",
        );
    }

    let (response_tx, response_rx) = mpsc::channel::<ResponseEvent>(32);
    let job = Job::new(JobKind::Http(HttpJob {
        method: parts.method,
        uri: parts.uri,
        version: parts.version,
        headers: parts.headers,
        body,
        response_tx,
    }));
    let job_id = job.id;

    info!(client = %remote_addr, job_id, "enqueued http job");

    if core.enqueue(job).is_err() {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    stream_http_response(response_rx).await
}

/// Turn the worker's `ResponseEvent` stream into a `Response<RespBody>`.
///
/// Each `ResponseEvent::Chunk` is a slice of the origin's raw response bytes
/// as the offshore dispatcher read them off the wire — status line and
/// headers are not guaranteed to land in the first chunk alone, so we
/// accumulate until `http1::parse_response_head` finds a complete head,
/// strip hop-by-hop headers the same way the request path does, and only
/// then build the client-facing `Response`. Any bytes read past the head in
/// the same accumulation pass are the start of the body and are forwarded
/// immediately; subsequent chunks stream through untouched without ever
/// buffering the whole response.
async fn stream_http_response(mut response_rx: mpsc::Receiver<ResponseEvent>) -> Response<RespBody> {
    let mut buf = BytesMut::new();
    let head = loop {
        match response_rx.recv().await {
            Some(ResponseEvent::Chunk(bytes)) => {
                buf.extend_from_slice(&bytes);
                match http1::parse_response_head(&buf) {
                    Ok(Some((head, consumed))) => {
                        let leftover = buf.split_off(consumed);
                        break (head, leftover);
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        return text_response(StatusCode::BAD_GATEWAY, format!("malformed upstream response: {e}"));
                    }
                }
            }
            Some(ResponseEvent::End) | None => {
                return text_response(StatusCode::BAD_GATEWAY, "empty upstream response");
            }
            Some(ResponseEvent::Error(reason)) => {
                return text_response(StatusCode::BAD_GATEWAY, reason);
            }
        }
    };
    let (mut head, leftover) = head;
    http1::strip_hop_by_hop_headers(&mut head.headers);

    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let (body_tx, body_rx) = mpsc::channel::<std::io::Result<BodyFrame<Bytes>>>(32);
    if !leftover.is_empty() {
        let _ = body_tx.send(Ok(BodyFrame::data(leftover.freeze()))).await;
    }

    tokio::spawn(async move {
        loop {
            match response_rx.recv().await {
                Some(ResponseEvent::Chunk(bytes)) => {
                    if body_tx.send(Ok(BodyFrame::data(bytes))).await.is_err() {
                        return;
                    }
                }
                Some(ResponseEvent::End) | None => return,
                Some(ResponseEvent::Error(reason)) => {
                    let _ = body_tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, reason)))
                        .await;
                    return;
                }
            }
        }
    });

    let stream = ReceiverStream::new(body_rx);
    let body = boxed(StreamBody::new(stream));
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in head.headers.iter() {
            headers.append(name, value.clone());
        }
    }
    builder
        .body(body)
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

async fn handle_connect(core: ShipCore, remote_addr: SocketAddr, mut req: Request<Incoming>) -> Response<RespBody> {
    let host_port = match req.uri().authority() {
        Some(a) => a.to_string(),
        None => {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        }
    };

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (client_to_worker_tx, client_to_worker_rx) = mpsc::channel::<Bytes>(32);
    let (worker_to_client_tx, mut worker_to_client_rx) = mpsc::channel::<Bytes>(32);

    let job = Job::new(JobKind::Connect(ConnectJob {
        host_port: host_port.clone(),
        outcome_tx,
        client_to_worker_rx,
        worker_to_client_tx,
    }));
    let job_id = job.id;

    info!(client = %remote_addr, %host_port, job_id, "enqueued connect job");

    if core.enqueue(job).is_err() {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    let outcome = match outcome_rx.await {
        Ok(outcome) => outcome,
        Err(_) => ConnectOutcome::Fail("worker dropped the job".to_string()),
    };

    match outcome {
        ConnectOutcome::Fail(reason) => text_response(StatusCode::BAD_GATEWAY, reason),
        ConnectOutcome::Ok => {
            tokio::spawn(async move {
                match hyper::upgrade::on(&mut req).await {
                    Ok(upgraded) => {
                        let io = TokioIo::new(upgraded);
                        pump_client_socket(io, client_to_worker_tx, &mut worker_to_client_rx).await;
                    }
                    Err(e) => warn!(job_id, error = %e, "CONNECT upgrade failed"),
                }
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONNECTION, HeaderValue::from_static("upgrade"))
                .body(boxed(Empty::new()))
                .unwrap()
        }
    }
}

async fn pump_client_socket<S>(
    client: S,
    to_worker: mpsc::Sender<Bytes>,
    from_worker: &mut mpsc::Receiver<Bytes>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut read_half, mut write_half) = tokio::io::split(client);
    let uplink = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if to_worker.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(chunk) = from_worker.recv().await {
        if write_half.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    let _ = uplink.await;
}
