//! Request job types.
//!
//! A job is created by the client listener when a new client connection
//! completes its request line, lives in the queue until the worker dequeues
//! it, and is destroyed once the client listener has flushed the response (or
//! torn down the tunnel). Job ids are process-unique and monotonically
//! increasing; they never wrap in practice (a u64 at one job per RTT of a
//! satellite link does not exhaust within the process's lifetime).

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use tokio::sync::{mpsc, oneshot};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_job_id() -> u64 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// An event the worker pushes to the client listener as an HTTP response
/// streams in without ever buffering the whole response.
#[derive(Debug)]
pub enum ResponseEvent {
    /// A slice of response bytes (status line + headers on the first chunk,
    /// body bytes thereafter, exactly as staged by the offshore dispatcher).
    Chunk(Bytes),
    /// The response is complete.
    End,
    /// The offshore dispatcher (or the link itself) failed; `reason` becomes
    /// the body of a synthesized `502 Bad Gateway`.
    Error(String),
}

/// A plain HTTP proxy job.
pub struct HttpJob {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_tx: mpsc::Sender<ResponseEvent>,
}

/// Outcome of attempting to open a CONNECT tunnel, reported back to the
/// client listener so it can write the correct status line.
pub enum ConnectOutcome {
    Ok,
    Fail(String),
}

/// A `CONNECT` tunnel job. `client_to_worker_rx`/`worker_to_client_tx` are the
/// two directions of the tunnel pump, handed off to the worker
/// once the client listener has completed the HTTP upgrade.
pub struct ConnectJob {
    pub host_port: String,
    pub outcome_tx: oneshot::Sender<ConnectOutcome>,
    pub client_to_worker_rx: mpsc::Receiver<Bytes>,
    pub worker_to_client_tx: mpsc::Sender<Bytes>,
}

pub enum JobKind {
    Http(HttpJob),
    Connect(ConnectJob),
}

pub struct Job {
    pub id: u64,
    pub kind: JobKind,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Job {
            id: next_job_id(),
            kind,
        }
    }
}
