//! The ship-side worker.
//!
//! A single task: dequeue one job, wait for the link, drive it to
//! completion, and only then dequeue the next. This is the serialization
//! point every implementation — blocking threads or cooperative tasks alike —
//! must preserve.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::frame::{Frame, FrameKind};
use crate::http1;
use crate::ship::job::{ConnectJob, ConnectOutcome, HttpJob, JobKind, ResponseEvent};
use crate::ship::link::LinkManager;
use crate::ship::queue::QueueReceiver;
use crate::ship::tunnel;

/// Body bytes are split across `DATA` frames no larger than this when the
/// whole request does not fit the `HTTP_REQ` frame's 1 MiB cap.
const BODY_CHUNK: usize = 64 * 1024;

pub async fn run(mut queue: QueueReceiver, link: LinkManager) {
    while let Some(job) = queue.dequeue().await {
        let job_id = job.id;
        match job.kind {
            JobKind::Http(http_job) => handle_http_job(&link, job_id, http_job).await,
            JobKind::Connect(connect_job) => handle_connect_job(&link, job_id, connect_job).await,
        }
    }
}

async fn handle_http_job(link: &LinkManager, job_id: u64, job: HttpJob) {
    if job.response_tx.is_closed() {
        debug!(job_id, error = %LinkError::ClientGone, "dropping job before dispatch");
        return;
    }

    let generation = link.wait_ready().await;

    let head = match http1::build_origin_form_head(
        &job.method,
        &job.uri,
        job.version,
        job.headers,
        job.body.len(),
    ) {
        Ok(h) => h,
        Err(e) => {
            let _ = job.response_tx.send(ResponseEvent::Error(e.to_string())).await;
            return;
        }
    };

    if let Err(e) = send_http_request(link, generation, job_id, &head.head_bytes, &job.body).await {
        let _ = job.response_tx.send(ResponseEvent::Error(e.to_string())).await;
        return;
    }

    loop {
        let frame = match link.read_frame(generation).await {
            Ok(f) => f,
            Err(e) => {
                let _ = job.response_tx.send(ResponseEvent::Error(e.to_string())).await;
                return;
            }
        };
        if frame.job_id != job_id {
            let _ = job
                .response_tx
                .send(ResponseEvent::Error(
                    "protocol violation: job id mismatch".to_string(),
                ))
                .await;
            return;
        }
        match frame.kind {
            FrameKind::HttpRespChunk => {
                // Ignore send failures: the client may already be gone, but the
                // worker keeps draining frames so the wire protocol stays aligned.
                let _ = job.response_tx.send(ResponseEvent::Chunk(frame.payload)).await;
            }
            FrameKind::HttpRespEnd => {
                let _ = job.response_tx.send(ResponseEvent::End).await;
                return;
            }
            FrameKind::Error => {
                let reason = String::from_utf8_lossy(&frame.payload).to_string();
                let _ = job.response_tx.send(ResponseEvent::Error(reason)).await;
                return;
            }
            other => {
                let _ = job
                    .response_tx
                    .send(ResponseEvent::Error(format!(
                        "protocol violation: unexpected frame {other:?}"
                    )))
                    .await;
                return;
            }
        }
    }
}

async fn send_http_request(
    link: &LinkManager,
    generation: u64,
    job_id: u64,
    head: &[u8],
    body: &Bytes,
) -> crate::error::Result<()> {
    link.write_frame(generation, &Frame::new(FrameKind::HttpReq, job_id, Bytes::copy_from_slice(head)))
        .await?;
    for chunk in body.chunks(BODY_CHUNK) {
        link.write_frame(
            generation,
            &Frame::new(FrameKind::Data, job_id, Bytes::copy_from_slice(chunk)),
        )
        .await?;
    }
    Ok(())
}

async fn handle_connect_job(link: &LinkManager, job_id: u64, job: ConnectJob) {
    if job.outcome_tx.is_closed() {
        debug!(job_id, error = %LinkError::ClientGone, "dropping job before dispatch");
        return;
    }

    let generation = link.wait_ready().await;

    let open = Frame::new(
        FrameKind::ConnectOpen,
        job_id,
        Bytes::from(job.host_port.clone().into_bytes()),
    );
    if let Err(e) = link.write_frame(generation, &open).await {
        let _ = job.outcome_tx.send(ConnectOutcome::Fail(e.to_string()));
        return;
    }

    let first = match link.read_frame(generation).await {
        Ok(f) => f,
        Err(e) => {
            let _ = job.outcome_tx.send(ConnectOutcome::Fail(e.to_string()));
            return;
        }
    };
    if first.job_id != job_id {
        let _ = job
            .outcome_tx
            .send(ConnectOutcome::Fail("protocol violation: job id mismatch".to_string()));
        return;
    }

    match first.kind {
        FrameKind::ConnectOk => {
            if job.outcome_tx.send(ConnectOutcome::Ok).is_err() {
                warn!(job_id, "client gone before tunnel could be confirmed");
                return;
            }
            if let Err(e) = tunnel::run(
                link.clone(),
                generation,
                job_id,
                job.client_to_worker_rx,
                job.worker_to_client_tx,
            )
            .await
            {
                warn!(job_id, error = %e, "tunnel ended with a link error");
            }
        }
        FrameKind::ConnectFail => {
            let reason = String::from_utf8_lossy(&first.payload).to_string();
            let _ = job.outcome_tx.send(ConnectOutcome::Fail(reason));
        }
        other => {
            let _ = job
                .outcome_tx
                .send(ConnectOutcome::Fail(format!("protocol violation: {other:?}")));
        }
    }
}
