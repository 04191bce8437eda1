//! Ship-side tunnel pump.
//!
//! Two concurrent movers share the job id and the link: an uplink task turns
//! client bytes into `DATA` frames, while this function's own loop — which
//! doubles as the worker's only link-reader — forwards `DATA` frames back to
//! the client and watches for the remote half-close. The worker does not
//! dequeue its next job until both halves are done, which is what makes
//! sequential processing correct for long-lived tunnels.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::frame::{Frame, FrameKind, CLOSE_LOCAL_TO_REMOTE};
use crate::ship::link::LinkManager;

/// Drive one CONNECT tunnel to completion. Returns once both directions have
/// closed cleanly, or immediately on the first link error (the caller is
/// expected to treat that as the job FAILED and let the link manager
/// reconnect).
pub async fn run(
    link: LinkManager,
    generation: u64,
    job_id: u64,
    mut client_to_worker_rx: mpsc::Receiver<Bytes>,
    to_client_tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let uplink_link = link.clone();
    let uplink = tokio::spawn(async move {
        while let Some(chunk) = client_to_worker_rx.recv().await {
            if chunk.is_empty() {
                continue;
            }
            let frame = Frame::new(FrameKind::Data, job_id, chunk);
            if uplink_link.write_frame(generation, &frame).await.is_err() {
                return;
            }
        }
        let close = Frame::new(FrameKind::Close, job_id, Bytes::from_static(&[CLOSE_LOCAL_TO_REMOTE]));
        let _ = uplink_link.write_frame(generation, &close).await;
    });

    let result = loop {
        let frame = match link.read_frame(generation).await {
            Ok(f) => f,
            Err(e) => break Err(e),
        };
        if frame.job_id != job_id {
            break Err(LinkError::ProtocolViolation(format!(
                "frame for job {} arrived while tunnel {} was active",
                frame.job_id, job_id
            )));
        }
        match frame.kind {
            FrameKind::Data => {
                // Client may already be gone; that is not a link error.
                let _ = to_client_tx.send(frame.payload).await;
            }
            FrameKind::Close => {
                debug!(job_id, "remote half of tunnel closed");
                break Ok(());
            }
            other => {
                break Err(LinkError::ProtocolViolation(format!(
                    "unexpected frame kind {other:?} during tunnel"
                )));
            }
        }
    };

    // Dropping the sender half-closes the client's write side once the
    // listener's forwarding task observes the channel close.
    drop(to_client_tx);

    // The pump is not fully terminated — and the worker must not dequeue its
    // next job — until the uplink half has also stopped writing frames for
    // this job id onto the link, whether it got there via client EOF or a
    // link failure of its own.
    let _ = uplink.await;

    result
}
