//! The ship-side request queue.
//!
//! The design calls for a single unbounded FIFO guarded by a mutex and a
//! condition variable, or an equivalent channel. An unbounded
//! `tokio::sync::mpsc` channel is that equivalent channel: `send` never
//! blocks the client listener, and `recv` parks the worker until a job is
//! enqueued, preserving enqueue order.

use tokio::sync::mpsc;

use crate::ship::job::Job;

#[derive(Clone)]
pub struct QueueSender(mpsc::UnboundedSender<Job>);

pub struct QueueReceiver(mpsc::UnboundedReceiver<Job>);

pub fn queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender(tx), QueueReceiver(rx))
}

impl QueueSender {
    /// Enqueue a job. Never blocks; fails only once the worker has shut down.
    pub fn enqueue(&self, job: Job) -> Result<(), Job> {
        self.0.send(job).map_err(|e| e.0)
    }
}

impl QueueReceiver {
    /// Block until a job is available, in enqueue order.
    pub async fn dequeue(&mut self) -> Option<Job> {
        self.0.recv().await
    }
}
