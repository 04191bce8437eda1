//! Ship-side components: link manager, request queue and
//! worker, and the client listener / proxy parser.

pub mod job;
pub mod link;
pub mod listener;
pub mod queue;
pub mod tunnel;
pub mod worker;

use std::net::SocketAddr;

use self::job::Job;
use self::link::LinkManager;
use self::queue::QueueSender;

/// Configuration for one ship process.
#[derive(Debug, Clone)]
pub struct ShipConfig {
    pub listen: SocketAddr,
    pub offshore_host: String,
    pub offshore_port: u16,
}

/// The ship process's one piece of shared state (no hidden
/// singletons — this value is constructed once by the process entry point
/// and passed explicitly to the listener).
#[derive(Clone)]
pub struct ShipCore {
    queue_tx: QueueSender,
    pub link: LinkManager,
}

impl ShipCore {
    /// Start the link manager and worker, returning a handle the client
    /// listener uses to enqueue jobs.
    pub fn start(cfg: &ShipConfig) -> Self {
        let (queue_tx, queue_rx) = queue::queue();
        let link = LinkManager::spawn(cfg.offshore_host.clone(), cfg.offshore_port);
        tokio::spawn(worker::run(queue_rx, link.clone()));
        ShipCore { queue_tx, link }
    }

    /// Enqueue a job. Returns the job back on failure (worker has shut down).
    pub fn enqueue(&self, job: Job) -> Result<(), Job> {
        self.queue_tx.enqueue(job)
    }
}
