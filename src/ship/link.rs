//! The ship-side link manager.
//!
//! Owns the single outbound TCP connection to offshore. A background task
//! dials, and on success serves frame I/O until an error forces it back to
//! `Connecting`; the worker never dials directly, it only calls
//! `wait_ready`/`read_frame`/`write_frame`/`reset`.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::error::{LinkError, Result};
use crate::frame::{self, Frame};

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// `min(30s, 0.5s * 2^n)`, n capped at 6.
fn backoff_for(attempt: u32) -> Duration {
    let capped = attempt.min(6);
    let millis = 500u64.saturating_mul(1u64 << capped);
    Duration::from_millis(millis.min(30_000))
}

struct Shared {
    host: String,
    port: u16,
    state: AtomicU8,
    generation: AtomicU64,
    // Each half is tagged with the generation it was installed under, so a
    // checked read/write can tell — inside the same lock the dial loop uses
    // to swap the half — whether it is still talking to the connection its
    // caller started the job against.
    read_half: Mutex<Option<(OwnedReadHalf, u64)>>,
    write_half: Mutex<Option<(OwnedWriteHalf, u64)>>,
    became_ready: Notify,
    kick: Notify,
}

/// Handle to the link. Cheap to clone; all clones share the same socket and
/// state machine.
#[derive(Clone)]
pub struct LinkManager {
    shared: Arc<Shared>,
}

impl LinkManager {
    /// Construct a link manager and spawn its background dial loop.
    pub fn spawn(host: String, port: u16) -> Self {
        let shared = Arc::new(Shared {
            host,
            port,
            state: AtomicU8::new(STATE_CONNECTING),
            generation: AtomicU64::new(0),
            read_half: Mutex::new(None),
            write_half: Mutex::new(None),
            became_ready: Notify::new(),
            kick: Notify::new(),
        });
        let mgr = LinkManager { shared };
        tokio::spawn(mgr.clone().run_dial_loop());
        mgr
    }

    async fn run_dial_loop(self) {
        let mut attempt: u32 = 0;
        loop {
            if self.shared.state.load(Ordering::SeqCst) == STATE_CLOSED {
                return;
            }
            let addr = (self.shared.host.as_str(), self.shared.port);
            info!(host = %self.shared.host, port = self.shared.port, "dialing offshore");
            let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await;
            match dial {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    *self.shared.read_half.lock().await = Some((read_half, generation));
                    *self.shared.write_half.lock().await = Some((write_half, generation));
                    self.shared.state.store(STATE_CONNECTED, Ordering::SeqCst);
                    attempt = 0;
                    info!(generation, "link connected");
                    self.shared.became_ready.notify_waiters();
                    self.wait_for_kick().await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "offshore dial failed");
                    self.sleep_backoff(&mut attempt).await;
                }
                Err(_) => {
                    warn!("offshore dial timed out");
                    self.sleep_backoff(&mut attempt).await;
                }
            }
        }
    }

    async fn sleep_backoff(&self, attempt: &mut u32) {
        let delay = backoff_for(*attempt);
        *attempt += 1;
        tokio::time::sleep(delay).await;
    }

    /// Park until something calls `reset()` (or the dial loop is told to
    /// shut down), then loop back to redial.
    async fn wait_for_kick(&self) {
        loop {
            if self.shared.state.load(Ordering::SeqCst) != STATE_CONNECTED {
                return;
            }
            self.shared.kick.notified().await;
            if self.shared.state.load(Ordering::SeqCst) != STATE_CONNECTED {
                return;
            }
        }
    }

    /// Current generation counter; bumps on every successful (re)connect.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Park the caller until the link is CONNECTED. Returns the generation
    /// the caller observed, so it can later detect a reconnect mid-job.
    pub async fn wait_ready(&self) -> u64 {
        loop {
            if self.shared.state.load(Ordering::SeqCst) == STATE_CONNECTED {
                return self.generation();
            }
            self.shared.became_ready.notified().await;
        }
    }

    /// Write one frame, but only if the link is still on `generation` — the
    /// value the caller captured from `wait_ready()`. If a reconnect has
    /// happened in between, the stale half is never touched: the caller gets
    /// `LinkLost` instead of writing its frame onto an unrelated connection.
    /// On a live I/O failure, forces a reconnect and returns `LinkLost`.
    pub async fn write_frame(&self, generation: u64, frame: &Frame) -> Result<()> {
        let mut guard = self.shared.write_half.lock().await;
        match guard.as_mut() {
            Some((half, half_generation)) if *half_generation == generation => {
                match frame::write_frame(half, frame).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        drop(guard);
                        self.reset().await;
                        Err(e)
                    }
                }
            }
            _ => {
                drop(guard);
                Err(LinkError::LinkLost("link reconnected since this job started".to_string()))
            }
        }
    }

    /// Read one frame, gated on `generation` the same way `write_frame` is.
    /// Only the worker's main loop should call this — the link read side is
    /// single-consumer by design.
    pub async fn read_frame(&self, generation: u64) -> Result<Frame> {
        let mut guard = self.shared.read_half.lock().await;
        match guard.as_mut() {
            Some((half, half_generation)) if *half_generation == generation => {
                match frame::read_frame(half).await {
                    Ok(f) => Ok(f),
                    Err(e) => {
                        drop(guard);
                        self.reset().await;
                        Err(e)
                    }
                }
            }
            _ => {
                drop(guard);
                Err(LinkError::LinkLost("link reconnected since this job started".to_string()))
            }
        }
    }

    /// Tear down the current socket (if any) and move back to CONNECTING.
    /// The next successful dial assigns a fresh generation, so any caller
    /// still holding the old one will have its next `read_frame`/`write_frame`
    /// rejected rather than silently redirected onto the new connection.
    pub async fn reset(&self) {
        if self.shared.state.swap(STATE_CONNECTING, Ordering::SeqCst) == STATE_CLOSED {
            self.shared.state.store(STATE_CLOSED, Ordering::SeqCst);
            return;
        }
        if let Some((mut half, _)) = self.shared.write_half.lock().await.take() {
            let _ = half.shutdown().await;
        }
        self.shared.read_half.lock().await.take();
        self.shared.kick.notify_waiters();
    }

    /// Shut down for good (process shutdown only — CLOSED is terminal).
    pub async fn close(&self) {
        self.shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        if let Some((mut half, _)) = self.shared.write_half.lock().await.take() {
            let _ = half.shutdown().await;
        }
        self.shared.read_half.lock().await.take();
        self.shared.kick.notify_waiters();
        self.shared.became_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(500));
        assert_eq!(backoff_for(1), Duration::from_millis(1000));
        assert_eq!(backoff_for(2), Duration::from_millis(2000));
        assert_eq!(backoff_for(6), Duration::from_millis(30_000));
        assert_eq!(backoff_for(20), Duration::from_millis(30_000));
    }
}
