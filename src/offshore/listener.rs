//! Offshore-side peer listener.
//!
//! Accepts the incoming link connection from the ship. Only one link is
//! served at a time; a second connection arriving while one is live is
//! closed immediately ("reject the newcomer" rather than superseding it).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::offshore::dispatcher;

/// Bind and serve the link port until `shutdown` resolves.
pub async fn spawn(
    listen: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let bound = listener.local_addr()?;
    info!(%bound, "offshore listening for the ship link");

    let notify = Arc::new(Notify::new());
    let notify_clone = notify.clone();
    tokio::spawn(async move {
        shutdown.await;
        notify_clone.notify_waiters();
    });

    let busy = Arc::new(AtomicBool::new(false));

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    info!("offshore listener shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if busy.swap(true, Ordering::SeqCst) {
                                warn!(%peer_addr, "rejecting second link connection while one is live");
                                drop(stream);
                                continue;
                            }
                            let busy = busy.clone();
                            tokio::spawn(async move {
                                info!(%peer_addr, "link connected");
                                if let Err(e) = dispatcher::serve_link(stream).await {
                                    warn!(%peer_addr, error = %e, "link connection ended");
                                } else {
                                    info!(%peer_addr, "link connection closed");
                                }
                                busy.store(false, Ordering::SeqCst);
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
