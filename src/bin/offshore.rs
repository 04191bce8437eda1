//! Offshore process entry point: parse CLI and serve the link port until
//! Ctrl-C/SIGTERM.

use std::net::SocketAddr;

use clap::Parser;
use ship_link_proxy::config::OffshoreArgs;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = OffshoreArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ship_link_proxy=info".into()),
        )
        .compact()
        .init();

    let listen = SocketAddr::new(args.listen_host, args.listen_port);

    match ship_link_proxy::offshore::listener::spawn(listen, shutdown_signal()).await {
        Ok((bound, handle)) => {
            info!(%bound, "offshore started");
            if let Err(err) = handle.await {
                error!(%err, "listener task failed");
                std::process::exit(1);
            }
        }
        Err(err) => {
            error!(%err, "failed to bind link port");
            std::process::exit(2);
        }
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
