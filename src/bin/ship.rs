//! Ship process entry point: parse CLI, start the link manager and worker,
//! then serve local proxy clients until Ctrl-C/SIGTERM.

use std::net::SocketAddr;

use clap::Parser;
use ship_link_proxy::config::ShipArgs;
use ship_link_proxy::ship::{ShipConfig, ShipCore};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = ShipArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ship_link_proxy=info,hyper=warn".into()),
        )
        .compact()
        .init();

    let listen = SocketAddr::new(args.listen_host, args.listen_port);
    let cfg = ShipConfig {
        listen,
        offshore_host: args.offshore_host,
        offshore_port: args.offshore_port,
    };

    let core = ShipCore::start(&cfg);

    match ship_link_proxy::ship::listener::spawn(core.clone(), cfg.listen, shutdown_signal()).await {
        Ok((bound, handle)) => {
            info!(%bound, offshore = %format!("{}:{}", cfg.offshore_host, cfg.offshore_port), "ship started");
            if let Err(err) = handle.await {
                error!(%err, "listener task failed");
                std::process::exit(1);
            }
        }
        Err(err) => {
            error!(%err, "failed to bind local proxy port");
            std::process::exit(2);
        }
    }

    core.link.close().await;
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
