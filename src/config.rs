//! CLI surface for both binaries, in the shape of `cmux-novnc-proxy`'s
//! `Args`: `clap::Parser` derives, with the ship's offshore target
//! additionally readable from the environment.

use std::net::IpAddr;

use clap::Parser;

/// Ship-side process: accepts local HTTP proxy clients and drives the link
/// to offshore.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Ship-side HTTP/HTTPS forward proxy")]
pub struct ShipArgs {
    /// Address the local proxy port binds on.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Local proxy port.
    #[arg(long, default_value_t = 8080)]
    pub listen_port: u16,

    /// Offshore host to dial. Required unless set via `OFFSHORE_HOST`.
    #[arg(long, env = "OFFSHORE_HOST")]
    pub offshore_host: String,

    /// Offshore port to dial.
    #[arg(long, env = "OFFSHORE_PORT", default_value_t = 9999)]
    pub offshore_port: u16,
}

/// Offshore-side process: accepts the link from ship and egresses to the
/// public Internet.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Offshore egress for the ship-link proxy")]
pub struct OffshoreArgs {
    /// Address the link port binds on.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Link port.
    #[arg(long, default_value_t = 9999)]
    pub listen_port: u16,
}
