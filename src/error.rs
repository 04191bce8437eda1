//! Error taxonomy shared by the ship and offshore binaries.
//!
//! These are kinds, not exception hierarchies: a `LinkError` always maps to
//! one well-defined client-visible outcome (a status line, a dropped link, a
//! forced reconnect) and is never retried at this layer.

use std::io;

/// Errors that can occur while driving the link or a single job.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The link socket is unusable: I/O failure or EOF mid-frame.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// A frame violated the protocol (job id mismatch, over-cap length, bad kind byte).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The ship-side listener could not parse an incoming proxy request.
    #[error("malformed proxy request: {0}")]
    MalformedProxyRequest(String),

    /// The offshore dispatcher failed to dial the upstream origin.
    #[error("upstream dial failure: {0}")]
    UpstreamDialFailure(String),

    /// The offshore dispatcher lost the upstream connection mid-transfer.
    #[error("upstream io failure: {0}")]
    UpstreamIoFailure(String),

    /// The local client disconnected before its job completed.
    #[error("client gone")]
    ClientGone,
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::LinkLost(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
