//! A two-process HTTP/HTTPS forward proxy multiplexed over a single
//! ship-to-offshore link. `ship` and `offshore` are the two binaries;
//! everything else is a library so both binaries and the integration tests
//! can reuse it.

pub mod config;
pub mod error;
pub mod frame;
pub mod http1;
pub mod offshore;
pub mod ship;
