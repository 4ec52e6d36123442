//! Disperses a dataset over RDMA to a set of erasure-coding peers and collects the encoded
//! fragments back.
//!
//! The client side is [`coordinator::FanOutCoordinator`], the peer side
//! [`server::EncodeServeLoop`]. Both drive [`endpoint::ConnectionEndpoint`]s over a
//! [`fabric::Fabric`]: librdmacm/libibverbs with the `verbs` feature, or the in-process
//! [`fabric::loopback`] network.

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod encode;
pub mod endpoint;
pub mod fabric;
pub mod logging;
pub mod poller;
pub mod protocol;
pub mod server;
pub mod state;
pub mod wire;

mod error;
pub use error::Error;

/// Environment variable holding the log filter of both binaries.
pub const LOG_ENV: &str = "DISPERSE_LOG";
