#![allow(dead_code)]
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use disperse::config::{DisperseConfig, ServerConfig, Timeouts};
use disperse::encode::ReedSolomonEncoder;
use disperse::fabric::loopback::LoopbackNetwork;
use disperse::server::{EncodeServeLoop, ServeError, ServeSummary};
use disperse::wire::DEFAULT_PORT;

pub type ServerHandle = JoinHandle<Result<ServeSummary, ServeError>>;

pub fn init_log() {
    disperse::logging::init_env_log(disperse::LOG_ENV, "warn");
}

/// A mebibyte over four peers: 256 KiB shares, 384 KiB of fragments back.
pub fn shape() -> DisperseConfig {
    DisperseConfig::new(1 << 20, 4, 16, 24).unwrap()
}

pub fn peer_host(i: usize) -> String {
    format!("10.0.0.{}", i + 1)
}

pub fn peer_listen(i: usize) -> SocketAddr {
    SocketAddr::new(peer_host(i).parse().unwrap(), DEFAULT_PORT)
}

pub fn wait_listening(network: &LoopbackNetwork, addr: &SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !network.is_listening(addr) {
        assert!(Instant::now() < deadline, "{} never started listening", addr);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Starts a peer on its own thread and returns once it listens.
pub fn spawn_server(
    network: &LoopbackNetwork,
    listen: SocketAddr,
    shape: DisperseConfig,
    max_iterations: Option<u64>,
) -> ServerHandle {
    let config = ServerConfig {
        listen,
        parallelism: 2,
        max_iterations,
        disperse: shape,
        timeouts: Timeouts::default(),
    };
    let encoder = ReedSolomonEncoder::new(shape.column_count, shape.row_count).unwrap();
    let serve_loop = EncodeServeLoop::new(network.clone(), config, encoder).unwrap();
    let handle = thread::Builder::new()
        .name(format!("server-{}", listen))
        .spawn(move || serve_loop.run())
        .unwrap();
    wait_listening(network, &listen);
    handle
}
