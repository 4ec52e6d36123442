mod common;

use disperse::config::ClientConfig;
use disperse::coordinator::FanOutCoordinator;
use disperse::fabric::loopback::LoopbackNetwork;

use common::{peer_host, peer_listen, spawn_server};

#[test]
fn every_peer_returns_its_fragments() {
    common::init_log();
    let network = LoopbackNetwork::new();
    let shape = common::shape();
    let servers: Vec<_> = (0..4)
        .map(|i| spawn_server(&network, peer_listen(i), shape, None))
        .collect();

    let mut config = ClientConfig::with_peers((0..4).map(peer_host).collect());
    config.disperse = shape;
    let coordinator = FanOutCoordinator::new(network.clone(), config).unwrap();
    let report = coordinator.run().unwrap();

    assert!(report.is_complete(), "{:?}", report.first_error());
    assert_eq!(report.results.len(), 4);
    for (i, result) in report.results.iter().enumerate() {
        assert_eq!(result.peer, peer_host(i));
        let stats = result.outcome.as_ref().unwrap();
        assert_eq!(stats.bytes_sent, 262_144);
        assert_eq!(stats.bytes_received, 393_216);
        // pulls overlap, so the whole run cannot be shorter than any one of them
        assert!(report.elapsed >= stats.pull_latency);
    }
    assert_eq!(report.bytes_received(), 4 * 393_216);

    for server in servers {
        let stopped = server.join().unwrap().unwrap_err();
        assert!(stopped.error.is_flush(), "{}", stopped);
        assert_eq!(stopped.summary.encoded, 1);
        assert_eq!(stopped.summary.triggers, 1);
        assert_eq!(stopped.summary.bytes_in, 262_144);
        assert_eq!(stopped.summary.bytes_out, 393_216);
    }
    for i in 0..4 {
        assert!(!network.is_listening(&peer_listen(i)));
    }
}

#[test]
fn run_dataset_sends_each_peer_its_share() {
    common::init_log();
    let network = LoopbackNetwork::new();
    let shape = disperse::config::DisperseConfig::new(1 << 16, 2, 16, 24).unwrap();
    let servers: Vec<_> = (0..2)
        .map(|i| spawn_server(&network, peer_listen(i), shape, None))
        .collect();

    let mut config = ClientConfig::with_peers((0..2).map(peer_host).collect());
    config.disperse = shape;
    let coordinator = FanOutCoordinator::new(network, config).unwrap();

    assert!(coordinator.run_dataset(&[0u8; 17]).is_err());
    let dataset: Vec<u8> = (0..shape.dataset_size).map(|i| (i % 251) as u8).collect();
    let report = coordinator.run_dataset(&dataset).unwrap();
    assert!(report.is_complete());

    for server in servers {
        let stopped = server.join().unwrap().unwrap_err();
        assert_eq!(stopped.summary.bytes_in, 1 << 15);
    }
}
