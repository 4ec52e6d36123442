//! Fans a dataset out to every peer and pulls the encoded fragments back.
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{ClientConfig, OnConnectFailure};
use crate::endpoint::{BufferSizes, ConnectionEndpoint, EndpointOptions};
use crate::fabric::{Fabric, Provider};
use crate::protocol;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerStats {
    pub bytes_sent: usize,
    pub bytes_received: usize,
    /// From sending the pull trigger until the fragments arrived.
    pub pull_latency: Duration,
}

#[derive(Debug)]
pub struct PeerResult {
    pub peer: String,
    pub outcome: Result<PeerStats, Error>,
}

#[derive(Debug)]
pub struct RunReport {
    /// One entry per configured peer, in configuration order.
    pub results: Vec<PeerResult>,
    /// Wall-clock time from the first push until the last pull finished.
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded() == self.results.len()
    }

    pub fn bytes_received(&self) -> usize {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .map(|stats| stats.bytes_received)
            .sum()
    }

    /// The first failure, if any.
    pub fn first_error(&self) -> Option<(&str, &Error)> {
        self.results
            .iter()
            .find_map(|r| r.outcome.as_ref().err().map(|e| (r.peer.as_str(), e)))
    }
}

/// Accepts `host` or `host:port`; picks the first IPv4 address.
pub fn peer_addr(host: &str, port: u16) -> Result<SocketAddr, Error> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| Error::Config(format!("{} has no IPv4 address", host)))
}

enum Slot<F: Fabric> {
    Connected(ConnectionEndpoint<F>),
    Pushed(ConnectionEndpoint<F>, usize),
    Done(Result<PeerStats, Error>),
}

pub struct FanOutCoordinator<P: Provider> {
    provider: P,
    config: ClientConfig,
}

impl<P: Provider> FanOutCoordinator<P> {
    pub fn new(provider: P, config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(FanOutCoordinator { provider, config })
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs all three phases with whatever the send buffers hold (zeros).
    pub fn run(&self) -> Result<RunReport, Error> {
        self.run_inner(None)
    }

    /// Like [`FanOutCoordinator::run`], with peer `i` sent the `i`-th share of `dataset`.
    pub fn run_dataset(&self, dataset: &[u8]) -> Result<RunReport, Error> {
        if dataset.len() != self.config.disperse.dataset_size {
            return Err(Error::Config(format!(
                "dataset of {} bytes, expected {}",
                dataset.len(),
                self.config.disperse.dataset_size
            )));
        }
        self.run_inner(Some(dataset))
    }

    fn run_inner(&self, dataset: Option<&[u8]>) -> Result<RunReport, Error> {
        let mut slots = self.connect_all()?;

        let start = Instant::now();
        let share = self.config.disperse.send_size();
        for (i, (peer, slot)) in slots.iter_mut().enumerate() {
            let Slot::Connected(endpoint) = slot else {
                continue;
            };
            let pushed = dataset
                .map_or(Ok(()), |data| {
                    endpoint
                        .send_buf_mut()
                        .map(|buf| buf.copy_from_slice(&data[i * share..(i + 1) * share]))
                })
                .and_then(|()| protocol::push(endpoint));
            if let Err(e) = &pushed {
                log::warn!("push to {} failed: {}", peer, e);
            }
            let previous = std::mem::replace(slot, Slot::Done(Ok(PeerStats::default())));
            *slot = match (previous, pushed) {
                (Slot::Connected(endpoint), Ok(sent)) => {
                    log::debug!("pushed {} bytes to {}", sent, peer);
                    Slot::Pushed(endpoint, sent)
                }
                (_, Err(e)) => Slot::Done(Err(e)),
                (other, Ok(_)) => other,
            };
        }
        log::info!("pushed to all peers in {:?}", start.elapsed());

        let results = fan_in(slots, spawn_pull::<P::Fabric>);
        let elapsed = start.elapsed();
        log::info!(
            "fan-out/fan-in of {} bytes took {:?}",
            self.config.disperse.dataset_size,
            elapsed
        );
        Ok(RunReport { results, elapsed })
    }

    /// Connects to every peer in order. Under the abort policy the first failure tears down
    /// every connection made so far.
    fn connect_all(&self) -> Result<Vec<(String, Slot<P::Fabric>)>, Error> {
        let sizes = BufferSizes::client(&self.config.disperse);
        let options = EndpointOptions::from_timeouts(&self.config.timeouts);
        let start = Instant::now();

        let mut slots = Vec::with_capacity(self.config.peers.len());
        for host in &self.config.peers {
            let connected = peer_addr(host, self.config.port).and_then(|addr| {
                let fabric = self.provider.open()?;
                ConnectionEndpoint::connect(fabric, addr, sizes, options.clone())
            });
            match connected {
                Ok(endpoint) => {
                    log::info!("connected to {} ({})", host, endpoint.peer());
                    slots.push((host.clone(), Slot::Connected(endpoint)));
                }
                Err(e) => match self.config.on_connect_failure {
                    OnConnectFailure::Abort => {
                        log::error!("connecting to {} failed: {}", host, e);
                        drop(slots);
                        return Err(Error::ConnectAborted {
                            peer: host.clone(),
                            source: Box::new(e),
                        });
                    }
                    OnConnectFailure::Continue => {
                        log::warn!("connecting to {} failed, skipping it: {}", host, e);
                        slots.push((host.clone(), Slot::Done(Err(e))));
                    }
                },
            }
        }
        log::info!("connect phase took {:?}", start.elapsed());
        Ok(slots)
    }
}

type PullHandle = JoinHandle<Result<PeerStats, Error>>;

fn spawn_pull<F: Fabric + 'static>(
    peer: &str,
    endpoint: ConnectionEndpoint<F>,
    sent: usize,
) -> io::Result<PullHandle> {
    thread::Builder::new()
        .name(format!("pull-{}", peer))
        .spawn(move || pull_worker(endpoint, sent))
}

/// Pulls from every pushed peer in parallel and collects the outcomes in peer order. A worker
/// that cannot be started fails its own peer only; its endpoint is torn down on the spot.
fn fan_in<F, S>(slots: Vec<(String, Slot<F>)>, mut spawn: S) -> Vec<PeerResult>
where
    F: Fabric,
    S: FnMut(&str, ConnectionEndpoint<F>, usize) -> io::Result<PullHandle>,
{
    let mut workers = Vec::with_capacity(slots.len());
    for (peer, slot) in slots {
        let worker = match slot {
            Slot::Pushed(endpoint, sent) => spawn(&peer, endpoint, sent).map_err(|e| {
                log::error!("cannot start the pull worker for {}: {}", peer, e);
                Err(Error::Io(e))
            }),
            Slot::Done(outcome) => Err(outcome),
            Slot::Connected(endpoint) => Err(Err(Error::InvalidTransition {
                from: endpoint.state(),
                step: "pull before push",
            })),
        };
        workers.push((peer, worker));
    }

    let mut results = Vec::with_capacity(workers.len());
    for (peer, worker) in workers {
        let outcome = match worker {
            Ok(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(Error::WorkerPanicked(peer.clone()))),
            Err(outcome) => outcome,
        };
        match &outcome {
            Ok(stats) => log::info!(
                "{}: received {} bytes, pull took {:?}",
                peer,
                stats.bytes_received,
                stats.pull_latency
            ),
            Err(e) => log::warn!("{}: {}", peer, e),
        }
        results.push(PeerResult { peer, outcome });
    }
    results
}

/// Runs on its own thread and owns the endpoint, which is torn down when it returns.
fn pull_worker<F: Fabric>(
    mut endpoint: ConnectionEndpoint<F>,
    bytes_sent: usize,
) -> Result<PeerStats, Error> {
    let start = Instant::now();
    let bytes_received = protocol::pull(&mut endpoint)?;
    let pull_latency = start.elapsed();
    endpoint.teardown();
    Ok(PeerStats {
        bytes_sent,
        bytes_received,
        pull_latency,
    })
}
