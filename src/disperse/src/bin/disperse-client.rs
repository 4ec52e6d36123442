#![cfg_attr(not(feature = "verbs"), allow(dead_code, unused_imports))]

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Result};
use clap::Parser;

use disperse::config::{ClientConfig, OnConnectFailure};
use disperse::coordinator::{FanOutCoordinator, RunReport};
use disperse::fabric::Provider;
use disperse::logging::init_env_log;

#[derive(Debug, Clone, Parser)]
#[command(name = "disperse-client", about = "Fan a dataset out to encoding peers and pull the fragments back")]
struct Opts {
    /// Client config path
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Peer host, in order. Replaces the peer list of the config
    #[arg(short, long = "peer")]
    peers: Vec<String>,
    /// Port the peers listen on
    #[arg(short = 'P', long)]
    port: Option<u16>,
    #[arg(long, value_enum)]
    on_connect_failure: Option<OnConnectFailure>,
}

impl Opts {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_path(path)?,
            None if self.peers.is_empty() => bail!("no peers given, pass --config or --peer"),
            None => ClientConfig::with_peers(self.peers.clone()),
        };
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
            config.disperse.peer_count = config.peers.len();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(policy) = self.on_connect_failure {
            config.on_connect_failure = policy;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_report(report: &RunReport) {
    for result in &report.results {
        match &result.outcome {
            Ok(stats) => println!(
                "{}: sent {} bytes, received {} bytes, pull {:?}",
                result.peer, stats.bytes_sent, stats.bytes_received, stats.pull_latency
            ),
            Err(e) => println!("{}: failed: {}", result.peer, e),
        }
    }
    println!(
        "{}/{} peers, {} bytes received, elapsed {:?}",
        report.succeeded(),
        report.results.len(),
        report.bytes_received(),
        report.elapsed
    );
}

fn run<P: Provider>(provider: P, config: ClientConfig) -> Result<()> {
    let coordinator = FanOutCoordinator::new(provider, config)?;
    let report = coordinator.run()?;
    print_report(&report);
    if let Some((peer, e)) = report.first_error() {
        log::warn!("run finished without {}: {}", peer, e);
    }
    Ok(())
}

#[cfg(feature = "verbs")]
fn run_with_verbs(config: ClientConfig) -> Result<()> {
    run(disperse::fabric::verbs::VerbsProvider::new(), config)
}

#[cfg(not(feature = "verbs"))]
fn run_with_verbs(_config: ClientConfig) -> Result<()> {
    Err(disperse::Error::Config(
        "built without RDMA support, rebuild with `--features verbs`".to_owned(),
    )
    .into())
}

fn main() {
    init_env_log(disperse::LOG_ENV, "info");

    let opts = Opts::parse();
    let result = opts.client_config().and_then(run_with_verbs);

    if let Err(e) = result {
        log::error!("{:#}", e);
        let code = e
            .downcast_ref::<disperse::Error>()
            .map_or(1, disperse::Error::exit_code);
        process::exit(code);
    }
}
