#![cfg_attr(not(feature = "verbs"), allow(dead_code, unused_imports))]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;

use disperse::config::ServerConfig;
use disperse::encode::ReedSolomonEncoder;
use disperse::fabric::Provider;
use disperse::logging::init_env_log;
use disperse::server::EncodeServeLoop;

#[derive(Debug, Clone, Parser)]
#[command(name = "disperse-server", about = "Serve erasure-coding requests from one client")]
struct Opts {
    /// Server config path
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    /// Encoder threads
    #[arg(short, long)]
    parallelism: Option<usize>,
}

impl Opts {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_path(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        config.validate()?;
        Ok(config)
    }
}

fn run<P: Provider>(provider: P, config: ServerConfig) -> Result<()> {
    let shape = config.disperse;
    let encoder = ReedSolomonEncoder::new(shape.column_count, shape.row_count)?;
    let serve_loop = EncodeServeLoop::new(provider, config, encoder)?;
    match serve_loop.run() {
        Ok(summary) => {
            println!(
                "served {} requests: {} bytes in, {} bytes out, {:?} encoding",
                summary.encoded, summary.bytes_in, summary.bytes_out, summary.encode_time
            );
            Ok(())
        }
        Err(e) => {
            println!(
                "served {} requests before the connection ended",
                e.summary.encoded
            );
            Err(e.error.into())
        }
    }
}

#[cfg(feature = "verbs")]
fn run_with_verbs(config: ServerConfig) -> Result<()> {
    run(disperse::fabric::verbs::VerbsProvider::new(), config)
}

#[cfg(not(feature = "verbs"))]
fn run_with_verbs(_config: ServerConfig) -> Result<()> {
    Err(disperse::Error::Config(
        "built without RDMA support, rebuild with `--features verbs`".to_owned(),
    )
    .into())
}

fn main() {
    init_env_log(disperse::LOG_ENV, "info");

    let opts = Opts::parse();
    let result = opts.server_config().and_then(run_with_verbs);

    if let Err(e) = result {
        log::error!("{:#}", e);
        let code = e
            .downcast_ref::<disperse::Error>()
            .map_or(1, disperse::Error::exit_code);
        process::exit(code);
    }
}
