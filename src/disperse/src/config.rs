use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::DEFAULT_PORT;
use crate::Error;

/// Shape of one dispersal: how the dataset is split across peers and how each peer expands its
/// share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisperseConfig {
    pub dataset_size: usize,
    pub peer_count: usize,
    pub column_count: usize,
    pub row_count: usize,
}

impl Default for DisperseConfig {
    fn default() -> Self {
        DisperseConfig {
            dataset_size: 1 << 30,
            peer_count: 4,
            column_count: 16,
            row_count: 24,
        }
    }
}

impl DisperseConfig {
    pub fn new(
        dataset_size: usize,
        peer_count: usize,
        column_count: usize,
        row_count: usize,
    ) -> Result<Self, Error> {
        let config = DisperseConfig {
            dataset_size,
            peer_count,
            column_count,
            row_count,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.dataset_size == 0
            || self.peer_count == 0
            || self.column_count == 0
            || self.row_count == 0
        {
            return Err(Error::Config(format!(
                "all dispersal parameters must be positive: {:?}",
                self
            )));
        }
        if self.dataset_size % self.peer_count != 0 {
            return Err(Error::Config(format!(
                "dataset size {} is not a multiple of the peer count {}",
                self.dataset_size, self.peer_count
            )));
        }
        if self.row_count < self.column_count {
            return Err(Error::Config(format!(
                "row count {} is smaller than column count {}",
                self.row_count, self.column_count
            )));
        }
        if self.row_count > 256 {
            return Err(Error::Config(format!(
                "row count {} exceeds the 256 fragments a GF(2^8) code can produce",
                self.row_count
            )));
        }
        if self.send_size() < self.column_count {
            return Err(Error::Config(format!(
                "per-peer share of {} bytes cannot be split into {} columns",
                self.send_size(),
                self.column_count
            )));
        }
        let max_len = u32::MAX as usize;
        if self.send_size() > max_len || self.recv_size() > max_len {
            return Err(Error::Config(format!(
                "per-peer transfer sizes {}/{} exceed a single scatter-gather entry",
                self.send_size(),
                self.recv_size()
            )));
        }
        Ok(())
    }

    /// Bytes pushed to each peer.
    #[inline]
    pub fn send_size(&self) -> usize {
        self.dataset_size / self.peer_count
    }

    /// Bytes in one stripe of a peer's share. The division truncates.
    #[inline]
    pub fn fragment_size(&self) -> usize {
        self.send_size() / self.column_count
    }

    /// Bytes pulled back from each peer: `row_count` stripes.
    #[inline]
    pub fn recv_size(&self) -> usize {
        self.fragment_size() * self.row_count
    }
}

/// Deadlines for the blocking steps, in milliseconds. A zero connect or completion deadline
/// means no deadline. Resolution is always bounded, so `resolve_ms` must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    pub resolve_ms: u64,
    pub connect_ms: u64,
    pub completion_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            resolve_ms: 5000,
            connect_ms: 10000,
            completion_ms: 60000,
        }
    }
}

impl Timeouts {
    pub fn validate(&self) -> Result<(), Error> {
        if self.resolve_ms == 0 {
            return Err(Error::Config(
                "resolve_ms must be positive, address and route resolution are always bounded"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn resolve(&self) -> Duration {
        Duration::from_millis(self.resolve_ms)
    }

    #[inline]
    pub fn connect(&self) -> Option<Duration> {
        (self.connect_ms > 0).then(|| Duration::from_millis(self.connect_ms))
    }

    #[inline]
    pub fn completion(&self) -> Option<Duration> {
        (self.completion_ms > 0).then(|| Duration::from_millis(self.completion_ms))
    }
}

/// What the coordinator does when a peer cannot be connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnConnectFailure {
    /// Tear everything down and fail the run.
    #[default]
    Abort,
    /// Report the peer as failed and carry on with the rest.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub peers: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub on_connect_failure: OnConnectFailure,
    #[serde(default)]
    pub disperse: DisperseConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ClientConfig {
    /// Defaults for everything but the peer list; the peer count follows the list.
    pub fn with_peers(peers: Vec<String>) -> Self {
        let disperse = DisperseConfig {
            peer_count: peers.len(),
            ..Default::default()
        };
        ClientConfig {
            peers,
            port: DEFAULT_PORT,
            on_connect_failure: OnConnectFailure::default(),
            disperse,
            timeouts: Timeouts::default(),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.disperse.validate()?;
        self.timeouts.validate()?;
        if self.peers.len() != self.disperse.peer_count {
            return Err(Error::Config(format!(
                "{} peers listed but peer count is {}",
                self.peers.len(),
                self.disperse.peer_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Worker threads handed to the encoder.
    #[serde(default = "num_cpus::get")]
    pub parallelism: usize,
    /// Stop after this many encoded requests. Serve until the connection fails otherwise.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub disperse: DisperseConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            parallelism: num_cpus::get(),
            max_iterations: None,
            disperse: DisperseConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.disperse.validate()?;
        self.timeouts.validate()?;
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be positive".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gigabyte_over_four_peers() {
        let config = DisperseConfig::new(1 << 30, 4, 16, 24).unwrap();
        assert_eq!(config.send_size(), 268_435_456);
        assert_eq!(config.fragment_size(), 16_777_216);
        assert_eq!(config.recv_size(), 402_653_184);
    }

    #[test]
    fn receive_size_truncates_before_scaling() {
        // a share of 100 bytes over 7 columns: 14 bytes per stripe
        let config = DisperseConfig::new(400, 4, 7, 10).unwrap();
        assert_eq!(config.send_size(), 100);
        assert_eq!(config.recv_size(), 140);
        assert_ne!(config.recv_size(), 100 * 10 / 7);
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert!(DisperseConfig::new(0, 4, 16, 24).is_err());
        assert!(DisperseConfig::new(1 << 20, 0, 16, 24).is_err());
        assert!(DisperseConfig::new(1001, 4, 16, 24).is_err());
        assert!(DisperseConfig::new(1 << 20, 4, 24, 16).is_err());
        assert!(DisperseConfig::new(1 << 20, 4, 16, 300).is_err());
        assert!(DisperseConfig::new(40, 4, 16, 24).is_err());
    }

    #[test]
    fn client_config_from_toml() {
        let config = ClientConfig::from_toml(
            r#"
            peers = ["10.0.0.6", "10.0.0.7"]
            on_connect_failure = "continue"

            [disperse]
            dataset_size = 1048576
            peer_count = 2
            column_count = 16
            row_count = 24

            [timeouts]
            resolve_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.on_connect_failure, OnConnectFailure::Continue);
        assert_eq!(config.timeouts.resolve(), Duration::from_millis(1000));
        assert_eq!(config.timeouts.connect_ms, 10000);
        assert_eq!(config.disperse.send_size(), 524_288);
    }

    #[test]
    fn client_config_peer_count_must_match() {
        let err = ClientConfig::from_toml(
            r#"
            peers = ["10.0.0.6"]
            [disperse]
            dataset_size = 1048576
            peer_count = 2
            column_count = 16
            row_count = 24
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ServerConfig::from_toml("listen = \"0.0.0.0:1\"\nbogus = 1\n").is_err());
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert!(config.parallelism > 0);
        assert_eq!(config.max_iterations, None);
        assert_eq!(config.disperse, DisperseConfig::default());
    }

    #[test]
    fn zero_timeout_means_forever() {
        let timeouts = Timeouts {
            completion_ms: 0,
            ..Default::default()
        };
        assert_eq!(timeouts.completion(), None);
        assert_eq!(Timeouts::default().connect(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn zero_resolve_timeout_is_rejected() {
        let mut config = ClientConfig::with_peers(vec!["10.0.0.1".to_owned()]);
        config.disperse = DisperseConfig::new(1 << 16, 1, 16, 24).unwrap();
        config.timeouts.resolve_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let err = ClientConfig::from_toml(
            r#"
            peers = ["10.0.0.1"]

            [disperse]
            dataset_size = 65536
            peer_count = 1
            column_count = 16
            row_count = 24

            [timeouts]
            resolve_ms = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("resolve_ms"));

        config.timeouts.resolve_ms = 1;
        config.validate().unwrap();
    }
}
