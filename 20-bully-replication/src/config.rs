//! Node configuration.
//!
//! A node is configured from an optional JSON file, overridden by command-line
//! flags, and resolved into a [`NodeConfig`] that [`crate::runtime::spawn_node`]
//! consumes. Tests build `NodeConfig` directly.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use serde::Deserialize;
use tracing::warn;

use crate::cli::NodeArgs;
use crate::message::NodeId;

pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;
pub const DEFAULT_BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Periods and deadlines driving discovery, failure detection and elections.
#[derive(Debug, Clone)]
pub struct Timing {
    pub discovery_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is evicted.
    pub heartbeat_timeout: Duration,
    pub monitor_interval: Duration,
    /// Bound on every outbound connect, send and reply wait.
    pub rpc_timeout: Duration,
    pub startup_election_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(6),
            monitor_interval: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(2),
            startup_election_delay: Duration::from_secs(5),
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.discovery_interval.is_zero()
                && !self.heartbeat_interval.is_zero()
                && !self.monitor_interval.is_zero()
                && !self.rpc_timeout.is_zero(),
            "timing periods must be non-zero"
        );
        ensure!(
            self.heartbeat_timeout > self.heartbeat_interval,
            "heartbeat timeout ({:?}) must exceed the heartbeat interval ({:?})",
            self.heartbeat_timeout,
            self.heartbeat_interval
        );
        Ok(())
    }
}

/// Runtime configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Stream listener address. Port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Address announced to peers; the announced port is the bound port.
    pub advertise_ip: IpAddr,
    pub discovery_bind: SocketAddr,
    /// Where announcements are sent, normally the broadcast address.
    pub discovery_targets: Vec<SocketAddr>,
    /// SQLite file; `None` keeps the data in memory.
    pub database: Option<PathBuf>,
    pub timing: Timing,
}

impl NodeConfig {
    /// Builds the runtime configuration from an optional file plus CLI flags.
    pub fn from_args(args: &NodeArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => Some(FileConfig::load(path)?),
            None => None,
        };
        let file = file.unwrap_or_default();

        let id = args
            .id
            .or(file.node_id)
            .ok_or_else(|| anyhow!("node id is required (--id or node_id in the config file)"))?;
        let port = args.port.or(file.port).unwrap_or(0);
        let advertise_ip = match args.ip.or(file.ip) {
            Some(ip) => ip,
            None => resolve_local_ip(),
        };
        let discovery_port = args.discovery_port.unwrap_or(file.discovery.port);

        let config = Self {
            id,
            listen_addr: SocketAddr::new(advertise_ip, port),
            advertise_ip,
            discovery_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), discovery_port),
            discovery_targets: vec![SocketAddr::new(IpAddr::V4(file.discovery.broadcast), discovery_port)],
            database: args.database.clone().or(file.database),
            timing: file.timing.into(),
        };
        config.timing.validate()?;
        Ok(config)
    }
}

/// On-disk configuration, e.g.
///
/// ```json
/// { "node_id": 1, "port": 5001, "database": "node1.db",
///   "timing": { "heartbeat_interval_ms": 1000, "heartbeat_timeout_ms": 2500 } }
/// ```
///
/// Unknown top-level keys, such as the `mysql` section of older files, are
/// ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub node_id: Option<NodeId>,
    pub port: Option<u16>,
    pub ip: Option<IpAddr>,
    pub database: Option<PathBuf>,
    pub discovery: DiscoverySection,
    pub timing: TimingSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    pub port: u16,
    pub broadcast: Ipv4Addr,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast: DEFAULT_BROADCAST,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingSection {
    pub discovery_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub startup_election_delay_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        let timing = Timing::default();
        Self {
            discovery_interval_ms: millis(timing.discovery_interval),
            heartbeat_interval_ms: millis(timing.heartbeat_interval),
            heartbeat_timeout_ms: millis(timing.heartbeat_timeout),
            monitor_interval_ms: millis(timing.monitor_interval),
            rpc_timeout_ms: millis(timing.rpc_timeout),
            startup_election_delay_ms: millis(timing.startup_election_delay),
        }
    }
}

impl From<TimingSection> for Timing {
    fn from(section: TimingSection) -> Self {
        Self {
            discovery_interval: Duration::from_millis(section.discovery_interval_ms),
            heartbeat_interval: Duration::from_millis(section.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(section.heartbeat_timeout_ms),
            monitor_interval: Duration::from_millis(section.monitor_interval_ms),
            rpc_timeout: Duration::from_millis(section.rpc_timeout_ms),
            startup_election_delay: Duration::from_millis(section.startup_election_delay_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Address of the interface that routes to the outside world.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    Ok(socket.local_addr()?.ip())
}

fn resolve_local_ip() -> IpAddr {
    local_ip().unwrap_or_else(|err| {
        warn!(error = %err, "could not resolve local address, using loopback");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}
