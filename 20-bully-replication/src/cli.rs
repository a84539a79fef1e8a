use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::config::{DEFAULT_BROADCAST, DEFAULT_DISCOVERY_PORT};
use crate::message::NodeId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cluster node: discovery, heartbeats, elections and replication.
    Node(NodeArgs),
    /// Discover the cluster and send SQL statements interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// JSON config file. Flags given on the command line take precedence.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Unique numeric node id; the highest live id becomes coordinator.
    #[arg(long)]
    pub id: Option<NodeId>,

    /// Port for peer and client connections. Defaults to an ephemeral port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Address announced to peers. Defaults to the outbound interface address.
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// SQLite database file. Without one the data lives in memory.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub database: Option<PathBuf>,

    /// UDP port shared by every node for discovery announcements.
    #[arg(long)]
    pub discovery_port: Option<u16>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Talk to this node directly instead of discovering the cluster.
    #[arg(long)]
    pub node: Option<SocketAddr>,

    /// UDP port the nodes listen on for discovery.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Address discovery requests are sent to.
    #[arg(long, default_value_t = IpAddr::V4(DEFAULT_BROADCAST))]
    pub broadcast: IpAddr,

    /// How long to collect discovery replies, and the bound on each query.
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

impl ClientArgs {
    pub fn discovery_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast, self.discovery_port)
    }
}
