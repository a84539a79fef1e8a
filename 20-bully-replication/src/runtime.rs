//! Node assembly and lifecycle.
//!
//! [`spawn_node`] binds the node's sockets, opens its storage and starts every
//! long-running activity as a task in one [`JoinSet`]:
//!
//! - the stream listener, which hands each connection to the [`Dispatcher`]
//! - the discovery announcer and the discovery listener
//! - the heartbeat sender and the heartbeat monitor
//! - one delayed startup election
//!
//! The returned [`NodeHandle`] inspects the running node and stops it.
//! Stopping aborts every task at once, which to the rest of the cluster looks
//! exactly like the process dying.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::config::NodeConfig;
use crate::coordinator::CoordinatorState;
use crate::discovery::{DiscoveryService, bind_broadcast};
use crate::dispatcher::Dispatcher;
use crate::election::{ElectionEngine, ElectionOutcome};
use crate::heartbeat::HeartbeatService;
use crate::membership::{LivenessTable, MembershipRegistry};
use crate::message::{Message, NodeId, NodeInfo};
use crate::replication::Replicator;
use crate::storage::{SqliteEngine, Storage};
use crate::transport::Transport;

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub coordinator_id: Option<NodeId>,
    pub is_coordinator: bool,
    /// Known peers, excluding this node, ordered by id.
    pub peers: Vec<NodeInfo>,
}

/// Handle to a running node.
pub struct NodeHandle {
    info: NodeInfo,
    registry: MembershipRegistry,
    coordinator: CoordinatorState,
    dispatcher: Arc<Dispatcher>,
    tasks: JoinSet<()>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.info.id
    }

    /// Address peers and clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.info.addr()
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.info.id,
            coordinator_id: self.coordinator.current(),
            is_coordinator: self.coordinator.is_coordinator(),
            peers: self.registry.peers(),
        }
    }

    /// Watches coordinator changes on this node.
    pub fn subscribe_coordinator(&self) -> watch::Receiver<Option<NodeId>> {
        self.coordinator.subscribe()
    }

    /// Runs one election round from this node.
    pub async fn start_election(&self) -> ElectionOutcome {
        self.dispatcher.election.start_election().await
    }

    /// Executes a statement as if it had arrived from a client.
    pub async fn query(&self, sql: &str) -> Message {
        self.dispatcher.handle_client_query(sql).await
    }

    /// Aborts every task and waits for them to finish unwinding.
    ///
    /// Connection handlers go down with the accept loop that owns them, and
    /// replica sends still in flight are aborted. Sockets close as the tasks
    /// drop them; peers find out through heartbeat silence, never through a
    /// goodbye message.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
        self.dispatcher.replicator.abort_pending();
        info!(node = self.info.id, "node stopped");
    }
}

/// Starts a node and returns once all of its sockets are bound.
pub async fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    config.timing.validate()?;
    let timing = config.timing.clone();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind node listener {}", config.listen_addr))?;
    let port = listener.local_addr()?.port();
    let info = NodeInfo::new(config.id, SocketAddr::new(config.advertise_ip, port));

    let discovery_socket = bind_broadcast(config.discovery_bind).await?;
    let announce_socket = bind_broadcast(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;

    let storage = match &config.database {
        Some(path) => Storage::new(
            SqliteEngine::open(path).with_context(|| format!("failed to open database {}", path.display()))?,
        ),
        None => Storage::new(SqliteEngine::in_memory()?),
    };

    let registry = MembershipRegistry::new(info.clone());
    let liveness = LivenessTable::new();
    let coordinator = CoordinatorState::new(info.id);
    let transport = Transport::new(timing.rpc_timeout);

    let election = ElectionEngine::new(registry.clone(), coordinator.clone(), transport);
    let discovery = DiscoveryService::new(registry.clone(), config.discovery_targets.clone());
    let heartbeat = HeartbeatService::new(
        registry.clone(),
        liveness,
        coordinator.clone(),
        election.clone(),
        transport,
        timing.heartbeat_timeout,
    );
    let replicator = Replicator::new(registry.clone(), coordinator.clone(), transport);

    let dispatcher = Arc::new(Dispatcher {
        local_id: info.id,
        coordinator: coordinator.clone(),
        discovery: discovery.clone(),
        heartbeat: heartbeat.clone(),
        election: election.clone(),
        replicator,
        storage,
        read_timeout: timing.rpc_timeout,
    });

    let mut tasks = JoinSet::new();
    tasks.spawn(Arc::clone(&dispatcher).run(listener));
    tasks.spawn(discovery.clone().run_announcer(announce_socket, timing.discovery_interval));
    tasks.spawn(discovery.run_listener(discovery_socket));
    tasks.spawn(heartbeat.clone().run_sender(timing.heartbeat_interval));
    tasks.spawn(heartbeat.run_monitor(timing.monitor_interval));
    tasks.spawn(async move {
        tokio::time::sleep(timing.startup_election_delay).await;
        election.start_election().await;
    });

    info!(
        node = info.id,
        addr = %info.addr(),
        discovery = %config.discovery_bind,
        "node started"
    );

    Ok(NodeHandle {
        info,
        registry,
        coordinator,
        dispatcher,
        tasks,
    })
}
