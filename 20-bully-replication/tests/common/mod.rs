//! Cluster harness shared by the integration tests.
//!
//! Nodes run on loopback with fixed ports: node `i` listens on
//! `base_port + i` and receives discovery datagrams on
//! `base_port + 50 + i`. Every node announces to every discovery port, which
//! stands in for a broadcast address.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, bail};
use bully_replication::config::{NodeConfig, Timing};
use bully_replication::message::NodeId;
use bully_replication::runtime::{NodeHandle, spawn_node};
use tokio::time::{Instant, sleep};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Fast timing so a test cluster settles within a second or two.
pub fn fast_timing() -> Timing {
    Timing {
        discovery_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(1000),
        monitor_interval: Duration::from_millis(100),
        rpc_timeout: Duration::from_millis(500),
        startup_election_delay: Duration::from_millis(400),
    }
}

pub struct TestCluster {
    handles: Vec<Option<NodeHandle>>,
    discovery_ports: Vec<u16>,
}

impl TestCluster {
    /// Spawns nodes with ids `1..=n`.
    pub async fn spawn(n: usize, base_port: u16) -> Result<Self> {
        let discovery_ports: Vec<u16> = (1..=n as u16).map(|i| base_port + 50 + i).collect();
        let targets: Vec<SocketAddr> = discovery_ports
            .iter()
            .map(|port| SocketAddr::new(LOOPBACK, *port))
            .collect();

        let mut handles = Vec::new();
        for i in 1..=n {
            let handle = spawn_node(NodeConfig {
                id: i as NodeId,
                listen_addr: SocketAddr::new(LOOPBACK, base_port + i as u16),
                advertise_ip: LOOPBACK,
                discovery_bind: SocketAddr::new(LOOPBACK, discovery_ports[i - 1]),
                discovery_targets: targets.clone(),
                database: None,
                timing: fast_timing(),
            })
            .await?;
            handles.push(Some(handle));
        }

        Ok(Self {
            handles,
            discovery_ports,
        })
    }

    /// Handle for a 1-indexed node id. Panics if the node was killed.
    pub fn node(&self, id: NodeId) -> &NodeHandle {
        self.handles[id as usize - 1]
            .as_ref()
            .expect("node was killed")
    }

    pub fn discovery_targets(&self) -> Vec<SocketAddr> {
        self.discovery_ports
            .iter()
            .map(|port| SocketAddr::new(LOOPBACK, *port))
            .collect()
    }

    /// Stops one node abruptly.
    pub async fn kill(&mut self, id: NodeId) {
        if let Some(handle) = self.handles[id as usize - 1].take() {
            handle.shutdown().await;
        }
    }

    fn live(&self) -> impl Iterator<Item = &NodeHandle> {
        self.handles.iter().flatten()
    }

    /// Waits until every live node names `expected` as coordinator.
    pub async fn wait_for_coordinator(&self, expected: NodeId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.live().all(|node| node.status().coordinator_id == Some(expected)) {
                return Ok(());
            }
            if Instant::now() > deadline {
                let seen: Vec<_> = self
                    .live()
                    .map(|node| (node.id(), node.status().coordinator_id))
                    .collect();
                bail!("timeout waiting for coordinator {expected}, nodes report {seen:?}");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits until every live node knows every other live node.
    pub async fn wait_for_full_membership(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let live = self.live().count();
        loop {
            if self.live().all(|node| node.status().peers.len() == live - 1) {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for membership to converge");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn shutdown(self) {
        for handle in self.handles.into_iter().flatten() {
            handle.shutdown().await;
        }
    }
}

/// Polls `check` until it returns true.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("timeout waiting for {what}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}
