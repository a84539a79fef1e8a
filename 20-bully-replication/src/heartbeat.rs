//! Heartbeat-based failure detection.
//!
//! The sender pings every known peer on a fixed period. Receipt is recorded by
//! the dispatcher into the [`LivenessTable`]. The monitor scans that table on
//! its own shorter period and evicts peers that stayed silent past the
//! timeout. Evicting the current coordinator runs an election before the scan
//! moves on.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::coordinator::CoordinatorState;
use crate::election::{ElectionEngine, ElectionOutcome};
use crate::membership::{LivenessTable, MembershipRegistry};
use crate::message::{Message, NodeId};
use crate::transport::Transport;

/// What one monitor scan did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<NodeId>,
    pub elections: Vec<ElectionOutcome>,
}

#[derive(Clone)]
pub struct HeartbeatService {
    local_id: NodeId,
    registry: MembershipRegistry,
    liveness: LivenessTable,
    coordinator: CoordinatorState,
    election: ElectionEngine,
    transport: Transport,
    timeout: Duration,
}

impl HeartbeatService {
    pub fn new(
        registry: MembershipRegistry,
        liveness: LivenessTable,
        coordinator: CoordinatorState,
        election: ElectionEngine,
        transport: Transport,
        timeout: Duration,
    ) -> Self {
        Self {
            local_id: registry.local().id,
            registry,
            liveness,
            coordinator,
            election,
            transport,
            timeout,
        }
    }

    pub async fn run_sender(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.send_round().await;
        }
    }

    /// Pings every peer once. Failures are swallowed; only sustained silence
    /// evicts a peer.
    pub async fn send_round(&self) {
        let message = &Message::Heartbeat { from: self.local_id };
        let peers = self.registry.peers();
        join_all(peers.iter().map(|peer| async move {
            if let Err(err) = self.transport.send(peer.addr(), message).await {
                debug!(peer = peer.id, error = %err, "heartbeat not delivered");
            }
        }))
        .await;
    }

    pub fn record(&self, from: NodeId) {
        self.liveness.record(from, Instant::now());
    }

    pub async fn run_monitor(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep(Instant::now()).await;
        }
    }

    /// Evicts every peer silent for longer than the timeout as of `now`.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for id in self.liveness.take_expired(now, self.timeout) {
            self.registry.remove(id);
            info!(node = self.local_id, peer = id, "peer stopped responding, evicted");
            report.evicted.push(id);

            if self.coordinator.current() == Some(id) {
                report.elections.push(self.election.start_election().await);
            }
        }
        report
    }
}
