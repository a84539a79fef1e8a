//! Bully leader election.
//!
//! A round is planned from an immutable registry snapshot: every peer with a
//! higher id is challenged. If any of them acknowledges, this node stands down
//! and waits for a `Coordinator` announcement; otherwise it declares itself
//! coordinator and announces it to every known peer.
//!
//! Rounds are re-entrant. The heartbeat monitor and inbound challenges may run
//! several at once on the same node; only the final write to
//! [`CoordinatorState`] is synchronized, and a brief period with more than one
//! self-declared coordinator is tolerated until announcements settle.

use futures::future::join_all;
use tracing::{debug, info};

use crate::coordinator::CoordinatorState;
use crate::membership::MembershipRegistry;
use crate::message::{Message, NodeId, NodeInfo};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// No higher peer answered; this node is now coordinator.
    Elected,
    /// Higher peers answered and will finish the election.
    Deferred { responders: Vec<NodeId> },
}

/// The peers one election round must challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionRound {
    challengers: Vec<NodeInfo>,
}

impl ElectionRound {
    pub fn plan(local_id: NodeId, snapshot: &[NodeInfo]) -> Self {
        let challengers = snapshot
            .iter()
            .filter(|node| node.id > local_id)
            .cloned()
            .collect();
        Self { challengers }
    }

    pub fn challengers(&self) -> &[NodeInfo] {
        &self.challengers
    }

    /// Decides the round given the ids that acknowledged a challenge.
    ///
    /// Acknowledgements from ids that were not challenged are ignored.
    pub fn decide(&self, acknowledged: &[NodeId]) -> ElectionOutcome {
        let mut responders: Vec<NodeId> = acknowledged
            .iter()
            .copied()
            .filter(|id| self.challengers.iter().any(|node| node.id == *id))
            .collect();
        responders.sort_unstable();
        responders.dedup();

        if responders.is_empty() {
            ElectionOutcome::Elected
        } else {
            ElectionOutcome::Deferred { responders }
        }
    }
}

#[derive(Clone)]
pub struct ElectionEngine {
    local_id: NodeId,
    registry: MembershipRegistry,
    coordinator: CoordinatorState,
    transport: Transport,
}

impl ElectionEngine {
    pub fn new(registry: MembershipRegistry, coordinator: CoordinatorState, transport: Transport) -> Self {
        Self {
            local_id: registry.local().id,
            registry,
            coordinator,
            transport,
        }
    }

    /// Runs one election round to completion.
    pub async fn start_election(&self) -> ElectionOutcome {
        let round = ElectionRound::plan(self.local_id, &self.registry.snapshot());
        info!(
            node = self.local_id,
            challengers = round.challengers().len(),
            "starting election"
        );

        let replies = join_all(round.challengers().iter().map(|peer| self.challenge(peer))).await;
        let acknowledged: Vec<NodeId> = replies.into_iter().flatten().collect();

        let outcome = round.decide(&acknowledged);
        match &outcome {
            ElectionOutcome::Elected => {
                self.coordinator.set(self.local_id);
                self.announce_coordinator().await;
                info!(node = self.local_id, "elected coordinator");
            }
            ElectionOutcome::Deferred { responders } => {
                debug!(node = self.local_id, ?responders, "higher node alive, standing down");
            }
        }
        outcome
    }

    /// Tells every known peer that this node is coordinator.
    pub async fn announce_coordinator(&self) {
        let message = &Message::Coordinator { id: self.local_id };
        let peers = self.registry.peers();
        join_all(peers.iter().map(|peer| async move {
            if let Err(err) = self.transport.send(peer.addr(), message).await {
                debug!(peer = peer.id, error = %err, "coordinator announcement not delivered");
            }
        }))
        .await;
    }

    /// Applies a `Coordinator` announcement unconditionally.
    pub fn accept_coordinator(&self, id: NodeId) {
        let previous = self.coordinator.set(id);
        if previous != Some(id) {
            info!(node = self.local_id, coordinator = id, "coordinator changed");
        }
    }

    /// Returns the peer id if it acknowledged the challenge. Any ack counts:
    /// the peer answered, so it is alive and outranks this node.
    async fn challenge(&self, peer: &NodeInfo) -> Option<NodeId> {
        let request = Message::Election { from: self.local_id };
        match self.transport.request(peer.addr(), &request).await {
            Ok(Some(Message::ElectionAck { .. })) => Some(peer.id),
            Ok(reply) => {
                debug!(peer = peer.id, ?reply, "unexpected election reply");
                None
            }
            Err(err) => {
                debug!(peer = peer.id, error = %err, "election challenge unanswered");
                None
            }
        }
    }
}
