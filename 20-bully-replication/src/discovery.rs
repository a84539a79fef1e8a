//! Peer discovery over a shared datagram channel.
//!
//! Every node periodically announces its [`NodeInfo`] to the discovery
//! targets (normally the broadcast address) and absorbs announcements from
//! others into the registry. There is no handshake: hearing an announcement
//! is enough for membership. Clients may also send a `DiscoveryRequest`,
//! which is answered directly with this node's identity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::membership::MembershipRegistry;
use crate::message::{Message, NodeInfo, decode_datagram, encode_datagram};

const MAX_DATAGRAM: usize = 4096;

/// Binds a UDP socket that may send to broadcast addresses.
pub async fn bind_broadcast(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind discovery socket {addr}"))?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;
    Ok(socket)
}

#[derive(Clone)]
pub struct DiscoveryService {
    registry: MembershipRegistry,
    targets: Arc<[SocketAddr]>,
}

impl DiscoveryService {
    pub fn new(registry: MembershipRegistry, targets: Vec<SocketAddr>) -> Self {
        Self {
            registry,
            targets: targets.into(),
        }
    }

    pub fn local_info(&self) -> &NodeInfo {
        self.registry.local()
    }

    pub async fn run_announcer(self, socket: UdpSocket, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.announce(&socket).await;
        }
    }

    /// Sends one announcement to every target. Send failures are ignored.
    pub async fn announce(&self, socket: &UdpSocket) {
        let bytes = match encode_datagram(&Message::Discovery(self.local_info().clone())) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "failed to encode announcement");
                return;
            }
        };
        for target in self.targets.iter() {
            if let Err(err) = socket.send_to(&bytes, *target).await {
                debug!(%target, error = %err, "announcement not sent");
            }
        }
    }

    pub async fn run_listener(self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    debug!(error = %err, "discovery receive failed");
                    continue;
                }
            };

            let Some(reply) = self.handle_datagram(&buf[..len]) else {
                continue;
            };
            match encode_datagram(&reply) {
                Ok(bytes) => {
                    if let Err(err) = socket.send_to(&bytes, src).await {
                        debug!(%src, error = %err, "discovery reply not sent");
                    }
                }
                Err(err) => debug!(error = %err, "failed to encode discovery reply"),
            }
        }
    }

    /// Absorbs one datagram and returns the reply to send back, if any.
    /// Malformed datagrams are dropped silently.
    pub fn handle_datagram(&self, bytes: &[u8]) -> Option<Message> {
        match decode_datagram(bytes) {
            Ok(Message::Discovery(info)) => {
                self.absorb(info);
                None
            }
            Ok(Message::DiscoveryRequest) => Some(Message::DiscoveryReply(self.local_info().clone())),
            Ok(other) => {
                debug!(kind = other.kind(), "ignoring datagram");
                None
            }
            Err(_) => None,
        }
    }

    /// Upserts an announced peer, logging only its first sighting.
    pub fn absorb(&self, info: NodeInfo) {
        if info.id == self.local_info().id {
            return;
        }
        let (id, addr) = (info.id, info.addr());
        if self.registry.upsert(info) {
            info!(node = self.local_info().id, peer = id, %addr, "discovered peer");
        }
    }
}
