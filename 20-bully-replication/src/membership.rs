//! Membership registry and liveness table.
//!
//! Both are shared by the discovery, heartbeat, election and dispatcher tasks.
//! Each is a mutex-guarded map behind an `Arc`; every method takes the lock
//! for one short, non-async critical section, so readers always observe a
//! consistent snapshot and no lock is ever held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{NodeId, NodeInfo};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Known peers keyed by id. Always contains the local node.
#[derive(Clone)]
pub struct MembershipRegistry {
    local: NodeInfo,
    nodes: Arc<Mutex<BTreeMap<NodeId, NodeInfo>>>,
}

impl MembershipRegistry {
    pub fn new(local: NodeInfo) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(local.id, local.clone());
        Self {
            local,
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    /// Inserts or overwrites a peer. Returns `true` on first sighting.
    ///
    /// Announcements carrying the local id are ignored.
    pub fn upsert(&self, info: NodeInfo) -> bool {
        if info.id == self.local.id {
            return false;
        }
        lock(&self.nodes).insert(info.id, info).is_none()
    }

    /// Removes a peer. The local node is never removed.
    pub fn remove(&self, id: NodeId) -> Option<NodeInfo> {
        if id == self.local.id {
            return None;
        }
        lock(&self.nodes).remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<NodeInfo> {
        lock(&self.nodes).get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        lock(&self.nodes).contains_key(&id)
    }

    /// Every known node including the local one, ordered by id.
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        lock(&self.nodes).values().cloned().collect()
    }

    /// Every known node except the local one, ordered by id.
    pub fn peers(&self) -> Vec<NodeInfo> {
        lock(&self.nodes)
            .values()
            .filter(|info| info.id != self.local.id)
            .cloned()
            .collect()
    }
}

/// Last heartbeat received from each peer.
///
/// A peer with no entry has not been heard from since this process started;
/// that is not a failure.
#[derive(Clone, Default)]
pub struct LivenessTable {
    last_seen: Arc<Mutex<HashMap<NodeId, Instant>>>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: NodeId, at: Instant) {
        lock(&self.last_seen).insert(id, at);
    }

    pub fn last_seen(&self, id: NodeId) -> Option<Instant> {
        lock(&self.last_seen).get(&id).copied()
    }

    pub fn remove(&self, id: NodeId) {
        lock(&self.last_seen).remove(&id);
    }

    /// Removes and returns every peer silent for strictly longer than
    /// `timeout` as of `now`, ordered by id.
    pub fn take_expired(&self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let mut last_seen = lock(&self.last_seen);
        let mut expired: Vec<NodeId> = last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            last_seen.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: NodeId, port: u16) -> NodeInfo {
        NodeInfo::new(id, ([127, 0, 0, 1], port).into())
    }

    #[test]
    fn registry_always_holds_local_node() {
        let registry = MembershipRegistry::new(info(1, 5001));
        assert_eq!(registry.snapshot(), vec![info(1, 5001)]);
        assert!(registry.peers().is_empty());

        assert!(registry.remove(1).is_none());
        assert!(registry.contains(1));
    }

    #[test]
    fn upsert_reports_first_sighting_only() {
        let registry = MembershipRegistry::new(info(1, 5001));
        assert!(registry.upsert(info(2, 5002)));
        assert!(!registry.upsert(info(2, 5002)));

        // A re-announcement overwrites the stored address.
        assert!(!registry.upsert(info(2, 6002)));
        assert_eq!(registry.get(2), Some(info(2, 6002)));
    }

    #[test]
    fn upsert_ignores_local_id() {
        let registry = MembershipRegistry::new(info(1, 5001));
        assert!(!registry.upsert(info(1, 9999)));
        assert_eq!(registry.get(1), Some(info(1, 5001)));
    }

    #[test]
    fn peers_exclude_local_and_are_ordered() {
        let registry = MembershipRegistry::new(info(2, 5002));
        registry.upsert(info(3, 5003));
        registry.upsert(info(1, 5001));

        let ids: Vec<NodeId> = registry.peers().iter().map(|peer| peer.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(registry.snapshot().len(), 3);

        assert_eq!(registry.remove(3), Some(info(3, 5003)));
        assert!(!registry.contains(3));
    }

    #[test]
    fn expiry_requires_silence_past_timeout() {
        let table = LivenessTable::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(6);
        table.record(2, start);
        table.record(3, start + Duration::from_secs(2));

        // Exactly at the deadline nobody is evicted.
        assert!(table.take_expired(start + timeout, timeout).is_empty());

        let expired = table.take_expired(start + timeout + Duration::from_millis(1), timeout);
        assert_eq!(expired, vec![2]);
        assert!(table.last_seen(2).is_none());
        assert!(table.last_seen(3).is_some());
    }

    #[test]
    fn refreshed_heartbeat_postpones_expiry() {
        let table = LivenessTable::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(6);
        table.record(2, start);
        table.record(2, start + Duration::from_secs(5));

        assert!(table.take_expired(start + Duration::from_secs(10), timeout).is_empty());
        assert_eq!(
            table.take_expired(start + Duration::from_secs(12), timeout),
            vec![2]
        );
    }
}
