//! Statement replication from the coordinator to followers.
//!
//! Delivery is best-effort and at-most-once: the coordinator spawns one send
//! per follower and never waits for, retries, or collects acknowledgements.
//! Followers apply a replica only when its checksum matches the SQL text.
//! There is no ordering between replicas, so followers may diverge.

use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::coordinator::CoordinatorState;
use crate::membership::MembershipRegistry;
use crate::message::{Message, NodeId};
use crate::storage::{Storage, StorageError};
use crate::transport::Transport;

/// Lowercase hex SHA-256 of the statement text.
pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Result of handling one inbound replica.
#[derive(Debug)]
pub enum ReplicaOutcome {
    Applied,
    ChecksumMismatch,
    Failed(StorageError),
}

#[derive(Clone)]
pub struct Replicator {
    local_id: NodeId,
    registry: MembershipRegistry,
    coordinator: CoordinatorState,
    transport: Transport,
    /// In-flight replica sends, aborted together by [`Replicator::abort_pending`].
    sends: Arc<Mutex<JoinSet<()>>>,
}

impl Replicator {
    pub fn new(registry: MembershipRegistry, coordinator: CoordinatorState, transport: Transport) -> Self {
        Self {
            local_id: registry.local().id,
            registry,
            coordinator,
            transport,
            sends: Arc::default(),
        }
    }

    /// Fans a write out to every known follower and returns how many sends
    /// were started. Does nothing unless this node is coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn replicate(&self, sql: &str) -> usize {
        if !self.coordinator.is_coordinator() {
            debug!(node = self.local_id, "not coordinator, skipping replication");
            return 0;
        }

        let message = Message::Replica {
            sql: sql.to_string(),
            checksum: checksum(sql),
        };
        let followers = self.registry.peers();
        let mut sends = self.sends.lock().unwrap_or_else(PoisonError::into_inner);
        while sends.try_join_next().is_some() {}
        for follower in &followers {
            let transport = self.transport;
            let message = message.clone();
            let addr = follower.addr();
            let follower_id = follower.id;
            sends.spawn(async move {
                if let Err(err) = transport.send(addr, &message).await {
                    debug!(follower = follower_id, error = %err, "replica not delivered");
                }
            });
        }
        followers.len()
    }

    /// Aborts every replica send still in flight.
    pub fn abort_pending(&self) {
        self.sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }

    /// Verifies and applies a replica received from the coordinator.
    pub async fn apply(&self, storage: &Storage, sql: &str, expected: &str) -> ReplicaOutcome {
        if checksum(sql) != expected {
            warn!(node = self.local_id, "replica checksum mismatch, dropped");
            return ReplicaOutcome::ChecksumMismatch;
        }

        let mut session = storage.session().await;
        match session.transaction(sql, |_| {}) {
            Ok(_) => {
                info!(node = self.local_id, "replica applied");
                ReplicaOutcome::Applied
            }
            Err(err) => {
                warn!(node = self.local_id, error = %err, "replica failed to apply");
                ReplicaOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    use crate::message::{NodeInfo, read_message};
    use crate::storage::{QueryOutput, StorageEngine};

    /// Engine that records every call instead of executing anything.
    #[derive(Clone, Default)]
    struct RecordingEngine {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl RecordingEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl StorageEngine for RecordingEngine {
        fn execute(&mut self, sql: &str) -> Result<QueryOutput, StorageError> {
            self.calls.lock().expect("calls lock").push(format!("execute {sql}"));
            if self.fail {
                return Err(StorageError::Rejected(sql.to_string()));
            }
            Ok(QueryOutput::Affected(1))
        }

        fn commit(&mut self) -> Result<(), StorageError> {
            self.calls.lock().expect("calls lock").push("commit".into());
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), StorageError> {
            self.calls.lock().expect("calls lock").push("rollback".into());
            Ok(())
        }
    }

    fn replicator(local: NodeInfo) -> (Replicator, MembershipRegistry, CoordinatorState) {
        let registry = MembershipRegistry::new(local.clone());
        let coordinator = CoordinatorState::new(local.id);
        let replicator = Replicator::new(
            registry.clone(),
            coordinator.clone(),
            Transport::new(Duration::from_millis(500)),
        );
        (replicator, registry, coordinator)
    }

    fn local() -> NodeInfo {
        NodeInfo::new(1, ([127, 0, 0, 1], 1).into())
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(checksum("INSERT 1"), checksum("INSERT 2"));
    }

    #[tokio::test]
    async fn matching_replica_is_executed_and_committed() {
        let engine = RecordingEngine::default();
        let storage = Storage::new(engine.clone());
        let (replicator, _, _) = replicator(local());

        let sql = "INSERT INTO t VALUES (1)";
        let outcome = replicator.apply(&storage, sql, &checksum(sql)).await;
        assert!(matches!(outcome, ReplicaOutcome::Applied));
        assert_eq!(engine.calls(), vec![format!("execute {sql}"), "commit".to_string()]);
    }

    #[tokio::test]
    async fn mismatched_replica_never_reaches_storage() {
        let engine = RecordingEngine::default();
        let storage = Storage::new(engine.clone());
        let (replicator, _, _) = replicator(local());

        let outcome = replicator
            .apply(&storage, "DELETE FROM t", &checksum("DELETE FROM u"))
            .await;
        assert!(matches!(outcome, ReplicaOutcome::ChecksumMismatch));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn failing_replica_is_rolled_back() {
        let engine = RecordingEngine {
            fail: true,
            ..RecordingEngine::default()
        };
        let storage = Storage::new(engine.clone());
        let (replicator, _, _) = replicator(local());

        let sql = "INSERT INTO t VALUES (1)";
        let outcome = replicator.apply(&storage, sql, &checksum(sql)).await;
        assert!(matches!(outcome, ReplicaOutcome::Failed(_)));
        assert_eq!(engine.calls(), vec![format!("execute {sql}"), "rollback".to_string()]);
    }

    #[tokio::test]
    async fn follower_never_replicates() {
        let (replicator, registry, coordinator) = replicator(local());
        registry.upsert(NodeInfo::new(2, ([127, 0, 0, 1], 2).into()));
        assert_eq!(replicator.replicate("INSERT INTO t VALUES (1)"), 0);

        coordinator.set(2);
        assert_eq!(replicator.replicate("INSERT INTO t VALUES (1)"), 0);
    }

    #[tokio::test]
    async fn aborted_sends_never_connect() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let (replicator, registry, coordinator) = replicator(local());
        registry.upsert(NodeInfo::new(2, listener.local_addr()?));
        coordinator.set(1);

        // Sends are spawned but not polled until this task yields.
        assert_eq!(replicator.replicate("DELETE FROM t"), 1);
        replicator.abort_pending();

        let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(accepted.is_err(), "aborted replica still connected");
        Ok(())
    }

    #[tokio::test]
    async fn coordinator_sends_checksummed_replica() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let (replicator, registry, coordinator) = replicator(local());
        registry.upsert(NodeInfo::new(2, listener.local_addr()?));
        coordinator.set(1);

        let sql = "UPDATE t SET a = 2";
        assert_eq!(replicator.replicate(sql), 1);

        let (stream, _) = listener.accept().await?;
        let mut reader = BufReader::new(stream);
        let message = read_message::<_, Message>(&mut reader).await?;
        assert_eq!(
            message,
            Some(Message::Replica {
                sql: sql.to_string(),
                checksum: checksum(sql),
            })
        );
        Ok(())
    }
}
