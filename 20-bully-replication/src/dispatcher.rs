//! Inbound connection handling.
//!
//! Each accepted connection carries exactly one message and is handled on its
//! own task, so a slow handler never blocks the accept loop. Replies, where a
//! kind defines one, are written back on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::coordinator::CoordinatorState;
use crate::discovery::DiscoveryService;
use crate::election::ElectionEngine;
use crate::heartbeat::HeartbeatService;
use crate::message::{Message, NodeId, QueryOutcome, read_message, write_message};
use crate::replication::Replicator;
use crate::storage::{StatementKind, Storage};

/// Everything a connection handler may touch.
pub struct Dispatcher {
    pub(crate) local_id: NodeId,
    pub(crate) coordinator: CoordinatorState,
    pub(crate) discovery: DiscoveryService,
    pub(crate) heartbeat: HeartbeatService,
    pub(crate) election: ElectionEngine,
    pub(crate) replicator: Replicator,
    pub(crate) storage: Storage,
    /// Bound on reading the single inbound message.
    pub(crate) read_timeout: Duration,
}

impl Dispatcher {
    /// Accepts connections until the task running this is aborted.
    ///
    /// Handlers live in a set owned by this future, so aborting the accept
    /// loop aborts every in-flight handler with it.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut handlers = JoinSet::new();
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => spawn_connection_handler(&mut handlers, stream, peer, &self),
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
            while handlers.try_join_next().is_some() {}
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let message = match timeout(self.read_timeout, read_message::<_, Message>(&mut reader)).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(err)) => {
                debug!(error = %err, "dropping undecodable message");
                return Ok(());
            }
            Err(_) => {
                debug!("connection idle past read timeout, dropping");
                return Ok(());
            }
        };

        match message {
            Message::Heartbeat { from } => self.heartbeat.record(from),
            Message::Election { from } => {
                write_message(&mut writer, &Message::ElectionAck { ok: true }).await?;
                writer.shutdown().await?;
                drop(writer);
                debug!(node = self.local_id, challenger = from, "answered election challenge");
                self.election.start_election().await;
            }
            Message::Coordinator { id } => self.election.accept_coordinator(id),
            Message::Replica { sql, checksum } => {
                self.replicator.apply(&self.storage, &sql, &checksum).await;
            }
            Message::ClientQuery { sql } => {
                let reply = self.handle_client_query(&sql).await;
                write_message(&mut writer, &reply).await?;
            }
            Message::Discovery(info) => {
                self.discovery.absorb(info);
                let reply = Message::DiscoveryReply(self.discovery.local_info().clone());
                write_message(&mut writer, &reply).await?;
            }
            Message::DiscoveryRequest => {
                let reply = Message::DiscoveryReply(self.discovery.local_info().clone());
                write_message(&mut writer, &reply).await?;
            }
            other => debug!(kind = other.kind(), "ignoring unexpected message"),
        }
        Ok(())
    }

    /// Executes a client statement on this node.
    ///
    /// A coordinator replicates writes between execute and commit. Any other
    /// node executes the statement locally without forwarding it. An execution
    /// failure is rolled back and reported to the client.
    pub async fn handle_client_query(&self, sql: &str) -> Message {
        let kind = StatementKind::classify(sql);
        let replicate = kind == StatementKind::Write && self.coordinator.is_coordinator();

        let result = {
            let mut session = self.storage.session().await;
            session.transaction(sql, |_| {
                if replicate {
                    let followers = self.replicator.replicate(sql);
                    debug!(node = self.local_id, followers, "write replicated");
                }
            })
        };

        let result = match result {
            Ok(_) if replicate => QueryOutcome::Commit,
            Ok(output) => output.into(),
            Err(err) => {
                warn!(node = self.local_id, error = %err, "statement failed, rolled back");
                QueryOutcome::Error {
                    message: err.to_string(),
                }
            }
        };
        if matches!(result, QueryOutcome::Commit) {
            info!(node = self.local_id, "write committed");
        }

        Message::ClientResult {
            result,
            node: self.local_id,
        }
    }
}

fn spawn_connection_handler(
    handlers: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Arc<Dispatcher>,
) {
    let dispatcher = Arc::clone(dispatcher);
    handlers.spawn(async move {
        if let Err(err) = dispatcher.handle_connection(stream).await {
            debug!(%peer, error = ?err, "connection closed with error");
        }
    });
}
