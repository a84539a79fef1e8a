//! Wire messages exchanged between nodes and clients.
//!
//! Stream connections carry one newline-terminated JSON message per request,
//! optionally followed by one reply line. Datagrams carry a single JSON
//! message with no delimiter.

use std::io;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::storage::QueryOutput;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Election priority and registry key of a node.
pub type NodeId = u64;

/// Identity of one peer as announced over discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Stream address the peer accepts connections on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Discovery(NodeInfo),
    DiscoveryRequest,
    DiscoveryReply(NodeInfo),
    Heartbeat { from: NodeId },
    Election { from: NodeId },
    ElectionAck { ok: bool },
    Coordinator { id: NodeId },
    Replica { sql: String, checksum: String },
    ClientQuery { sql: String },
    ClientResult { result: QueryOutcome, node: NodeId },
}

impl Message {
    /// Short kind name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Discovery(_) => "discovery",
            Message::DiscoveryRequest => "discovery_request",
            Message::DiscoveryReply(_) => "discovery_reply",
            Message::Heartbeat { .. } => "heartbeat",
            Message::Election { .. } => "election",
            Message::ElectionAck { .. } => "election_ack",
            Message::Coordinator { .. } => "coordinator",
            Message::Replica { .. } => "replica",
            Message::ClientQuery { .. } => "client_query",
            Message::ClientResult { .. } => "client_result",
        }
    }
}

/// Client-visible result of a `ClientQuery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Ok {
        affected: usize,
    },
    /// A write accepted by the coordinator, executed, replicated and committed.
    Commit,
    Error {
        message: String,
    },
}

impl From<QueryOutput> for QueryOutcome {
    fn from(output: QueryOutput) -> Self {
        match output {
            QueryOutput::Rows { columns, rows } => QueryOutcome::Rows { columns, rows },
            QueryOutput::Affected(affected) => QueryOutcome::Ok { affected },
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode_datagram(message: &Message) -> io::Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(to_io_error)
}

pub fn decode_datagram(bytes: &[u8]) -> io::Result<Message> {
    serde_json::from_slice(bytes).map_err(to_io_error)
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
