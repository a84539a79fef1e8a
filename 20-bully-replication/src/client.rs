//! Interactive SQL console.
//!
//! The client finds nodes by broadcasting a `DiscoveryRequest` and collecting
//! the `DiscoveryReply` datagrams that arrive within the wait window. Each
//! statement then goes over a fresh stream connection to the node with the
//! highest id, which under the bully rule is the coordinator, unless the user
//! picked another node with `USE`.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cli::ClientArgs;
use crate::discovery::bind_broadcast;
use crate::message::{Message, NodeId, NodeInfo, QueryOutcome, decode_datagram, encode_datagram};
use crate::protocol::{ConsoleCommand, HELP};
use crate::transport::Transport;

/// Asks every target who is out there and gathers replies until `wait`
/// elapses. Duplicate replies collapse by id; the result is ordered by id.
pub async fn discover_nodes(targets: &[SocketAddr], wait: Duration) -> Result<Vec<NodeInfo>> {
    let socket = bind_broadcast(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
    let request = encode_datagram(&Message::DiscoveryRequest)?;
    for target in targets {
        if let Err(err) = socket.send_to(&request, *target).await {
            warn!(%target, error = %err, "discovery request not sent");
        }
    }

    let deadline = Instant::now() + wait;
    let mut found = BTreeMap::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let Ok(received) = received else {
            break;
        };
        let (len, src) = match received {
            Ok(received) => received,
            Err(err) => {
                debug!(error = %err, "discovery receive failed");
                continue;
            }
        };
        match decode_datagram(&buf[..len]) {
            Ok(Message::DiscoveryReply(info)) => {
                found.insert(info.id, info);
            }
            Ok(other) => debug!(%src, kind = other.kind(), "ignoring datagram"),
            Err(err) => debug!(%src, error = %err, "dropping malformed datagram"),
        }
    }
    Ok(found.into_values().collect())
}

/// The node a statement should go to when none was chosen explicitly.
pub fn pick_coordinator(nodes: &[NodeInfo]) -> Option<&NodeInfo> {
    nodes.iter().max_by_key(|node| node.id)
}

/// Sends one statement and waits for the node's result.
pub async fn send_query(addr: SocketAddr, sql: &str, timeout: Duration) -> Result<(QueryOutcome, NodeId)> {
    let request = Message::ClientQuery { sql: sql.to_string() };
    match Transport::new(timeout).request(addr, &request).await? {
        Some(Message::ClientResult { result, node }) => Ok((result, node)),
        Some(other) => bail!("unexpected {} reply from {addr}", other.kind()),
        None => bail!("{addr} closed the connection without a result"),
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let wait = Duration::from_millis(args.timeout_ms);
    let mut console = Console {
        nodes: Vec::new(),
        selected: args.node,
        targets: vec![args.discovery_target()],
        timeout: wait,
    };
    if console.selected.is_none() {
        console.refresh().await?;
    }
    write_stdout("type HELP for commands").await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        prompt().await?;
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let command = match ConsoleCommand::parse(&input) {
                    Ok(command) => command,
                    Err(_) if input.trim().is_empty() => continue,
                    Err(err) => {
                        write_stderr(&format!("!!! {err}")).await?;
                        continue;
                    }
                };
                if !console.handle(command).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

struct Console {
    nodes: Vec<NodeInfo>,
    /// Explicit target; `None` means the highest discovered id.
    selected: Option<SocketAddr>,
    targets: Vec<SocketAddr>,
    timeout: Duration,
}

impl Console {
    async fn refresh(&mut self) -> Result<()> {
        self.nodes = discover_nodes(&self.targets, self.timeout).await?;
        if self.nodes.is_empty() {
            write_stdout("*** no nodes answered discovery").await?;
        } else {
            write_stdout(&format!("*** discovered {} node(s)", self.nodes.len())).await?;
        }
        Ok(())
    }

    /// Returns `false` when the console should close.
    async fn handle(&mut self, command: ConsoleCommand) -> Result<bool> {
        match command {
            ConsoleCommand::Exit => return Ok(false),
            ConsoleCommand::Help => write_stdout(HELP).await?,
            ConsoleCommand::Nodes => {
                self.refresh().await?;
                let coordinator = pick_coordinator(&self.nodes).map(|node| node.id);
                for node in &self.nodes {
                    let marker = if Some(node.id) == coordinator { " (coordinator)" } else { "" };
                    write_stdout(&format!("  {} {}{marker}", node.id, node.addr())).await?;
                }
            }
            ConsoleCommand::Use { id } => match self.nodes.iter().find(|node| node.id == id) {
                Some(node) => {
                    self.selected = Some(node.addr());
                    write_stdout(&format!("*** using node {id} at {}", node.addr())).await?;
                }
                None => write_stderr(&format!("!!! node {id} is unknown, try NODES")).await?,
            },
            ConsoleCommand::Sql(sql) => {
                let addr = match self.target().await {
                    Ok(addr) => addr,
                    Err(err) => {
                        write_stderr(&format!("!!! {err}")).await?;
                        return Ok(true);
                    }
                };
                match send_query(addr, &sql, self.timeout).await {
                    Ok((outcome, node)) => write_stdout(&render_outcome(&outcome, node)).await?,
                    Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
                }
            }
        }
        Ok(true)
    }

    async fn target(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.selected {
            return Ok(addr);
        }
        if self.nodes.is_empty() {
            self.refresh().await?;
        }
        pick_coordinator(&self.nodes)
            .map(NodeInfo::addr)
            .ok_or_else(|| anyhow!("no nodes available"))
    }
}

/// Formats a result for the terminal, one row per line.
pub fn render_outcome(outcome: &QueryOutcome, node: NodeId) -> String {
    match outcome {
        QueryOutcome::Rows { columns, rows } => {
            let mut out = columns.join(" | ");
            for row in rows {
                let cells: Vec<String> = row.iter().map(render_value).collect();
                out.push('\n');
                out.push_str(&cells.join(" | "));
            }
            out.push_str(&format!("\n({} row(s) from node {node})", rows.len()));
            out
        }
        QueryOutcome::Ok { affected } => format!("OK, {affected} row(s) affected on node {node}"),
        QueryOutcome::Commit => format!("COMMIT on coordinator {node}"),
        QueryOutcome::Error { message } => format!("ERROR from node {node}: {message}"),
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

async fn prompt() -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"sql> ").await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(id: NodeId, port: u16) -> NodeInfo {
        NodeInfo::new(id, ([127, 0, 0, 1], port).into())
    }

    #[test]
    fn highest_id_is_picked() {
        let nodes = vec![info(1, 1), info(7, 7), info(3, 3)];
        assert_eq!(pick_coordinator(&nodes), Some(&info(7, 7)));
        assert_eq!(pick_coordinator(&[]), None);
    }

    #[test]
    fn rows_render_one_per_line() {
        let outcome = QueryOutcome::Rows {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![json!(1), json!("ada")], vec![json!(2), json!(null)]],
        };
        assert_eq!(
            render_outcome(&outcome, 3),
            "id | name\n1 | ada\n2 | NULL\n(2 row(s) from node 3)"
        );
        assert_eq!(render_outcome(&QueryOutcome::Commit, 3), "COMMIT on coordinator 3");
    }

    #[tokio::test]
    async fn discovery_collects_replies_until_the_window_closes() -> Result<()> {
        let responder = bind_broadcast("127.0.0.1:0".parse()?).await?;
        let target = responder.local_addr()?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, src)) = responder.recv_from(&mut buf).await {
                if let Ok(Message::DiscoveryRequest) = decode_datagram(&buf[..len]) {
                    for id in [2, 1, 2] {
                        let reply = encode_datagram(&Message::DiscoveryReply(info(id, 5000 + id as u16)))
                            .expect("encode");
                        let _ = responder.send_to(&reply, src).await;
                    }
                }
            }
        });

        let nodes = discover_nodes(&[target], Duration::from_millis(300)).await?;
        assert_eq!(nodes, vec![info(1, 5001), info(2, 5002)]);
        Ok(())
    }

    #[tokio::test]
    async fn discovery_with_nobody_listening_is_empty() -> Result<()> {
        let closed = bind_broadcast("127.0.0.1:0".parse()?).await?.local_addr()?;
        let nodes = discover_nodes(&[closed], Duration::from_millis(100)).await?;
        assert!(nodes.is_empty());
        Ok(())
    }
}
