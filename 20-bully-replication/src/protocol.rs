//! Client console command parsing.
//!
//! A handful of words are console meta-commands; every other non-empty line
//! is passed to the cluster verbatim as SQL.

use anyhow::{Result, anyhow};

use crate::message::NodeId;

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Exit,
    Help,
    /// List the nodes discovered so far.
    Nodes,
    /// Send subsequent statements to this node instead of the coordinator.
    Use { id: NodeId },
    Sql(String),
}

pub const HELP: &str = "\
commands:
  NODES        list discovered nodes
  USE <id>     send statements to node <id>
  HELP         show this message
  EXIT | QUIT  leave the console
anything else is sent to the cluster as SQL";

impl ConsoleCommand {
    /// Meta-commands are case-insensitive. SQL keeps its original text,
    /// minus surrounding whitespace and a trailing semicolon.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        match (parts[0].to_uppercase().as_str(), parts.len()) {
            ("EXIT" | "QUIT", 1) => Ok(ConsoleCommand::Exit),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("NODES", 1) => Ok(ConsoleCommand::Nodes),
            ("USE", 2) => {
                let id = parts[1]
                    .parse()
                    .map_err(|_| anyhow!("USE expects a numeric node id, got {:?}", parts[1]))?;
                Ok(ConsoleCommand::Use { id })
            }
            ("USE", _) => Err(anyhow!("USE requires exactly one argument: USE <id>")),
            _ => {
                let sql = trimmed.trim_end_matches(';').trim_end();
                if sql.is_empty() {
                    return Err(anyhow!("empty statement"));
                }
                Ok(ConsoleCommand::Sql(sql.to_string()))
            }
        }
    }
}
