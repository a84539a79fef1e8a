//! Bully-elected coordinator with best-effort SQL replication.
//!
//! Nodes on one network find each other through datagram announcements and
//! watch each other with heartbeats. The highest live id is elected
//! coordinator using the bully algorithm. Clients send SQL to the coordinator,
//! which runs each write in a local transaction and fans it out to every
//! follower before committing. Followers verify a SHA-256 checksum and apply
//! what they receive. Delivery is fire-and-forget, so replicas may drift
//! apart.
//!
//! - [`cli`] and [`config`] turn flags and an optional JSON file into a
//!   [`config::NodeConfig`].
//! - [`runtime`] binds sockets, starts the node's tasks and hands back a
//!   [`runtime::NodeHandle`].
//! - [`message`] is the JSON wire format; [`transport`] is the one-shot
//!   stream exchange built on it.
//! - [`membership`] and [`coordinator`] hold the shared node state.
//! - [`discovery`], [`heartbeat`], [`election`] and [`replication`] run the
//!   protocol; [`dispatcher`] routes inbound connections to them.
//! - [`storage`] wraps the relational engine behind a transaction session.
//! - [`client`] and [`protocol`] implement the interactive SQL console.

pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod dispatcher;
pub mod election;
pub mod heartbeat;
pub mod membership;
pub mod message;
pub mod protocol;
pub mod replication;
pub mod runtime;
pub mod storage;
pub mod transport;
