//! # raft-core
//!
//! why: implement the raft consensus protocol and its client proxy as tick-driven state machines
//! relations: raft-storage provides the file output sink, raft-cluster runs nodes on threads
//! what: server and client state machines, rpc model and codec, topology, transport, config

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod topology;
pub mod transport;

pub use client::{Client, ClientStatus};
pub use clock::{Clock, Speed};
pub use config::{ClientConfig, ClusterConfig, RaftConfig};
pub use error::{RaftError, Result};
pub use log::{ApplySink, LogEntry, LogIndex, MemorySink, Term};
pub use message::{ControlKind, Payload, Query, Rpc, RpcType};
pub use node::{NodeState, RaftNode};
pub use topology::{Rank, Topology, CONSOLE_RANK};
pub use transport::{LocalEndpoint, LocalNetwork, Transport};
