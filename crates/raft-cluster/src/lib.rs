//! # raft-cluster
//!
//! why: run a whole simulated cluster in one process, one thread per endpoint
//! relations: hosts raft-core servers and clients, writes output logs through raft-storage
//! what: crossbeam channel transport, thread runtime, operator console

pub mod console;
pub mod runtime;
pub mod transport;

pub use console::{Console, ConsoleCommand, Outcome};
pub use runtime::{spawn_cluster, ClusterHandle, ClusterOptions};
pub use transport::{ChannelNetwork, ChannelTransport};
