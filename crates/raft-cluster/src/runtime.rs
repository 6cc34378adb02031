//! # runtime
//!
//! why: run every server and client of a topology on its own thread
//! relations: builds raft-core nodes with raft-storage sinks, wires them with transport.rs, hands rank 0 to the console
//! what: ClusterOptions, spawn_cluster, ClusterHandle for joining the process threads

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use raft_core::{Client, ClusterConfig, RaftError, RaftNode, Rank, Result, Topology};
use raft_storage::{client_commands_path, server_log_path, FileSink};
use tracing::{info, warn};

use crate::console::{Console, ConsoleCommand};
use crate::transport::{ChannelNetwork, ChannelTransport};

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub topology: Topology,
    pub config: ClusterConfig,
    /// Directory receiving `logs_server_<rank>.txt`
    pub log_dir: PathBuf,
    /// Directory holding `commands_client_<rank>.txt` seed files, if any
    pub commands_dir: Option<PathBuf>,
    pub console_timeout: Duration,
}

impl ClusterOptions {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            config: ClusterConfig::default(),
            log_dir: PathBuf::from("server_logs"),
            commands_dir: Some(PathBuf::from("client_commands")),
            console_timeout: Duration::from_millis(500),
        }
    }
}

/// A running cluster: the console endpoint plus one thread per process.
pub struct ClusterHandle {
    console: Console,
    threads: Vec<(Rank, JoinHandle<()>)>,
}

impl ClusterHandle {
    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    /// Processes whose run loop has not returned yet.
    pub fn running(&self) -> usize {
        self.threads
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Stop whatever is still running and wait for every thread.
    pub fn shutdown(mut self) {
        if self.running() > 0 {
            self.console.execute(&ConsoleCommand::StopAll);
        }
        self.join();
    }

    /// Wait for every process thread to return.
    pub fn join(self) {
        for (rank, handle) in self.threads {
            if handle.join().is_err() {
                warn!(rank, "process thread panicked");
            }
        }
    }
}

/// Spawn a thread per client and server and return the console side.
pub fn spawn_cluster(options: &ClusterOptions) -> Result<ClusterHandle> {
    let topology = options.topology;
    let mut network = ChannelNetwork::new(topology.endpoint_count());
    let mut threads = Vec::with_capacity(topology.endpoint_count() - 1);

    for rank in topology.server_ranks() {
        let mut transport = take_endpoint(&mut network, rank)?;
        let sink = FileSink::create_or_degraded(server_log_path(&options.log_dir, rank));
        let mut node = RaftNode::new(rank, topology, options.config.raft.clone(), sink)?;
        let handle = thread::Builder::new()
            .name(format!("server-{rank}"))
            .spawn(move || node.run(&mut transport))?;
        threads.push((rank, handle));
    }

    for rank in topology.client_ranks() {
        let mut transport = take_endpoint(&mut network, rank)?;
        let mut client = Client::new(rank, topology, options.config.client.clone())?;
        if let Some(dir) = &options.commands_dir {
            let path = client_commands_path(dir, rank);
            match client.load_commands(&path) {
                Ok(0) => warn!(rank, path = %path.display(), "client commands file is empty"),
                Ok(count) => info!(rank, count, "seeded client commands"),
                Err(err) => warn!(rank, path = %path.display(), error = %err, "unable to open client commands file"),
            }
        }
        let handle = thread::Builder::new()
            .name(format!("client-{rank}"))
            .spawn(move || client.run(&mut transport))?;
        threads.push((rank, handle));
    }

    let console = take_endpoint(&mut network, topology.console())?;
    info!(
        clients = topology.clients(),
        servers = topology.servers(),
        "cluster started"
    );

    Ok(ClusterHandle {
        console: Console::new(console, topology, options.console_timeout),
        threads,
    })
}

fn take_endpoint(network: &mut ChannelNetwork, rank: Rank) -> Result<ChannelTransport> {
    network
        .endpoint(rank)
        .ok_or(RaftError::UnknownRank(rank))
}
