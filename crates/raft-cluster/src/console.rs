//! # console
//!
//! why: let an operator drive servers and clients with short text commands
//! relations: sends control rpcs over a ChannelTransport; main.rs reads lines and prints outcomes
//! what: ConsoleCommand parser with rank validation, Console with send-and-wait dispatch

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use raft_core::{ControlKind, Payload, Rank, Rpc, Topology, Transport};
use tracing::debug;

use crate::transport::ChannelTransport;

/// A parsed console line. Ranks are already validated against the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    ProcessInformations,
    SetSpeed { rank: Rank, speed: String },
    StartClient { rank: Rank },
    CrashProcess { rank: Rank },
    RecoverProcess { rank: Rank },
    AddLogEntry { rank: Rank, entry: String },
    AddFilesEntries { rank: Rank, paths: Vec<String> },
    TimeoutServer { rank: Rank },
    StopProcess { rank: Rank },
    DisplayProcess { rank: Rank },
    StopAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RankKind {
    Process,
    Client,
    Server,
}

impl ConsoleCommand {
    /// Parse a whitespace separated command line.
    ///
    /// # Syntax
    /// - `help`, `process_informations`, `stop_all`
    /// - `set_speed <rank> <low|medium|high>`
    /// - `start_client <client_rank>`
    /// - `crash_process`, `recover_process`, `stop_process`, `display_process` `<rank>`
    /// - `add_log_entry <client_rank> <words...>`
    /// - `add_files_entries <client_rank> <path...>`
    /// - `timeout_server <server_rank>`
    pub fn parse(line: &str, topology: &Topology) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = parts.split_first() else {
            bail!("empty command");
        };

        let command = match (name, args.len()) {
            ("help", 0) => ConsoleCommand::Help,
            ("process_informations", 0) => ConsoleCommand::ProcessInformations,
            ("stop_all", 0) => ConsoleCommand::StopAll,
            ("set_speed", 2) => {
                let rank = parse_rank(args[0], RankKind::Process, topology)?;
                let speed = args[1];
                if !matches!(speed, "low" | "medium" | "high") {
                    bail!("invalid speed: {speed} (expected low, medium or high)");
                }
                ConsoleCommand::SetSpeed {
                    rank,
                    speed: speed.to_string(),
                }
            }
            ("start_client", 1) => ConsoleCommand::StartClient {
                rank: parse_rank(args[0], RankKind::Client, topology)?,
            },
            ("crash_process", 1) => ConsoleCommand::CrashProcess {
                rank: parse_rank(args[0], RankKind::Process, topology)?,
            },
            ("recover_process", 1) => ConsoleCommand::RecoverProcess {
                rank: parse_rank(args[0], RankKind::Process, topology)?,
            },
            ("add_log_entry", n) if n >= 2 => ConsoleCommand::AddLogEntry {
                rank: parse_rank(args[0], RankKind::Client, topology)?,
                entry: args[1..].join(" "),
            },
            ("add_files_entries", n) if n >= 2 => ConsoleCommand::AddFilesEntries {
                rank: parse_rank(args[0], RankKind::Client, topology)?,
                paths: args[1..].iter().map(|path| path.to_string()).collect(),
            },
            ("timeout_server", 1) => ConsoleCommand::TimeoutServer {
                rank: parse_rank(args[0], RankKind::Server, topology)?,
            },
            ("stop_process", 1) => ConsoleCommand::StopProcess {
                rank: parse_rank(args[0], RankKind::Process, topology)?,
            },
            ("display_process", 1) => ConsoleCommand::DisplayProcess {
                rank: parse_rank(args[0], RankKind::Process, topology)?,
            },
            (
                "help" | "process_informations" | "stop_all" | "set_speed" | "start_client"
                | "crash_process" | "recover_process" | "add_log_entry" | "add_files_entries"
                | "timeout_server" | "stop_process" | "display_process",
                _,
            ) => bail!("invalid number of arguments for {name}, type help for usage"),
            _ => bail!("command not found: {name}"),
        };
        Ok(command)
    }

    /// Control messages this command sends, in order.
    pub fn messages(&self, topology: &Topology) -> Vec<(Rank, ControlKind, String)> {
        match self {
            ConsoleCommand::Help | ConsoleCommand::ProcessInformations => Vec::new(),
            ConsoleCommand::SetSpeed { rank, speed } => {
                vec![(*rank, ControlKind::ProcessSetSpeed, speed.clone())]
            }
            ConsoleCommand::StartClient { rank } => {
                vec![(*rank, ControlKind::ProcessStart, String::new())]
            }
            ConsoleCommand::CrashProcess { rank } => {
                vec![(*rank, ControlKind::ProcessCrash, String::new())]
            }
            ConsoleCommand::RecoverProcess { rank } => {
                vec![(*rank, ControlKind::ProcessRecover, String::new())]
            }
            ConsoleCommand::AddLogEntry { rank, entry } => {
                vec![(*rank, ControlKind::ClientCreateNewEntry, entry.clone())]
            }
            ConsoleCommand::AddFilesEntries { rank, paths } => paths
                .iter()
                .map(|path| (*rank, ControlKind::ClientNewFileEntry, path.clone()))
                .collect(),
            ConsoleCommand::TimeoutServer { rank } => {
                vec![(*rank, ControlKind::ServerTimeout, String::new())]
            }
            ConsoleCommand::StopProcess { rank } => {
                vec![(*rank, ControlKind::ProcessStop, String::new())]
            }
            ConsoleCommand::DisplayProcess { rank } => {
                vec![(*rank, ControlKind::ProcessDisplay, String::new())]
            }
            ConsoleCommand::StopAll => (1..topology.endpoint_count())
                .map(|rank| (rank, ControlKind::ProcessStop, String::new()))
                .collect(),
        }
    }
}

fn parse_rank(raw: &str, kind: RankKind, topology: &Topology) -> Result<Rank> {
    let rank: Rank = raw
        .parse()
        .map_err(|_| anyhow!("invalid rank: {raw}"))?;
    let valid = match kind {
        RankKind::Process => topology.is_process(rank),
        RankKind::Client => topology.is_client(rank),
        RankKind::Server => topology.is_server(rank),
    };
    if !valid {
        match kind {
            RankKind::Process => bail!("invalid rank: {rank}"),
            RankKind::Client => bail!("invalid rank: {rank} (this must be the rank of a client)"),
            RankKind::Server => bail!("invalid rank: {rank} (this must be a server rank)"),
        }
    }
    Ok(rank)
}

/// Result of one control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack(bool),
    TimedOut,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ack(true) => write!(f, "command has been successfully executed"),
            Outcome::Ack(false) => write!(f, "command was refused"),
            Outcome::TimedOut => write!(f, "no response, please try again"),
        }
    }
}

/// Operator endpoint at rank 0.
pub struct Console {
    transport: ChannelTransport,
    topology: Topology,
    timeout: Duration,
}

impl Console {
    pub fn new(transport: ChannelTransport, topology: Topology, timeout: Duration) -> Self {
        Self {
            transport,
            topology,
            timeout,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn parse(&self, line: &str) -> Result<ConsoleCommand> {
        ConsoleCommand::parse(line, &self.topology)
    }

    /// Send every control message of `command`, waiting for each reply in turn.
    pub fn execute(&mut self, command: &ConsoleCommand) -> Vec<(Rank, Outcome)> {
        command
            .messages(&self.topology)
            .into_iter()
            .map(|(rank, kind, content)| (rank, self.send_and_wait(rank, kind, &content)))
            .collect()
    }

    /// Send one control message and wait for `rank` to answer it.
    pub fn send_and_wait(&mut self, rank: Rank, kind: ControlKind, content: &str) -> Outcome {
        // replies that arrived after an earlier timeout would be mistaken for this one
        for stale in self.transport.drain() {
            debug!(source = stale.source, rpc = %stale.rpc_type(), "discarding late reply");
        }

        self.transport.send(rank, &Rpc::control(kind, content));
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Outcome::TimedOut;
            }
            let Some(query) = self.transport.receive_timeout(remaining) else {
                return Outcome::TimedOut;
            };
            match query.payload() {
                Payload::MessageResponse(response) if query.source == rank => {
                    return Outcome::Ack(response.success);
                }
                _ => debug!(source = query.source, rpc = %query.rpc_type(), "ignoring unrelated rpc"),
            }
        }
    }
}

pub fn help_text() -> &'static str {
    "\
commands:
  help                                    show this text
  process_informations                    show the rank ranges of every process
  set_speed <rank> <low|medium|high>      change the delay between two ticks (500ms, 250ms, 0ms)
  start_client <client_rank>              start a client, clients begin dead
  crash_process <rank>                    crash a process, it only answers the console until recovered
  recover_process <rank>                  recover a crashed process
  add_log_entry <client_rank> <entry...>  queue an entry on a client
  add_files_entries <client_rank> <path...>
                                          queue every line of each file on a client
  timeout_server <server_rank>            force a follower to start an election
  stop_process <rank>                     stop a process for good
  display_process <rank>                  log the state of a process
  stop_all                                stop every process and exit"
}

pub fn process_informations(topology: &Topology) -> String {
    let mut text = format!(
        "console rank is {} (this is the process you are typing into)\n",
        topology.console()
    );
    if topology.clients() == 0 {
        text.push_str("there are no clients\n");
    } else {
        text.push_str(&format!("client ranks are 1 to {}\n", topology.clients()));
    }
    let servers = topology.server_ranks();
    text.push_str(&format!(
        "server ranks are {} to {}",
        servers.start(),
        servers.end()
    ));
    text
}
