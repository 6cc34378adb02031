//! # client
//!
//! why: feed operator commands into the cluster through whichever server currently leads
//! relations: speaks the rpc model from message.rs over a Transport; servers answer it from node.rs
//! what: ClientStatus, Client proxy with leader discovery, one-in-flight forwarding and ack timeouts

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::clock::{self, Clock, Speed};
use crate::config::ClientConfig;
use crate::error::{RaftError, Result};
use crate::message::{ControlKind, ControlMessage, Payload, Query, Rpc};
use crate::topology::{Rank, Topology};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStatus {
    Running,
    #[default]
    Dead,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStatus::Running => write!(f, "RUNNING"),
            ClientStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// Queues commands and forwards them, one at a time, to the current leader.
///
/// A command stays at the front of the queue until a leader acknowledges it,
/// so a lost leader or a dropped response only causes a resend. Every resend
/// of the front command reuses its sequence number and only a response
/// carrying that number pops it.
pub struct Client {
    rank: Rank,
    topology: Topology,
    config: ClientConfig,

    status: ClientStatus,
    has_started: bool,
    stopped: bool,
    speed: Speed,

    leader: Option<Rank>,
    leader_clock: Clock,
    entry_clock: Clock,
    queue: VecDeque<String>,
    in_flight: bool,
    /// Sequence number of the command at the front of the queue
    sequence: u64,
}

impl Client {
    /// A client starts dead and waits for `PROCESS_START`.
    pub fn new(rank: Rank, topology: Topology, config: ClientConfig) -> Result<Self> {
        if !topology.is_client(rank) {
            return Err(RaftError::UnknownRank(rank));
        }
        Ok(Self {
            rank,
            topology,
            config,
            status: ClientStatus::Dead,
            has_started: false,
            stopped: false,
            speed: Speed::Medium,
            leader: None,
            leader_clock: Clock::start(),
            entry_clock: Clock::start(),
            queue: VecDeque::new(),
            in_flight: false,
            sequence: 0,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn leader(&self) -> Option<Rank> {
        self.leader
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Commands not yet acknowledged, front first.
    pub fn queued(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, command: impl Into<String>) {
        self.queue.push_back(command.into());
    }

    /// Queue every line of a command file. Returns how many were queued.
    pub fn load_commands(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let contents = fs::read_to_string(path.as_ref())?;
        let before = self.queue.len();
        self.queue.extend(contents.lines().map(str::to_string));
        let added = self.queue.len() - before;
        debug!(rank = self.rank, path = %path.as_ref().display(), added, "loaded commands");
        Ok(added)
    }

    /// Run ticks until a stop control message arrives.
    pub fn run<T: Transport>(&mut self, transport: &mut T) {
        info!(rank = self.rank, queued = self.queue.len(), "client started");
        while !self.stopped {
            clock::wait(self.speed.delay().max(self.config.min_tick()));
            self.tick(transport);
        }
        info!(rank = self.rank, "client stopped");
    }

    pub fn tick<T: Transport>(&mut self, transport: &mut T) {
        if self.stopped {
            return;
        }

        for query in transport.drain() {
            self.handle_query(&query, transport);
        }

        if self.status == ClientStatus::Dead {
            return;
        }

        match self.leader {
            None => {
                if self.leader_clock.exceeded(self.config.timeout()) {
                    debug!(rank = self.rank, "searching for leader");
                    transport.broadcast(self.topology.server_ranks(), &Rpc::search_leader(0));
                    self.leader_clock.reset();
                }
            }
            Some(leader) => {
                if !self.in_flight {
                    if let Some(command) = self.queue.front() {
                        debug!(rank = self.rank, leader, sequence = self.sequence, command = %command, "forwarding entry");
                        transport.send(leader, &Rpc::new_log_entry(self.sequence, command.as_str()));
                        self.in_flight = true;
                        self.entry_clock.reset();
                    }
                }
            }
        }

        if self.in_flight
            && !self.queue.is_empty()
            && self.entry_clock.exceeded(self.config.timeout())
        {
            debug!(rank = self.rank, leader = ?self.leader, "entry not acknowledged in time");
            self.in_flight = false;
            self.forget_leader();
        }
    }

    fn forget_leader(&mut self) {
        if self.leader.take().is_some() {
            self.leader_clock.reset();
            self.entry_clock.reset();
        }
    }

    fn handle_query<T: Transport>(&mut self, query: &Query, transport: &mut T) {
        match query.payload() {
            Payload::Message(message) => {
                let success = self.handle_control(message);
                transport.send(query.source, &Rpc::control_response(success));
            }
            Payload::SearchLeaderResponse(response) => {
                if self.leader.is_none() {
                    info!(rank = self.rank, leader = response.leader_rank, "found leader");
                    self.leader = Some(response.leader_rank);
                    self.leader_clock.reset();
                    self.entry_clock.reset();
                }
            }
            Payload::NewLogEntryResponse(response) => {
                // duplicates of an earlier submission are answered too
                if !self.in_flight || response.sequence != self.sequence {
                    debug!(rank = self.rank, sequence = response.sequence, "ignoring stale entry response");
                    return;
                }
                if response.success {
                    if let Some(command) = self.queue.pop_front() {
                        debug!(rank = self.rank, sequence = self.sequence, command = %command, "entry acknowledged");
                    }
                    self.sequence += 1;
                } else {
                    debug!(rank = self.rank, leader = ?self.leader, "entry rejected, leader lost");
                    self.forget_leader();
                }
                self.in_flight = false;
                self.entry_clock.reset();
            }
            Payload::Heartbeat(_)
            | Payload::VoteRequest(_)
            | Payload::VoteResponse(_)
            | Payload::AppendEntries(_)
            | Payload::AppendEntriesResponse(_)
            | Payload::NewLogEntry(_)
            | Payload::SearchLeader(_)
            | Payload::MessageResponse(_) => {}
        }
    }

    fn handle_control(&mut self, message: &ControlMessage) -> bool {
        match message.kind {
            ControlKind::ClientCreateNewEntry => {
                self.enqueue(message.content.as_str());
                true
            }
            ControlKind::ClientNewFileEntry => match self.load_commands(&message.content) {
                Ok(_) => true,
                Err(err) => {
                    warn!(rank = self.rank, path = %message.content, error = %err, "cannot read command file");
                    false
                }
            },
            ControlKind::ProcessSetSpeed => {
                self.speed = Speed::from_name(&message.content);
                info!(rank = self.rank, speed = %self.speed, "speed changed");
                true
            }
            ControlKind::ProcessStart => {
                if self.has_started {
                    warn!(rank = self.rank, "client already started, use recover after a crash");
                    return false;
                }
                info!(rank = self.rank, "starting");
                self.has_started = true;
                self.status = ClientStatus::Running;
                self.leader = None;
                self.leader_clock.reset();
                self.entry_clock.reset();
                true
            }
            ControlKind::ProcessCrash => {
                if self.status != ClientStatus::Running {
                    warn!(rank = self.rank, "client is not running and cannot crash");
                    return false;
                }
                info!(rank = self.rank, "crashing");
                self.status = ClientStatus::Dead;
                self.in_flight = false;
                self.leader = None;
                self.leader_clock.reset();
                self.entry_clock.reset();
                true
            }
            ControlKind::ProcessRecover => {
                if self.status != ClientStatus::Dead {
                    warn!(rank = self.rank, "client is already running");
                    return false;
                }
                info!(rank = self.rank, "recovering");
                self.status = ClientStatus::Running;
                self.forget_leader();
                true
            }
            ControlKind::ProcessStop => {
                info!(rank = self.rank, "stop requested");
                self.stopped = true;
                self.status = ClientStatus::Dead;
                true
            }
            ControlKind::ProcessDisplay => {
                info!("{self}");
                true
            }
            ControlKind::ServerTimeout => {
                warn!(rank = self.rank, "clients cannot be timed out");
                false
            }
        }
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client {} is {} (speed {}, timeout {}ms, {} queued",
            self.rank,
            self.status,
            self.speed,
            self.config.timeout_ms,
            self.queue.len(),
        )?;
        match self.leader {
            Some(leader) => write!(f, ", leader {leader})"),
            None => write!(f, ", leader unknown)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RpcType;
    use crate::transport::{LocalEndpoint, LocalNetwork};
    use std::time::Duration;
    use tempfile::tempdir;

    // client 1, servers 2 and 3, console 0
    struct Fixture {
        network: LocalNetwork,
        client: Client,
        endpoint: LocalEndpoint,
    }

    impl Fixture {
        fn new() -> Self {
            let network = LocalNetwork::new();
            let topology = Topology::new(1, 2).unwrap();
            let config = ClientConfig {
                timeout_ms: 10,
                min_tick_ms: 1,
            };
            let client = Client::new(1, topology, config).unwrap();
            let endpoint = network.endpoint(1);
            Self {
                network,
                client,
                endpoint,
            }
        }

        fn started() -> Self {
            let mut fixture = Self::new();
            fixture.control(ControlKind::ProcessStart, "");
            fixture.inbox(0);
            fixture
        }

        fn deliver(&self, from: Rank, rpc: Rpc) {
            self.network.endpoint(from).send(1, &rpc);
        }

        fn control(&mut self, kind: ControlKind, content: &str) -> bool {
            self.deliver(0, Rpc::control(kind, content));
            self.tick();
            let replies = self.inbox(0);
            match replies.last().map(Query::payload) {
                Some(Payload::MessageResponse(response)) => response.success,
                other => panic!("expected MessageResponse, got {other:?}"),
            }
        }

        fn tick(&mut self) {
            self.client.tick(&mut self.endpoint);
        }

        fn inbox(&self, rank: Rank) -> Vec<Query> {
            self.network.endpoint(rank).drain()
        }
    }

    fn pause() {
        std::thread::sleep(Duration::from_millis(15));
    }

    #[test]
    fn new_client_is_dead_and_idle() {
        let mut fixture = Fixture::new();
        assert_eq!(fixture.client.status(), ClientStatus::Dead);
        assert!(!fixture.client.has_started());
        assert_eq!(fixture.client.speed(), Speed::Medium);

        pause();
        fixture.tick();
        assert_eq!(fixture.network.pending(2), 0);
    }

    #[test]
    fn rejects_server_rank() {
        let topology = Topology::new(1, 2).unwrap();
        let result = Client::new(2, topology, ClientConfig::default());
        assert!(matches!(result, Err(RaftError::UnknownRank(2))));
    }

    #[test]
    fn start_only_once() {
        let mut fixture = Fixture::new();
        assert!(fixture.control(ControlKind::ProcessStart, ""));
        assert_eq!(fixture.client.status(), ClientStatus::Running);
        assert!(!fixture.control(ControlKind::ProcessStart, ""));
    }

    #[test]
    fn searches_leader_after_timeout() {
        let mut fixture = Fixture::started();
        pause();
        fixture.tick();

        for server in [2, 3] {
            let inbox = fixture.inbox(server);
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].rpc_type(), RpcType::SearchLeader);
        }
        assert_eq!(fixture.network.pending(0), 0);
    }

    #[test]
    fn adopts_first_leader_only() {
        let mut fixture = Fixture::started();
        fixture.deliver(3, Rpc::search_leader_response(3));
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();
        assert_eq!(fixture.client.leader(), Some(3));
    }

    #[test]
    fn forwards_front_entry_to_leader() {
        let mut fixture = Fixture::started();
        fixture.control(ControlKind::ClientCreateNewEntry, "x");
        fixture.control(ControlKind::ClientCreateNewEntry, "y");
        fixture.inbox(2);
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();

        assert!(fixture.client.is_in_flight());
        let inbox = fixture.inbox(2);
        assert_eq!(inbox.len(), 1);
        match inbox[0].payload() {
            Payload::NewLogEntry(request) => assert_eq!(request.log_entry.command, "x"),
            other => panic!("expected NewLogEntry, got {other:?}"),
        }

        // nothing else is sent while the entry is in flight
        fixture.tick();
        assert!(fixture.inbox(2).is_empty());
    }

    #[test]
    fn success_pops_and_sends_next() {
        let mut fixture = Fixture::started();
        fixture.client.enqueue("x");
        fixture.client.enqueue("y");
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();
        fixture.inbox(2);

        fixture.deliver(2, Rpc::new_log_entry_response(0, true));
        fixture.tick();

        assert_eq!(fixture.client.queued().collect::<Vec<_>>(), vec!["y"]);
        let inbox = fixture.inbox(2);
        assert!(matches!(
            inbox[0].payload(),
            Payload::NewLogEntry(r) if r.log_entry.command == "y" && r.sequence == 1
        ));
    }

    #[test]
    fn duplicate_acks_in_one_tick_pop_only_the_sent_entry() {
        let mut fixture = Fixture::started();
        for command in ["a", "b", "c"] {
            fixture.client.enqueue(command);
        }
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();
        fixture.inbox(2);

        // the leader appended "a" twice and acknowledges both copies
        fixture.deliver(2, Rpc::new_log_entry_response(0, true));
        fixture.deliver(2, Rpc::new_log_entry_response(0, true));
        fixture.tick();

        assert_eq!(fixture.client.queued().collect::<Vec<_>>(), vec!["b", "c"]);
        let inbox = fixture.inbox(2);
        assert_eq!(inbox.len(), 1);
        assert!(matches!(
            inbox[0].payload(),
            Payload::NewLogEntry(r) if r.log_entry.command == "b" && r.sequence == 1
        ));

        // a late copy arriving while "b" is in flight does not pop it
        fixture.deliver(2, Rpc::new_log_entry_response(0, true));
        fixture.tick();
        assert_eq!(fixture.client.queued().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(fixture.client.is_in_flight());
    }

    #[test]
    fn ack_with_nothing_in_flight_is_ignored() {
        let mut fixture = Fixture::started();
        fixture.client.enqueue("x");
        fixture.deliver(2, Rpc::new_log_entry_response(0, true));
        fixture.deliver(2, Rpc::new_log_entry_response(0, false));
        fixture.tick();

        assert_eq!(fixture.client.queue_len(), 1);
        assert!(!fixture.client.is_in_flight());
    }

    #[test]
    fn failure_keeps_entry_and_forgets_leader() {
        let mut fixture = Fixture::started();
        fixture.client.enqueue("x");
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();

        fixture.deliver(2, Rpc::new_log_entry_response(0, false));
        fixture.tick();

        assert_eq!(fixture.client.leader(), None);
        assert!(!fixture.client.is_in_flight());
        assert_eq!(fixture.client.queue_len(), 1);
    }

    #[test]
    fn ack_timeout_forgets_leader_and_retries() {
        let mut fixture = Fixture::started();
        fixture.client.enqueue("x");
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();
        fixture.inbox(2);

        pause();
        fixture.tick();
        assert_eq!(fixture.client.leader(), None);
        assert!(!fixture.client.is_in_flight());

        fixture.deliver(3, Rpc::search_leader_response(3));
        fixture.tick();
        let inbox = fixture.inbox(3);
        assert!(inbox.iter().any(|query| matches!(
            query.payload(),
            Payload::NewLogEntry(r) if r.log_entry.command == "x" && r.sequence == 0
        )));
    }

    #[test]
    fn crash_abandons_the_in_flight_entry() {
        let mut fixture = Fixture::started();
        fixture.client.enqueue("x");
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();
        assert!(fixture.client.is_in_flight());

        assert!(fixture.control(ControlKind::ProcessCrash, ""));
        assert!(!fixture.client.is_in_flight());
        assert!(fixture.control(ControlKind::ProcessRecover, ""));
        fixture.inbox(3);

        // the first leader found after recovery gets the entry right away
        fixture.deliver(3, Rpc::search_leader_response(3));
        fixture.tick();
        assert!(fixture.client.is_in_flight());
        assert_eq!(fixture.client.leader(), Some(3));
        assert!(fixture.inbox(3).iter().any(|query| matches!(
            query.payload(),
            Payload::NewLogEntry(r) if r.log_entry.command == "x"
        )));
    }

    #[test]
    fn crash_and_recover_preconditions() {
        let mut fixture = Fixture::new();
        assert!(!fixture.control(ControlKind::ProcessCrash, ""));

        fixture.control(ControlKind::ProcessStart, "");
        fixture.deliver(2, Rpc::search_leader_response(2));
        fixture.tick();
        assert!(fixture.control(ControlKind::ProcessCrash, ""));
        assert_eq!(fixture.client.leader(), None);
        assert!(!fixture.control(ControlKind::ProcessCrash, ""));
        assert!(fixture.control(ControlKind::ProcessRecover, ""));
        assert!(!fixture.control(ControlKind::ProcessRecover, ""));
    }

    #[test]
    fn dead_client_sends_nothing() {
        let mut fixture = Fixture::started();
        fixture.client.enqueue("x");
        fixture.control(ControlKind::ProcessCrash, "");
        pause();
        fixture.tick();
        assert_eq!(fixture.network.pending(2), 0);
        assert_eq!(fixture.network.pending(3), 0);
    }

    #[test]
    fn file_entries_are_queued_line_by_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.txt");
        fs::write(&path, "a\nb\nc\n").unwrap();

        let mut fixture = Fixture::new();
        assert!(fixture.control(ControlKind::ClientNewFileEntry, path.to_str().unwrap()));
        assert_eq!(fixture.client.queued().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let missing = dir.path().join("missing.txt");
        assert!(!fixture.control(ControlKind::ClientNewFileEntry, missing.to_str().unwrap()));
        assert_eq!(fixture.client.queue_len(), 3);
    }

    #[test]
    fn speed_stop_and_server_only_controls() {
        let mut fixture = Fixture::new();
        assert!(fixture.control(ControlKind::ProcessSetSpeed, "high"));
        assert_eq!(fixture.client.speed(), Speed::High);
        assert!(fixture.control(ControlKind::ProcessDisplay, ""));
        assert!(!fixture.control(ControlKind::ServerTimeout, ""));
        assert!(fixture.control(ControlKind::ProcessStop, ""));
        assert!(fixture.client.is_stopped());
    }

    #[test]
    fn display_mentions_status_and_leader() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.client.to_string(),
            "client 1 is DEAD (speed MEDIUM, timeout 10ms, 0 queued, leader unknown)"
        );
    }
}
