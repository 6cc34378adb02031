//! # node
//!
//! why: define the raft server state machine and its tick-driven event loop
//! relations: uses message.rs for rpc types, log.rs for entries and the apply sink, transport.rs for i/o
//! what: NodeState enum, RaftNode with election, replication, commit tracking and control handling

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace, warn};

use crate::clock::{self, random_timeout, Clock, Speed};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::{
    entry_at, last_index, term_at, ApplySink, LogEntry, LogIndex, Term, NO_INDEX,
};
use crate::message::{
    AppendEntries, ControlKind, ControlMessage, Heartbeat, Payload, Query, Rpc, VoteRequest,
};
use crate::topology::{Rank, Topology};
use crate::transport::Transport;

/// The four roles a server can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Crashed - only answers control messages until recovered
    Dead,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "FOLLOWER"),
            NodeState::Candidate => write!(f, "CANDIDATE"),
            NodeState::Leader => write!(f, "LEADER"),
            NodeState::Dead => write!(f, "DEAD"),
        }
    }
}

/// A client entry appended by this leader and not yet acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    index: LogIndex,
    origin: Rank,
    sequence: u64,
}

/// A single consensus server.
///
/// All state is owned by the tick loop; other endpoints only see it through rpcs.
pub struct RaftNode {
    rank: Rank,
    topology: Topology,
    config: RaftConfig,

    pub(crate) state: NodeState,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<Rank>,
    pub(crate) votes_received: BTreeSet<Rank>,

    pub(crate) log: Vec<LogEntry>,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,

    // Leader bookkeeping, indexed by server slot
    pub(crate) next_index: Vec<LogIndex>,
    pub(crate) match_index: Vec<LogIndex>,
    pending: VecDeque<PendingEntry>,

    leader_hint: Option<Rank>,
    speed: Speed,
    stopped: bool,

    clock: Clock,
    election_timeout: Duration,
    rng: StdRng,
    sink: Box<dyn ApplySink + Send>,
}

impl RaftNode {
    /// Create a follower with an empty log. `rank` must be one of the topology's servers.
    pub fn new(
        rank: Rank,
        topology: Topology,
        config: RaftConfig,
        sink: impl ApplySink + Send + 'static,
    ) -> Result<Self> {
        if !topology.is_server(rank) {
            return Err(RaftError::UnknownRank(rank));
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos() as u64);
        let mut rng = StdRng::seed_from_u64(nanos ^ rank as u64);
        let election_timeout = random_timeout(
            &mut rng,
            config.election_timeout_min_ms,
            config.election_timeout_max_ms,
        );
        let servers = topology.servers();

        Ok(Self {
            rank,
            topology,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            votes_received: BTreeSet::new(),
            log: Vec::new(),
            commit_index: NO_INDEX,
            last_applied: NO_INDEX,
            next_index: vec![0; servers],
            match_index: vec![NO_INDEX; servers],
            pending: VecDeque::new(),
            leader_hint: None,
            speed: Speed::High,
            stopped: false,
            clock: Clock::start(),
            election_timeout,
            rng,
            sink: Box::new(sink),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<Rank> {
        self.voted_for
    }

    pub fn vote_count(&self) -> usize {
        self.votes_received.len()
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn next_index_of(&self, peer: Rank) -> Option<LogIndex> {
        self.topology
            .server_slot(peer)
            .map(|slot| self.next_index[slot])
    }

    pub fn match_index_of(&self, peer: Rank) -> Option<LogIndex> {
        self.topology
            .server_slot(peer)
            .map(|slot| self.match_index[slot])
    }

    /// Client entries appended by this leader and still waiting for commit.
    pub fn pending_entries(&self) -> usize {
        self.pending.len()
    }

    /// Last server seen acting as leader, ourselves included.
    pub fn leader_hint(&self) -> Option<Rank> {
        self.leader_hint
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn election_timeout(&self) -> Duration {
        self.election_timeout
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Run ticks until a stop control message arrives.
    pub fn run<T: Transport>(&mut self, transport: &mut T) {
        info!(rank = self.rank, "server started");
        while !self.stopped {
            clock::wait(self.speed.delay().max(self.config.min_tick()));
            self.tick(transport);
        }
        info!(rank = self.rank, "server stopped");
    }

    /// One iteration of the event loop: drain inbound rpcs, apply committed
    /// entries, dispatch, then run the routine of the current role.
    pub fn tick<T: Transport>(&mut self, transport: &mut T) {
        if self.stopped {
            return;
        }

        let queries = transport.drain();

        if self.state != NodeState::Dead {
            self.apply_committed(transport);
        }

        self.handle_queries(&queries, transport);

        match self.state {
            NodeState::Follower => {
                if self.clock.exceeded(self.election_timeout) {
                    self.start_election(transport);
                }
            }
            NodeState::Candidate => self.candidate_routine(&queries, transport),
            NodeState::Leader => self.leader_routine(&queries, transport),
            NodeState::Dead => {}
        }
    }

    // -- role transitions --

    /// Step down. The vote is only forgotten when the term moves forward, so
    /// a node never votes twice in one term.
    fn become_follower(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.state == NodeState::Leader {
            self.pending.clear();
            self.leader_hint = None;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.clock.reset();
    }

    fn start_election<T: Transport>(&mut self, transport: &mut T) {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.rank);
        self.votes_received = BTreeSet::from([self.rank]);
        self.leader_hint = None;
        self.election_timeout = random_timeout(
            &mut self.rng,
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        self.clock.reset();

        info!(
            rank = self.rank,
            term = self.current_term,
            timeout_ms = self.election_timeout.as_millis() as u64,
            "starting election"
        );

        let last_log_index = last_index(&self.log);
        let request = VoteRequest {
            candidate_rank: self.rank,
            last_log_index,
            last_log_term: term_at(&self.log, last_log_index),
        };
        transport.broadcast(
            self.topology.server_ranks(),
            &Rpc::vote_request(self.current_term, request),
        );
    }

    fn become_leader<T: Transport>(&mut self, transport: &mut T) {
        info!(
            rank = self.rank,
            term = self.current_term,
            votes = self.votes_received.len(),
            "became leader"
        );

        self.state = NodeState::Leader;
        self.leader_hint = Some(self.rank);
        self.votes_received.clear();
        self.pending.clear();

        let next = self.log.len() as LogIndex;
        self.next_index.iter_mut().for_each(|index| *index = next);
        self.match_index.iter_mut().for_each(|index| *index = NO_INDEX);

        self.replicate(transport);
        self.clock.reset();
    }

    fn crash(&mut self) {
        info!(rank = self.rank, state = %self.state, "crashing");
        self.state = NodeState::Dead;
        self.votes_received.clear();
        self.pending.clear();
        self.current_term = 0;
        self.voted_for = None;
        self.leader_hint = None;
        self.next_index.iter_mut().for_each(|index| *index = 0);
        self.match_index.iter_mut().for_each(|index| *index = NO_INDEX);
    }

    // -- routines --

    fn candidate_routine<T: Transport>(&mut self, queries: &[Query], transport: &mut T) {
        for query in queries {
            if let Payload::VoteResponse(response) = query.payload() {
                if response.vote_granted
                    && query.term() == self.current_term
                    && self.topology.is_server(query.source)
                {
                    self.votes_received.insert(query.source);
                }
            }
        }

        if self.votes_received.len() >= self.topology.majority() {
            self.become_leader(transport);
        } else if self.clock.exceeded(self.election_timeout) {
            debug!(
                rank = self.rank,
                term = self.current_term,
                votes = self.votes_received.len(),
                "election timed out without majority"
            );
            self.start_election(transport);
        }
    }

    fn leader_routine<T: Transport>(&mut self, queries: &[Query], transport: &mut T) {
        if self.clock.exceeded(self.config.heartbeat_interval()) {
            self.replicate(transport);
            self.clock.reset();
        }

        for query in queries {
            match query.payload() {
                Payload::NewLogEntry(request) => {
                    self.accept_client_entry(
                        query.source,
                        request.sequence,
                        &request.log_entry.command,
                    );
                }
                Payload::AppendEntriesResponse(response) if query.term() == self.current_term => {
                    self.handle_append_entries_response(
                        query.source,
                        response.success,
                        response.match_index,
                    );
                }
                _ => {}
            }
        }

        self.advance_commit_index();
    }

    /// Send every peer either the entries it is missing or a heartbeat.
    fn replicate<T: Transport>(&mut self, transport: &mut T) {
        let last = last_index(&self.log);

        for slot in 0..self.topology.servers() {
            let Some(peer) = self.topology.server_rank(slot) else {
                continue;
            };
            if peer == self.rank {
                continue;
            }

            let next = self.next_index[slot];
            let prev_log_index = next - 1;
            let prev_log_term = term_at(&self.log, prev_log_index);

            if last >= next {
                let entries = self.log[next as usize..].to_vec();
                trace!(rank = self.rank, peer, next, count = entries.len(), "append entries");
                let request = AppendEntries {
                    leader_rank: self.rank,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: self.commit_index,
                };
                transport.send(peer, &Rpc::append_entries(self.current_term, request));
            } else {
                trace!(rank = self.rank, peer, "heartbeat");
                let heartbeat = Heartbeat {
                    leader_rank: self.rank,
                    prev_log_index,
                    prev_log_term,
                    leader_commit: self.commit_index,
                };
                transport.send(peer, &Rpc::heartbeat(self.current_term, heartbeat));
            }
        }
    }

    fn accept_client_entry(&mut self, origin: Rank, sequence: u64, command: &str) {
        self.log.push(LogEntry::new(self.current_term, command));
        let index = last_index(&self.log);
        self.pending.push_back(PendingEntry {
            index,
            origin,
            sequence,
        });
        debug!(rank = self.rank, term = self.current_term, index, origin, sequence, "appended client entry");
    }

    fn handle_append_entries_response(&mut self, peer: Rank, success: bool, reported: LogIndex) {
        let Some(slot) = self.topology.server_slot(peer) else {
            return;
        };

        if success {
            let reported = reported.min(last_index(&self.log));
            if reported > self.match_index[slot] {
                self.match_index[slot] = reported;
            }
            self.next_index[slot] = self.match_index[slot] + 1;
        } else {
            self.next_index[slot] = (self.next_index[slot] - 1).max(0);
            debug!(
                rank = self.rank,
                peer,
                next = self.next_index[slot],
                "peer rejected entries, backing off"
            );
        }
    }

    /// Commit the highest index replicated on a majority, provided its entry
    /// belongs to the current term. Earlier entries commit with it.
    fn advance_commit_index(&mut self) {
        let mut candidate = last_index(&self.log);
        while candidate > self.commit_index {
            if term_at(&self.log, candidate) == self.current_term
                && self.replication_count(candidate) >= self.topology.majority()
            {
                debug!(
                    rank = self.rank,
                    from = self.commit_index,
                    to = candidate,
                    "advanced commit index"
                );
                self.commit_index = candidate;
                return;
            }
            candidate -= 1;
        }
    }

    /// Servers holding `index`, counting ourselves.
    fn replication_count(&self, index: LogIndex) -> usize {
        let peers = (0..self.topology.servers())
            .filter(|&slot| self.topology.server_rank(slot) != Some(self.rank))
            .filter(|&slot| self.match_index[slot] >= index)
            .count();
        peers + 1
    }

    fn apply_committed<T: Transport>(&mut self, transport: &mut T) {
        while self.commit_index > self.last_applied {
            let index = self.last_applied + 1;
            let Some(entry) = entry_at(&self.log, index).cloned() else {
                warn!(rank = self.rank, index, "committed index missing from log");
                break;
            };
            self.last_applied = index;

            if let Err(err) = self.sink.append(index, &entry) {
                warn!(rank = self.rank, index, error = %err, "failed to write output log");
            }

            if self.state == NodeState::Leader {
                self.acknowledge(index, transport);
            }
        }
    }

    fn acknowledge<T: Transport>(&mut self, index: LogIndex, transport: &mut T) {
        while let Some(front) = self.pending.front().copied() {
            if front.index > index {
                break;
            }
            self.pending.pop_front();
            if front.index == index {
                debug!(rank = self.rank, index, origin = front.origin, "acknowledging entry");
                transport.send(
                    front.origin,
                    &Rpc::new_log_entry_response(front.sequence, true),
                );
                break;
            }
        }
    }

    // -- inbound rpcs --

    fn handle_queries<T: Transport>(&mut self, queries: &[Query], transport: &mut T) {
        for query in queries {
            let term = query.term();
            if self.state != NodeState::Dead && term > self.current_term {
                debug!(
                    rank = self.rank,
                    from = self.current_term,
                    to = term,
                    rpc = %query.rpc_type(),
                    "newer term seen, stepping down"
                );
                self.become_follower(term);
            }

            match query.payload() {
                Payload::Message(message) => self.handle_control(query.source, message, transport),
                _ if self.state == NodeState::Dead => {}
                Payload::Heartbeat(heartbeat) => {
                    self.handle_heartbeat(query.source, term, heartbeat, transport)
                }
                Payload::AppendEntries(request) => {
                    self.handle_append_entries(query.source, term, request, transport)
                }
                Payload::VoteRequest(request) => {
                    self.handle_vote_request(query.source, term, request, transport)
                }
                Payload::SearchLeader(_) => {
                    if self.state == NodeState::Leader {
                        transport.send(query.source, &Rpc::search_leader_response(self.rank));
                    }
                }
                Payload::NewLogEntry(request) => {
                    if self.state != NodeState::Leader {
                        transport.send(
                            query.source,
                            &Rpc::new_log_entry_response(request.sequence, false),
                        );
                    }
                }
                // counted by the candidate and leader routines
                Payload::VoteResponse(_) | Payload::AppendEntriesResponse(_) => {}
                Payload::NewLogEntryResponse(_)
                | Payload::SearchLeaderResponse(_)
                | Payload::MessageResponse(_) => {}
            }
        }
    }

    fn handle_vote_request<T: Transport>(
        &mut self,
        source: Rank,
        term: Term,
        request: &VoteRequest,
        transport: &mut T,
    ) {
        if term < self.current_term {
            debug!(rank = self.rank, candidate = request.candidate_rank, term, "stale vote request");
            transport.send(source, &Rpc::vote_response(self.current_term, false));
            return;
        }

        let free_to_vote = self
            .voted_for
            .map_or(true, |voted| voted == request.candidate_rank);
        let granted = free_to_vote
            && self.candidate_is_up_to_date(request.last_log_index, request.last_log_term);

        if granted {
            self.voted_for = Some(request.candidate_rank);
            self.clock.reset();
        }
        debug!(
            rank = self.rank,
            candidate = request.candidate_rank,
            term,
            granted,
            "vote request"
        );
        transport.send(source, &Rpc::vote_response(term, granted));
    }

    /// Candidate log is at least as up to date as ours: newer last term, or
    /// same last term and at least as long.
    fn candidate_is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let local_last = last_index(&self.log);
        let local_term = term_at(&self.log, local_last);
        last_log_term > local_term || (last_log_term == local_term && last_log_index >= local_last)
    }

    fn handle_heartbeat<T: Transport>(
        &mut self,
        source: Rank,
        term: Term,
        heartbeat: &Heartbeat,
        transport: &mut T,
    ) {
        if term < self.current_term {
            transport.send(
                source,
                &Rpc::append_entries_response(self.current_term, false, NO_INDEX),
            );
            return;
        }
        if self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_hint = Some(heartbeat.leader_rank);
        self.clock.reset();

        if !self.prefix_matches(heartbeat.prev_log_index, heartbeat.prev_log_term) {
            transport.send(source, &Rpc::append_entries_response(term, false, NO_INDEX));
            return;
        }

        let target = heartbeat.leader_commit.min(heartbeat.prev_log_index);
        if target > self.commit_index {
            trace!(rank = self.rank, commit = target, "commit index from heartbeat");
            self.commit_index = target;
        }
    }

    fn handle_append_entries<T: Transport>(
        &mut self,
        source: Rank,
        term: Term,
        request: &AppendEntries,
        transport: &mut T,
    ) {
        if term < self.current_term {
            transport.send(
                source,
                &Rpc::append_entries_response(self.current_term, false, NO_INDEX),
            );
            return;
        }
        if self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_hint = Some(request.leader_rank);

        if !self.prefix_matches(request.prev_log_index, request.prev_log_term) {
            debug!(
                rank = self.rank,
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                "log mismatch"
            );
            transport.send(source, &Rpc::append_entries_response(term, false, NO_INDEX));
            return;
        }

        self.clock.reset();
        self.merge_entries(request.prev_log_index, &request.entries);

        let last_new = request.prev_log_index + request.entries.len() as LogIndex;
        if request.leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(request.leader_commit.min(last_new));
        }

        transport.send(source, &Rpc::append_entries_response(term, true, last_new));
    }

    /// Log-matching check on the entry preceding a request.
    fn prefix_matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        match prev_log_index {
            NO_INDEX => true,
            index if index < NO_INDEX => false,
            index => entry_at(&self.log, index).map(|entry| entry.term) == Some(prev_log_term),
        }
    }

    /// Keep the matching prefix, and from the first term conflict on replace
    /// the local suffix with the incoming entries.
    fn merge_entries(&mut self, prev_log_index: LogIndex, entries: &[LogEntry]) {
        let mut index = prev_log_index + 1;
        for entry in entries {
            match entry_at(&self.log, index) {
                Some(existing) if existing.term == entry.term => {}
                Some(_) => {
                    debug!(rank = self.rank, index, "truncating conflicting suffix");
                    self.log.truncate(index as usize);
                    self.log.push(entry.clone());
                }
                None => self.log.push(entry.clone()),
            }
            index += 1;
        }
    }

    // -- control --

    fn handle_control<T: Transport>(
        &mut self,
        source: Rank,
        message: &ControlMessage,
        transport: &mut T,
    ) {
        let success = match message.kind {
            ControlKind::ProcessSetSpeed => {
                self.speed = Speed::from_name(&message.content);
                info!(rank = self.rank, speed = %self.speed, "speed changed");
                true
            }
            ControlKind::ProcessStop => {
                info!(rank = self.rank, "stop requested");
                self.stopped = true;
                true
            }
            ControlKind::ProcessCrash => {
                if self.state != NodeState::Dead {
                    self.crash();
                    true
                } else {
                    warn!(rank = self.rank, "server is already dead");
                    false
                }
            }
            ControlKind::ProcessRecover => {
                if self.state == NodeState::Dead {
                    info!(rank = self.rank, "recovering");
                    self.become_follower(self.current_term);
                    true
                } else {
                    warn!(rank = self.rank, "server has not crashed and cannot recover");
                    false
                }
            }
            ControlKind::ServerTimeout => {
                if self.state == NodeState::Follower {
                    self.start_election(transport);
                    true
                } else {
                    warn!(
                        rank = self.rank,
                        state = %self.state,
                        "only a follower can be forced to time out"
                    );
                    false
                }
            }
            ControlKind::ProcessDisplay => {
                info!("{self}");
                true
            }
            ControlKind::ClientCreateNewEntry
            | ControlKind::ClientNewFileEntry
            | ControlKind::ProcessStart => {
                warn!(rank = self.rank, kind = ?message.kind, "control message not handled by servers");
                false
            }
        };
        transport.send(source, &Rpc::control_response(success));
    }
}

impl fmt::Display for RaftNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server {} is {} in term {} (speed {}, election timeout {}ms, log {} entries, commit {}, applied {})",
            self.rank,
            self.state,
            self.current_term,
            self.speed,
            self.election_timeout.as_millis(),
            self.log.len(),
            self.commit_index,
            self.last_applied,
        )
    }
}
