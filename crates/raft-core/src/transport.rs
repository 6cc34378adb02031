//! # transport
//!
//! why: decouple the state machines from how frames move between endpoints
//! relations: driven by node.rs and client.rs ticks; raft-cluster adds a threaded channel transport
//! what: Transport trait, LocalNetwork single-threaded simulated network with link cutting

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::iter;
use std::rc::Rc;

use tracing::debug;

use crate::message::{Query, Rpc};
use crate::topology::Rank;

/// Fire-and-forget delivery of rpcs between numbered endpoints.
pub trait Transport {
    /// Rank of the local endpoint.
    fn rank(&self) -> Rank;

    /// Send without any delivery guarantee.
    fn send(&mut self, destination: Rank, rpc: &Rpc);

    /// Next decodable inbound rpc, if any. Never blocks.
    fn try_receive(&mut self) -> Option<Query>;

    /// Send to every destination except ourselves.
    fn broadcast<I>(&mut self, destinations: I, rpc: &Rpc)
    where
        I: IntoIterator<Item = Rank>,
    {
        let me = self.rank();
        for destination in destinations {
            if destination != me {
                self.send(destination, rpc);
            }
        }
    }

    /// Everything that has arrived so far, in arrival order.
    fn drain(&mut self) -> Vec<Query> {
        iter::from_fn(|| self.try_receive()).collect()
    }
}

/// Decode a received frame; undecodable frames are dropped.
pub fn decode_frame(destination: Rank, source: Rank, frame: &[u8]) -> Option<Query> {
    match Rpc::decode(frame) {
        Ok(rpc) => Some(Query::new(source, rpc)),
        Err(err) => {
            debug!(rank = destination, source, error = %err, "dropping undecodable frame");
            None
        }
    }
}

/// Encode an outbound rpc; a failure is logged and the send is skipped.
pub fn encode_frame(source: Rank, destination: Rank, rpc: &Rpc) -> Option<Vec<u8>> {
    match rpc.encode() {
        Ok(frame) => Some(frame),
        Err(err) => {
            debug!(rank = source, destination, error = %err, "failed to encode rpc");
            None
        }
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    inboxes: HashMap<Rank, VecDeque<(Rank, Vec<u8>)>>,
    cut_links: HashSet<(Rank, Rank)>,
    dropped: usize,
}

/// In-memory network for driving whole clusters from one thread.
///
/// Each destination has a FIFO inbox, so frames from one source arrive in
/// send order. Frames sent over a cut link are counted and discarded.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, rank: Rank) -> LocalEndpoint {
        self.state.borrow_mut().inboxes.entry(rank).or_default();
        LocalEndpoint {
            rank,
            network: self.clone(),
        }
    }

    /// Drop traffic in both directions between `a` and `b`.
    pub fn cut(&self, a: Rank, b: Rank) {
        let mut state = self.state.borrow_mut();
        state.cut_links.insert((a, b));
        state.cut_links.insert((b, a));
    }

    /// Cut every link crossing from one side to the other.
    pub fn partition(&self, side_a: &[Rank], side_b: &[Rank]) {
        for &a in side_a {
            for &b in side_b {
                self.cut(a, b);
            }
        }
    }

    pub fn isolate(&self, rank: Rank, others: impl IntoIterator<Item = Rank>) {
        for other in others {
            if other != rank {
                self.cut(rank, other);
            }
        }
    }

    pub fn heal(&self) {
        self.state.borrow_mut().cut_links.clear();
    }

    /// Queue a raw frame, bypassing encoding.
    pub fn inject(&self, source: Rank, destination: Rank, frame: Vec<u8>) {
        self.state
            .borrow_mut()
            .inboxes
            .entry(destination)
            .or_default()
            .push_back((source, frame));
    }

    /// Frames waiting in `rank`'s inbox.
    pub fn pending(&self, rank: Rank) -> usize {
        self.state
            .borrow()
            .inboxes
            .get(&rank)
            .map_or(0, VecDeque::len)
    }

    /// Frames discarded on cut links so far.
    pub fn dropped(&self) -> usize {
        self.state.borrow().dropped
    }

    fn deliver(&self, source: Rank, destination: Rank, frame: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        if state.cut_links.contains(&(source, destination)) {
            state.dropped += 1;
            return;
        }
        state
            .inboxes
            .entry(destination)
            .or_default()
            .push_back((source, frame));
    }

    fn pop(&self, rank: Rank) -> Option<(Rank, Vec<u8>)> {
        self.state
            .borrow_mut()
            .inboxes
            .get_mut(&rank)
            .and_then(VecDeque::pop_front)
    }
}

/// One endpoint of a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    rank: Rank,
    network: LocalNetwork,
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn send(&mut self, destination: Rank, rpc: &Rpc) {
        if let Some(frame) = encode_frame(self.rank, destination, rpc) {
            self.network.deliver(self.rank, destination, frame);
        }
    }

    fn try_receive(&mut self) -> Option<Query> {
        while let Some((source, frame)) = self.network.pop(self.rank) {
            if let Some(query) = decode_frame(self.rank, source, &frame) {
                return Some(query);
            }
        }
        None
    }
}
