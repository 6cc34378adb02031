//! # transport
//!
//! why: carry encoded rpc frames between endpoint threads
//! relations: implements raft-core's Transport for the runtime; the console waits on it for replies
//! what: ChannelNetwork (one crossbeam inbox per rank), ChannelTransport endpoint

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use raft_core::transport::{decode_frame, encode_frame};
use raft_core::{Query, Rank, Rpc, Transport};
use tracing::trace;

type Frame = (Rank, Vec<u8>);

/// Inboxes for ranks `0..endpoints`. Each endpoint is handed out once.
pub struct ChannelNetwork {
    senders: Vec<Sender<Frame>>,
    receivers: Vec<Option<Receiver<Frame>>>,
}

impl ChannelNetwork {
    pub fn new(endpoints: usize) -> Self {
        let (senders, receivers) = (0..endpoints)
            .map(|_| {
                let (tx, rx) = unbounded();
                (tx, Some(rx))
            })
            .unzip();
        Self { senders, receivers }
    }

    /// Take the endpoint for `rank`; `None` if out of range or already taken.
    pub fn endpoint(&mut self, rank: Rank) -> Option<ChannelTransport> {
        let inbox = self.receivers.get_mut(rank)?.take()?;
        Some(ChannelTransport {
            rank,
            outboxes: self.senders.clone(),
            inbox,
        })
    }
}

pub struct ChannelTransport {
    rank: Rank,
    outboxes: Vec<Sender<Frame>>,
    inbox: Receiver<Frame>,
}

impl ChannelTransport {
    /// Block until a decodable rpc arrives or `timeout` passes.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Option<Query> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok((source, frame)) => {
                    if let Some(query) = decode_frame(self.rank, source, &frame) {
                        return Some(query);
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn send(&mut self, destination: Rank, rpc: &Rpc) {
        let Some(outbox) = self.outboxes.get(destination) else {
            trace!(rank = self.rank, destination, "no such endpoint");
            return;
        };
        if let Some(frame) = encode_frame(self.rank, destination, rpc) {
            // a finished endpoint has dropped its inbox; the frame is lost like any other
            if outbox.send((self.rank, frame)).is_err() {
                trace!(rank = self.rank, destination, "endpoint gone");
            }
        }
    }

    fn try_receive(&mut self) -> Option<Query> {
        while let Ok((source, frame)) = self.inbox.try_recv() {
            if let Some(query) = decode_frame(self.rank, source, &frame) {
                return Some(query);
            }
        }
        None
    }

    /// Only frames queued before the call; senders keep running meanwhile.
    fn drain(&mut self) -> Vec<Query> {
        let pending = self.inbox.len();
        let rank = self.rank;
        self.inbox
            .try_iter()
            .take(pending)
            .filter_map(|(source, frame)| decode_frame(rank, source, &frame))
            .collect()
    }
}
