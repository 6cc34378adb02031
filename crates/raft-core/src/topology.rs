//! # topology
//!
//! why: map numbered endpoints to their role in the cluster
//! relations: used by node.rs for peer slots, client.rs for server broadcast, transports for sizing
//! what: Rank alias, Topology with console=0, clients 1..=C, servers C+1..=C+S

use std::ops::RangeInclusive;

use crate::error::{RaftError, Result};

/// Numbered endpoint identifier.
pub type Rank = usize;

/// Rank of the operator console.
pub const CONSOLE_RANK: Rank = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    clients: usize,
    servers: usize,
}

impl Topology {
    pub fn new(clients: usize, servers: usize) -> Result<Self> {
        if servers == 0 {
            return Err(RaftError::Topology(
                "topology requires at least one server".to_string(),
            ));
        }
        Ok(Self { clients, servers })
    }

    pub fn clients(&self) -> usize {
        self.clients
    }

    pub fn servers(&self) -> usize {
        self.servers
    }

    pub fn console(&self) -> Rank {
        CONSOLE_RANK
    }

    /// Console, clients and servers together.
    pub fn endpoint_count(&self) -> usize {
        1 + self.clients + self.servers
    }

    pub fn client_ranks(&self) -> RangeInclusive<Rank> {
        1..=self.clients
    }

    pub fn server_ranks(&self) -> RangeInclusive<Rank> {
        self.server_offset()..=self.clients + self.servers
    }

    pub fn is_client(&self, rank: Rank) -> bool {
        self.client_ranks().contains(&rank)
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        self.server_ranks().contains(&rank)
    }

    /// Any client or server, i.e. everything the console may address.
    pub fn is_process(&self, rank: Rank) -> bool {
        rank >= 1 && rank < self.endpoint_count()
    }

    /// Zero-based position of a server rank, used to index per-peer state.
    pub fn server_slot(&self, rank: Rank) -> Option<usize> {
        self.is_server(rank).then(|| rank - self.server_offset())
    }

    pub fn server_rank(&self, slot: usize) -> Option<Rank> {
        (slot < self.servers).then(|| slot + self.server_offset())
    }

    /// Smallest number of servers forming a strict majority.
    pub fn majority(&self) -> usize {
        self.servers / 2 + 1
    }

    fn server_offset(&self) -> Rank {
        self.clients + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_console_clients_servers_order() {
        let topology = Topology::new(2, 3).unwrap();
        assert_eq!(topology.console(), 0);
        assert_eq!(topology.client_ranks(), 1..=2);
        assert_eq!(topology.server_ranks(), 3..=5);
        assert_eq!(topology.endpoint_count(), 6);
    }

    #[test]
    fn server_slots_are_offset_by_clients_plus_one() {
        let topology = Topology::new(2, 3).unwrap();
        assert_eq!(topology.server_slot(3), Some(0));
        assert_eq!(topology.server_slot(5), Some(2));
        assert_eq!(topology.server_slot(2), None);
        assert_eq!(topology.server_slot(6), None);
        assert_eq!(topology.server_rank(1), Some(4));
        assert_eq!(topology.server_rank(3), None);
    }

    #[test]
    fn classifies_ranks() {
        let topology = Topology::new(1, 3).unwrap();
        assert!(!topology.is_process(0));
        assert!(topology.is_client(1));
        assert!(topology.is_server(2));
        assert!(topology.is_process(4));
        assert!(!topology.is_process(5));
    }

    #[test]
    fn zero_clients_is_allowed() {
        let topology = Topology::new(0, 3).unwrap();
        assert_eq!(topology.server_ranks(), 1..=3);
        assert!(topology.client_ranks().is_empty());
    }

    #[test]
    fn majority_sizes() {
        assert_eq!(Topology::new(0, 1).unwrap().majority(), 1);
        assert_eq!(Topology::new(0, 3).unwrap().majority(), 2);
        assert_eq!(Topology::new(0, 4).unwrap().majority(), 3);
        assert_eq!(Topology::new(0, 5).unwrap().majority(), 3);
    }

    #[test]
    fn rejects_empty_server_set() {
        assert!(matches!(Topology::new(2, 0), Err(RaftError::Topology(_))));
    }
}
