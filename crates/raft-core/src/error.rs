//! # error
//!
//! why: give every fallible core operation one error type
//! relations: returned by message.rs (codec), topology.rs, log.rs sinks, client.rs file loading
//! what: RaftError enum and the crate Result alias

use thiserror::Error;

use crate::log::Term;
use crate::message::RpcType;
use crate::topology::Rank;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{rpc_type:?} rpc carries invalid term {term}")]
    InvalidTerm { rpc_type: RpcType, term: Term },

    #[error("rank {0} is not part of the cluster")]
    UnknownRank(Rank),

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
