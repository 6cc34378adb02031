//! # message
//!
//! why: define every rpc exchanged between console, clients and servers
//! relations: built and consumed by node.rs and client.rs, encoded by transports
//! what: payload structs, closed Payload sum type, Rpc envelope with wire codec, received Query

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::log::{LogEntry, LogIndex, Term, NO_TERM};
use crate::topology::Rank;

/// Wire tag identifying the payload of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcType {
    Heartbeat,
    VoteRequest,
    VoteResponse,
    AppendEntries,
    AppendEntriesResponse,
    NewLogEntry,
    NewLogEntryResponse,
    SearchLeader,
    SearchLeaderResponse,
    Message,
    MessageResponse,
}

impl RpcType {
    /// Client-origin rpcs carry [`NO_TERM`] instead of a sender term.
    pub fn is_client_origin(self) -> bool {
        matches!(
            self,
            RpcType::NewLogEntry
                | RpcType::NewLogEntryResponse
                | RpcType::SearchLeader
                | RpcType::SearchLeaderResponse
                | RpcType::Message
                | RpcType::MessageResponse
        )
    }
}

/// Leader keep-alive; an AppendEntries without entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub leader_rank: Rank,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_rank: Rank,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub leader_rank: Rank,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub success: bool,
    /// Last index known to match the leader after this request, `NO_INDEX` on rejection.
    pub match_index: LogIndex,
}

/// Command submitted by a client; the entry term is [`NO_TERM`] until a leader stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub log_entry: LogEntry,
    /// Submission number chosen by the client, echoed back in the response.
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntryResponse {
    pub success: bool,
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchLeader {
    /// The requester's current leader hint (0 when unknown).
    pub leader_rank: Rank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchLeaderResponse {
    pub leader_rank: Rank,
}

/// Operator and client control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlKind {
    ClientCreateNewEntry,
    ClientNewFileEntry,
    ServerTimeout,
    ProcessDisplay,
    ProcessSetSpeed,
    ProcessCrash,
    ProcessRecover,
    ProcessStop,
    ProcessStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    pub content: String,
}

impl ControlMessage {
    pub fn new(kind: ControlKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
}

/// Every payload that can travel inside an [`Rpc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Heartbeat(Heartbeat),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    NewLogEntry(NewLogEntry),
    NewLogEntryResponse(NewLogEntryResponse),
    SearchLeader(SearchLeader),
    SearchLeaderResponse(SearchLeaderResponse),
    Message(ControlMessage),
    MessageResponse(ControlResponse),
}

impl Payload {
    pub fn rpc_type(&self) -> RpcType {
        match self {
            Payload::Heartbeat(_) => RpcType::Heartbeat,
            Payload::VoteRequest(_) => RpcType::VoteRequest,
            Payload::VoteResponse(_) => RpcType::VoteResponse,
            Payload::AppendEntries(_) => RpcType::AppendEntries,
            Payload::AppendEntriesResponse(_) => RpcType::AppendEntriesResponse,
            Payload::NewLogEntry(_) => RpcType::NewLogEntry,
            Payload::NewLogEntryResponse(_) => RpcType::NewLogEntryResponse,
            Payload::SearchLeader(_) => RpcType::SearchLeader,
            Payload::SearchLeaderResponse(_) => RpcType::SearchLeaderResponse,
            Payload::Message(_) => RpcType::Message,
            Payload::MessageResponse(_) => RpcType::MessageResponse,
        }
    }

    fn to_content(&self) -> Result<serde_json::Value> {
        let value = match self {
            Payload::Heartbeat(p) => serde_json::to_value(p)?,
            Payload::VoteRequest(p) => serde_json::to_value(p)?,
            Payload::VoteResponse(p) => serde_json::to_value(p)?,
            Payload::AppendEntries(p) => serde_json::to_value(p)?,
            Payload::AppendEntriesResponse(p) => serde_json::to_value(p)?,
            Payload::NewLogEntry(p) => serde_json::to_value(p)?,
            Payload::NewLogEntryResponse(p) => serde_json::to_value(p)?,
            Payload::SearchLeader(p) => serde_json::to_value(p)?,
            Payload::SearchLeaderResponse(p) => serde_json::to_value(p)?,
            Payload::Message(p) => serde_json::to_value(p)?,
            Payload::MessageResponse(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    fn from_content(rpc_type: RpcType, content: serde_json::Value) -> Result<Self> {
        let payload = match rpc_type {
            RpcType::Heartbeat => Payload::Heartbeat(serde_json::from_value(content)?),
            RpcType::VoteRequest => Payload::VoteRequest(serde_json::from_value(content)?),
            RpcType::VoteResponse => Payload::VoteResponse(serde_json::from_value(content)?),
            RpcType::AppendEntries => Payload::AppendEntries(serde_json::from_value(content)?),
            RpcType::AppendEntriesResponse => {
                Payload::AppendEntriesResponse(serde_json::from_value(content)?)
            }
            RpcType::NewLogEntry => Payload::NewLogEntry(serde_json::from_value(content)?),
            RpcType::NewLogEntryResponse => {
                Payload::NewLogEntryResponse(serde_json::from_value(content)?)
            }
            RpcType::SearchLeader => Payload::SearchLeader(serde_json::from_value(content)?),
            RpcType::SearchLeaderResponse => {
                Payload::SearchLeaderResponse(serde_json::from_value(content)?)
            }
            RpcType::Message => Payload::Message(serde_json::from_value(content)?),
            RpcType::MessageResponse => Payload::MessageResponse(serde_json::from_value(content)?),
        };
        Ok(payload)
    }
}

/// Self-describing envelope: tag, term and typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub term: Term,
    pub payload: Payload,
}

/// Serialized form of [`Rpc`].
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    message_type: RpcType,
    term: Term,
    message_content: serde_json::Value,
}

impl Rpc {
    /// Consensus rpc stamped with the sender's term.
    pub fn new(term: Term, payload: Payload) -> Self {
        Self { term, payload }
    }

    /// Client-origin rpc; the term is always [`NO_TERM`].
    pub fn client(payload: Payload) -> Self {
        Self {
            term: NO_TERM,
            payload,
        }
    }

    pub fn heartbeat(term: Term, heartbeat: Heartbeat) -> Self {
        Self::new(term, Payload::Heartbeat(heartbeat))
    }

    pub fn vote_request(term: Term, request: VoteRequest) -> Self {
        Self::new(term, Payload::VoteRequest(request))
    }

    pub fn vote_response(term: Term, vote_granted: bool) -> Self {
        Self::new(term, Payload::VoteResponse(VoteResponse { vote_granted }))
    }

    pub fn append_entries(term: Term, request: AppendEntries) -> Self {
        Self::new(term, Payload::AppendEntries(request))
    }

    pub fn append_entries_response(term: Term, success: bool, match_index: LogIndex) -> Self {
        Self::new(
            term,
            Payload::AppendEntriesResponse(AppendEntriesResponse {
                success,
                match_index,
            }),
        )
    }

    pub fn new_log_entry(sequence: u64, command: impl Into<String>) -> Self {
        Self::client(Payload::NewLogEntry(NewLogEntry {
            log_entry: LogEntry::new(NO_TERM, command),
            sequence,
        }))
    }

    pub fn new_log_entry_response(sequence: u64, success: bool) -> Self {
        Self::client(Payload::NewLogEntryResponse(NewLogEntryResponse {
            success,
            sequence,
        }))
    }

    pub fn search_leader(leader_hint: Rank) -> Self {
        Self::client(Payload::SearchLeader(SearchLeader {
            leader_rank: leader_hint,
        }))
    }

    pub fn search_leader_response(leader_rank: Rank) -> Self {
        Self::client(Payload::SearchLeaderResponse(SearchLeaderResponse {
            leader_rank,
        }))
    }

    pub fn control(kind: ControlKind, content: impl Into<String>) -> Self {
        Self::client(Payload::Message(ControlMessage::new(kind, content)))
    }

    pub fn control_response(success: bool) -> Self {
        Self::client(Payload::MessageResponse(ControlResponse { success }))
    }

    pub fn rpc_type(&self) -> RpcType {
        self.payload.rpc_type()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            message_type: self.rpc_type(),
            term: self.term,
            message_content: self.payload.to_content()?,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode a frame, rejecting terms that contradict the tag: client-origin
    /// rpcs must carry [`NO_TERM`], consensus rpcs a non-negative term.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        let valid_term = if wire.message_type.is_client_origin() {
            wire.term == NO_TERM
        } else {
            wire.term >= 0
        };
        if !valid_term {
            return Err(RaftError::InvalidTerm {
                rpc_type: wire.message_type,
                term: wire.term,
            });
        }
        let payload = Payload::from_content(wire.message_type, wire.message_content)?;
        Ok(Self {
            term: wire.term,
            payload,
        })
    }
}

/// An rpc as seen by its receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub source: Rank,
    pub rpc: Rpc,
}

impl Query {
    pub fn new(source: Rank, rpc: Rpc) -> Self {
        Self { source, rpc }
    }

    pub fn term(&self) -> Term {
        self.rpc.term
    }

    pub fn rpc_type(&self) -> RpcType {
        self.rpc.rpc_type()
    }

    pub fn payload(&self) -> &Payload {
        &self.rpc.payload
    }
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcType::Heartbeat => "HEARTBEAT",
            RpcType::VoteRequest => "VOTE_REQUEST",
            RpcType::VoteResponse => "VOTE_RESPONSE",
            RpcType::AppendEntries => "APPEND_ENTRIES",
            RpcType::AppendEntriesResponse => "APPEND_ENTRIES_RESPONSE",
            RpcType::NewLogEntry => "NEW_LOG_ENTRY",
            RpcType::NewLogEntryResponse => "NEW_LOG_ENTRY_RESPONSE",
            RpcType::SearchLeader => "SEARCH_LEADER",
            RpcType::SearchLeaderResponse => "SEARCH_LEADER_RESPONSE",
            RpcType::Message => "MESSAGE",
            RpcType::MessageResponse => "MESSAGE_RESPONSE",
        };
        f.write_str(name)
    }
}
