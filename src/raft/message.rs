use super::{Entry, Index, NodeID, Term};
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message envelope passed between Raft nodes, or between a node and its
/// local server. The sender identity is established by the transport and
/// trusted; the encoding is self-describing bincode, with the RPC kind and
/// request/response direction carried by the Message variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

impl crate::encoding::Value for Envelope {}

/// A message payload. The enum variant implies the RPC family and direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leaders replicate log entries to a follower, and assert leadership by
    /// sending the message with an empty entry set (a heartbeat).
    AppendEntries {
        /// The index of the entry immediately preceding the submitted ones.
        prev_index: Index,
        /// The term of the entry immediately preceding the submitted ones.
        prev_term: Term,
        /// Entries to replicate. Empty for heartbeats.
        entries: Vec<Entry>,
        /// The leader's commit index, for the follower to advance to.
        commit_index: Index,
    },
    /// A follower's response to AppendEntries.
    AppendEntriesResponse {
        /// Whether the entries were accepted, i.e. the base entry matched.
        success: bool,
        /// On success, the highest index matching the leader's log. On
        /// failure, the follower's commit index: everything at or below it is
        /// known to match, so the leader can back off to it directly.
        match_index: Index,
    },

    /// Candidates solicit votes from all peers when campaigning. The
    /// candidate is the envelope sender.
    RequestVote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },
    /// A response to RequestVote. A node grants at most one vote per term, on
    /// a first-come basis; candidates implicitly vote for themselves.
    RequestVoteResponse {
        /// Whether the vote was granted.
        granted: bool,
    },

    /// Snapshot transfer for log compaction. Reserved: declared on the wire
    /// but not implemented, receivers drop it.
    InstallSnapshot { last_index: Index, last_term: Term, data: Vec<u8> },
    /// Reserved, see InstallSnapshot.
    InstallSnapshotResponse { last_index: Index },

    /// A client request, submitted to the local node by its server. Never
    /// sent to peers: non-leaders reject requests with a leader hint instead
    /// of forwarding them.
    ClientRequest {
        /// The request ID. Arbitrary, but unique for the request's duration.
        id: RequestID,
        /// The request.
        request: Request,
    },
    /// A client response, routed back to the server that submitted the
    /// request.
    ClientResponse {
        /// The response ID, matching the ClientRequest ID.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

/// A client request ID.
pub type RequestID = Vec<u8>;

impl crate::encoding::Value for Request {}
impl crate::encoding::Value for Response {}

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Executes a state machine command. The command is opaque to Raft. The
    /// caller blocks until the command is applied or the request rejected.
    Execute(Vec<u8>),
    /// Reports node status. Served locally by any role.
    Status,
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The state machine result of an executed command.
    Execute(Vec<u8>),
    /// Node status.
    Status(Status),
}

/// Raft node status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node that generated this status.
    pub server: NodeID,
    /// The node's current leader, if known. The node itself when leader.
    pub leader: Option<NodeID>,
    /// The node's current term.
    pub term: Term,
    /// The node's last log index.
    pub last_index: Index,
    /// The node's commit index.
    pub commit_index: Index,
    /// The node's applied index.
    pub applied_index: Index,
    /// Replication progress, by peer. Only populated on the leader.
    pub match_index: HashMap<NodeID, Index>,
    /// The log storage engine.
    pub storage: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::error::Error;

    use test_case::test_case;

    fn entry(index: Index, term: Term, command: &str) -> Entry {
        Entry { index, term, command: command.as_bytes().to_vec() }
    }

    /// Encoding then decoding an envelope must yield bytewise equal content.
    #[test_case(Message::AppendEntries {
        prev_index: 3,
        prev_term: 2,
        entries: vec![entry(4, 2, "bid"), entry(5, 2, "close")],
        commit_index: 3,
    }; "append entries")]
    #[test_case(Message::AppendEntries {
        prev_index: 0,
        prev_term: 0,
        entries: vec![],
        commit_index: 0,
    }; "heartbeat")]
    #[test_case(Message::AppendEntriesResponse { success: false, match_index: 7 }; "append reject")]
    #[test_case(Message::RequestVote { last_index: 9, last_term: 3 }; "request vote")]
    #[test_case(Message::RequestVoteResponse { granted: true }; "grant vote")]
    #[test_case(Message::InstallSnapshot { last_index: 1, last_term: 1, data: vec![0xff] }; "snapshot")]
    #[test_case(Message::ClientRequest {
        id: vec![1, 2, 3],
        request: Request::Execute(b"new_user".to_vec()),
    }; "client request")]
    #[test_case(Message::ClientResponse {
        id: vec![1, 2, 3],
        response: Err(Error::NotLeader { leader: Some("b".into()) }),
    }; "client error response")]
    fn envelope_roundtrip(message: Message) {
        let envelope =
            Envelope { from: "a".to_string(), to: "b".to_string(), term: 3, message };
        let bytes = envelope.encode().expect("encode failed");
        let decoded = Envelope::decode(&bytes).expect("decode failed");
        assert_eq!(envelope, decoded);
        assert_eq!(bytes, decoded.encode().expect("encode failed"));
    }
}
