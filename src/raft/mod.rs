//! The Raft consensus engine. Replicates client commands across a fixed
//! cluster of nodes and applies them to a local state machine in log order,
//! so that every node produces identical results.

mod log;
mod message;
mod node;
mod state;
mod timer;

pub use self::log::{Entry, Index, Log};
pub use message::{Envelope, Message, Request, RequestID, Response, Status};
pub use node::{Node, NodeID, Options, Term};
pub use state::State;
pub use timer::{Scheduler, Timer, TimerFire};

/// The interval between per-peer heartbeats, in milliseconds. Leaders use it
/// to re-send AppendEntries, candidates to re-solicit votes.
pub const HEARTBEAT_INTERVAL: u64 = 50;

/// The range of randomized leader timeouts for followers, in milliseconds. A
/// new duration is drawn on every arm.
pub const LEADER_TIMEOUT_RANGE: std::ops::Range<u64> = 150..300;

/// The range of randomized election timeouts for candidates, in milliseconds.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<u64> = 150..300;

/// The minimum delay between two elections started by this node, in
/// milliseconds. Timeouts that fire inside the delay are ignored.
pub const MIN_ELECTION_DELAY: u64 = 50;

/// The maximum number of entries in a single AppendEntries message.
pub const MAX_APPEND_ENTRIES: usize = 64;
