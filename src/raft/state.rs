use super::{Entry, Index};
use crate::error::Result;

/// A Raft-managed state machine. The Raft node applies committed log entries
/// to it in strict ascending index order, exactly once. This is the only
/// component that touches the external application state.
///
/// Apply must be deterministic: given the same committed log prefix, every
/// replica must produce the same state and the same results, including
/// errors. Validation failures are results like any other; they do not roll
/// back the log, and the entry still counts as applied. Non-deterministic
/// failures (e.g. IO errors) must not be returned, since they would diverge
/// the replicas; the node halts on them instead.
pub trait State: Send {
    /// Returns the highest applied entry index, or 0 if none. Used to resume
    /// application after the commit index advances, and to replay the log
    /// from scratch when a non-durable state machine restarts.
    fn get_applied_index(&self) -> Index;

    /// Applies a committed log entry and returns the encoded result, which is
    /// routed back to the submitting client, if any.
    fn apply(&mut self, entry: Entry) -> Result<Vec<u8>>;
}
