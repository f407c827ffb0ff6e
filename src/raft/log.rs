use super::{NodeID, Term};
use crate::encoding::{self, Value as _};
use crate::errdata;
use crate::error::Result;
use crate::storage;

use serde::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The state machine command. Opaque to Raft; the state machine decodes
    /// it at apply time.
    pub command: Vec<u8>,
}

impl crate::encoding::Value for Entry {}

/// Metadata key storing the current term and vote (if any).
const META_TERM_VOTE: &[u8] = b"term_vote";
/// Metadata key storing the commit index and term (if any).
const META_COMMIT_INDEX: &[u8] = b"commit_index";

/// The Raft log stores a sequence of arbitrary commands that are replicated
/// across nodes and applied sequentially to the local state machine. Each
/// entry contains an index, the command, and the term in which the leader
/// proposed it.
///
/// In the steady state the log is append-only: when a client submits a
/// command the leader appends it to its own log (via [`Log::append`]) and
/// replicates it to followers, who append it to their logs (via
/// [`Log::splice`]). Once an index is stored on a majority of nodes it is
/// committed, making the log immutable up to that index. Uncommitted entries
/// on a follower can still be replaced when a new leader's log diverges from
/// them; splice() truncates the local log at the first conflicting entry.
///
/// The log enforces the following invariants:
///
/// * Entry indexes are contiguous starting at 1 (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries are durable (synced to disk) before use.
/// * Appended entries use the current term.
/// * Committed entries are never changed or removed.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
///
/// The current term and vote are also stored here, since they must be
/// persisted with the same durability as the log itself: a vote must never
/// be forgotten, or a node could vote twice in a term.
pub struct Log {
    /// The underlying entry store. A trait object, to allow runtime engine
    /// selection without propagating generics through the Raft node.
    store: Box<dyn storage::Store>,
    /// The current term.
    term: Term,
    /// Our vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
}

impl Log {
    /// Initializes a log using the given entry store.
    pub fn new(mut store: Box<dyn storage::Store>) -> Result<Self> {
        let (term, vote) = store
            .get_meta(META_TERM_VOTE)?
            .map(|v| encoding::from_slice(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (last_index, last_term) = match store.last_index() {
            0 => (0, 0),
            index => {
                let entry = store.get(index)?.map(|v| Entry::decode(&v)).transpose()?;
                let Some(entry) = entry else {
                    return errdata!("missing last entry {index}");
                };
                (entry.index, entry.term)
            }
        };
        let (commit_index, commit_term) = store
            .get_meta(META_COMMIT_INDEX)?
            .map(|v| encoding::from_slice(&v))
            .transpose()?
            .unwrap_or((0, 0));
        if commit_index > last_index {
            return errdata!("commit index {commit_index} beyond last entry {last_index}");
        }
        Ok(Self { store, term, vote, last_index, last_term, commit_index, commit_term })
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term_vote(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote.clone())
    }

    /// Returns the name of the underlying entry store.
    pub fn store_name(&self) -> String {
        self.store.to_string()
    }

    /// Stores the current term and cast vote (if any), durably. Enforces that
    /// the term does not regress and that we only vote for one node per term.
    /// append() will use this term, and splice() can't write entries beyond
    /// it.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.store.set_meta(META_TERM_VOTE, encoding::to_vec(&(term, &vote))?)?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command to the log at the current term, syncs it to disk,
    /// and returns its index.
    pub fn append(&mut self, command: Vec<u8>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        let index = self.store.append(entry.encode()?)?;
        assert_eq!(index, entry.index, "appended entry has wrong index");
        self.store.sync()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let term = match self.get(index)? {
            Some(e) if e.index < self.commit_index => {
                panic!("commit index regression {} → {}", self.commit_index, e.index);
            }
            Some(e) if e.index == self.commit_index => return Ok(index),
            Some(e) => e.term,
            None => panic!("commit index {index} does not exist"),
        };
        // NB: the commit index doesn't need to be fsynced for correctness,
        // since it can be recovered from a log quorum.
        self.store.set_meta(META_COMMIT_INDEX, encoding::to_vec(&(index, term))?)?;
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.store.get(index)?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns the term of the entry at the given index, or None if there is
    /// no such entry.
    pub fn term_at(&mut self, index: Index) -> Result<Option<Term>> {
        // Fast paths avoiding store reads, common when processing appends.
        if index == 0 || index > self.last_index {
            return Ok(None);
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        Ok(self.term_at(index)? == Some(term))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator<'_> {
        let range = (range.start_bound().cloned(), range.end_bound().cloned());
        Iterator::new(self.store.scan(range))
    }

    /// Returns an iterator over entries that are ready to apply, starting
    /// after the given applied index up to the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator<'_> {
        // NB: a restarted node may have an applied index beyond the commit
        // index, since the commit index is not synced to durable storage.
        if applied_index >= self.commit_index {
            return Iterator::empty();
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and syncs them to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and
    /// the first entry must be in the range [1, last_index+1] with a term at
    /// or above the previous (base) entry's term and at or below the current
    /// term.
    ///
    /// New indexes are appended. Overlapping indexes with the same term must
    /// be equal and are ignored (making duplicate leader retries idempotent).
    /// Overlapping indexes with different terms truncate the existing log at
    /// the first conflict and splice the new entries from there.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }

        // Check that the entries connect to the existing log, and that the
        // term doesn't regress.
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        assert!(first.index <= self.last_index + 1, "first index {} must touch log", first.index);
        if let Some(base_term) = self.term_at(first.index - 1)? {
            assert!(first.term >= base_term, "splice term regression {base_term} → {}", first.term);
        }

        // Skip entries that are already in the log, and find the first
        // conflicting index, if any.
        let mut entries = entries.as_slice();
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            // [0] is ok, because the scan can't yield more than entries.len().
            assert_eq!(entry.index, entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert_eq!(entry.command, entries[0].command, "command mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries were already in the log we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Truncate the conflicting tail, if any, and append the rest.
        // Committed entries must be immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        self.store.truncate(first.index - 1)?;
        for entry in entries {
            self.store.append(entry.encode()?)?;
        }
        self.store.sync()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Option<storage::Scan<'a>>,
}

impl<'a> Iterator<'a> {
    fn new(inner: storage::Scan<'a>) -> Self {
        Self { inner: Some(inner) }
    }

    fn empty() -> Self {
        Self { inner: None }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next().map(|r| r.and_then(|v| Entry::decode(&v)))
    }
}
