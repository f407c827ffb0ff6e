//! Log storage engines. These store raw, opaque log entries keyed by a
//! contiguous 1-based index, along with a small set of metadata keys (e.g.
//! the current term and vote). The typed Raft log in `raft::log` sits on top.

mod file;
mod memory;

pub use file::File;
pub use memory::Memory;

use crate::error::Result;

use std::ops::Bound;

/// A log entry store. Entry indexes are 1-based and contiguous, matching Raft
/// semantics; index 0 means "no entry".
///
/// Writes are only guaranteed durable once sync() returns, except metadata
/// writes which are durable immediately. Only supports single-threaded use,
/// since all methods take a mutable reference -- access is serialized by the
/// Raft node anyway.
pub trait Store: std::fmt::Display + Send {
    /// Appends a log entry, returning its index. The entry is not guaranteed
    /// durable until the next sync().
    fn append(&mut self, entry: Vec<u8>) -> Result<u64>;

    /// Fetches a log entry, if it exists.
    fn get(&mut self, index: u64) -> Result<Option<Vec<u8>>>;

    /// Returns the index of the last entry, or 0 if the log is empty.
    fn last_index(&self) -> u64;

    /// Iterates over log entries in the given index range.
    fn scan(&mut self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_>;

    /// Removes all entries above the given index, and returns the new last
    /// index. Truncating above the last index is a noop.
    fn truncate(&mut self, index: u64) -> Result<u64>;

    /// Gets a metadata value, if it exists.
    fn get_meta(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Sets a metadata value. Durable when the call returns.
    fn set_meta(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Flushes any buffered entries to the underlying storage medium.
    fn sync(&mut self) -> Result<()>;
}

/// An iterator over a range of log entries.
pub type Scan<'a> = Box<dyn Iterator<Item = Result<Vec<u8>>> + 'a>;

/// Resolves a scan range to inclusive (start, end) indexes for a log with the
/// given last index. Returns None if the range is empty.
pub(crate) fn resolve_range(
    range: (Bound<u64>, Bound<u64>),
    last_index: u64,
) -> Option<(u64, u64)> {
    let start = match range.0 {
        Bound::Included(0) | Bound::Unbounded => 1,
        Bound::Included(i) => i,
        Bound::Excluded(i) => i + 1,
    };
    let end = match range.1 {
        Bound::Included(i) => i.min(last_index),
        Bound::Excluded(0) => return None,
        Bound::Excluded(i) => (i - 1).min(last_index),
        Bound::Unbounded => last_index,
    };
    if start > end {
        return None;
    }
    Some((start, end))
}

/// Generates common test cases for any Store implementation. The caller
/// provides a setup() returning an empty store.
#[cfg(test)]
pub(crate) trait TestSuite<S: Store> {
    fn setup() -> Result<S>;

    fn test() -> Result<()> {
        Self::test_append()?;
        Self::test_get()?;
        Self::test_metadata()?;
        Self::test_scan()?;
        Self::test_truncate()?;
        Ok(())
    }

    fn test_append() -> Result<()> {
        let mut s = Self::setup()?;
        assert_eq!(s.last_index(), 0);
        assert_eq!(s.append(vec![0x01])?, 1);
        assert_eq!(s.append(vec![0x02])?, 2);
        assert_eq!(s.append(vec![0x03])?, 3);
        s.sync()?;
        assert_eq!(s.last_index(), 3);
        assert_eq!(
            s.scan((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded))
                .collect::<Result<Vec<_>>>()?,
            vec![vec![1], vec![2], vec![3]]
        );
        Ok(())
    }

    fn test_get() -> Result<()> {
        let mut s = Self::setup()?;
        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.sync()?;
        assert_eq!(s.get(0)?, None);
        assert_eq!(s.get(1)?, Some(vec![0x01]));
        assert_eq!(s.get(2)?, Some(vec![0x02]));
        assert_eq!(s.get(3)?, None);
        Ok(())
    }

    fn test_metadata() -> Result<()> {
        let mut s = Self::setup()?;
        s.set_meta(b"a", vec![0x01])?;
        assert_eq!(s.get_meta(b"a")?, Some(vec![0x01]));
        assert_eq!(s.get_meta(b"b")?, None);
        s.set_meta(b"a", vec![0x02])?;
        assert_eq!(s.get_meta(b"a")?, Some(vec![0x02]));
        Ok(())
    }

    fn test_scan() -> Result<()> {
        use std::ops::Bound::*;
        let mut s = Self::setup()?;
        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.append(vec![0x03])?;
        s.sync()?;

        let scan =
            |s: &mut S, range| s.scan(range).collect::<Result<Vec<_>>>().expect("scan failed");
        assert_eq!(scan(&mut s, (Unbounded, Unbounded)), vec![vec![1], vec![2], vec![3]]);
        assert_eq!(scan(&mut s, (Included(2), Unbounded)), vec![vec![2], vec![3]]);
        assert_eq!(scan(&mut s, (Excluded(1), Included(2))), vec![vec![2]]);
        assert_eq!(scan(&mut s, (Unbounded, Excluded(3))), vec![vec![1], vec![2]]);
        assert_eq!(scan(&mut s, (Unbounded, Included(9))), vec![vec![1], vec![2], vec![3]]);
        assert!(scan(&mut s, (Included(4), Unbounded)).is_empty());
        assert!(scan(&mut s, (Included(3), Included(1))).is_empty());
        Ok(())
    }

    fn test_truncate() -> Result<()> {
        let mut s = Self::setup()?;

        // Truncating an empty store is a noop.
        assert_eq!(s.truncate(0)?, 0);

        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.append(vec![0x03])?;
        s.sync()?;

        // Truncating at or beyond the end is a noop.
        assert_eq!(s.truncate(4)?, 3);
        assert_eq!(s.truncate(3)?, 3);

        // Truncating in the middle removes the tail, and the store accepts
        // new appends at the truncation point.
        assert_eq!(s.truncate(1)?, 1);
        assert_eq!(s.last_index(), 1);
        assert_eq!(s.get(2)?, None);
        assert_eq!(s.append(vec![0x04])?, 2);
        s.sync()?;
        assert_eq!(
            s.scan((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded))
                .collect::<Result<Vec<_>>>()?,
            vec![vec![1], vec![4]]
        );

        // Truncating everything empties the store.
        assert_eq!(s.truncate(0)?, 0);
        assert_eq!(s.last_index(), 0);
        Ok(())
    }
}
