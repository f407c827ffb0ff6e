use super::{Scan, Store};
use crate::error::Result;

use std::collections::HashMap;
use std::ops::Bound;

/// An in-memory log store. Data is not persisted. Primarily for testing.
pub struct Memory {
    entries: Vec<Vec<u8>>,
    metadata: HashMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new in-memory log store.
    pub fn new() -> Self {
        Self { entries: Vec::new(), metadata: HashMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Store for Memory {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        self.entries.push(entry);
        Ok(self.entries.len() as u64)
    }

    fn get(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        match index {
            0 => Ok(None),
            i => Ok(self.entries.get(i as usize - 1).cloned()),
        }
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn scan(&mut self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_> {
        let Some((start, end)) = super::resolve_range(range, self.last_index()) else {
            return Box::new(std::iter::empty());
        };
        Box::new(self.entries[start as usize - 1..=end as usize - 1].iter().cloned().map(Ok))
    }

    fn truncate(&mut self, index: u64) -> Result<u64> {
        self.entries.truncate(index as usize);
        Ok(self.entries.len() as u64)
    }

    fn get_meta(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn set_meta(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.metadata.insert(key.to_vec(), value);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
