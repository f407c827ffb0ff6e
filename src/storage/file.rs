use super::{Scan, Store};
use crate::encoding;
use crate::error::Result;

use fs4::FileExt as _;
use log::{error, warn};
use std::collections::HashMap;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::Bound;
use std::path::Path;

/// An on-disk log store. Entries are stored in an append-only file as
/// sequential records, length-prefixed with a big-endian u64. Metadata is
/// stored in a separate file, rewritten and fsynced on every change.
///
/// An index of record positions and sizes is kept in memory, rebuilt by
/// scanning the file on startup. A partial trailing record (e.g. from a crash
/// during an unsynced append) is discarded during the scan.
///
/// Truncation is physical: the file is shortened to the end of the last
/// retained record, so a truncated suffix can't resurface after a restart.
pub struct File {
    /// The append-only entry file.
    file: std::fs::File,
    /// Position and size of each entry record's payload, by index - 1.
    index: Vec<(u64, u64)>,
    /// The file offset at which the next record will be written.
    write_pos: u64,
    /// Metadata cache, flushed to metadata_file on changes.
    metadata: HashMap<Vec<u8>, Vec<u8>>,
    /// The metadata file.
    metadata_file: std::fs::File,
}

impl File {
    /// Creates or opens a log store in the given directory, taking out an
    /// exclusive lock on the entry file.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("log"))?;
        file.try_lock_exclusive()?;

        let metadata_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("meta"))?;
        let metadata = match metadata_file.metadata()?.len() {
            0 => HashMap::new(),
            _ => encoding::from_reader(&metadata_file)?,
        };

        let (index, write_pos) = Self::build_index(&file)?;
        let size = file.metadata()?.len();
        if write_pos < size {
            warn!("Discarding {} bytes of partial log tail", size - write_pos);
            file.set_len(write_pos)?;
            file.sync_data()?;
        }

        Ok(Self { file, index, write_pos, metadata, metadata_file })
    }

    /// Builds the entry index by scanning the file, returning it along with
    /// the offset of the first byte past the last complete record.
    fn build_index(file: &std::fs::File) -> Result<(Vec<(u64, u64)>, u64)> {
        let size = file.metadata()?.len();
        let mut reader = std::io::BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;
        let mut index = Vec::new();
        let mut sizebuf = [0; 8];
        let mut pos = 0;
        while pos + 8 <= size {
            reader.read_exact(&mut sizebuf)?;
            let len = u64::from_be_bytes(sizebuf);
            if pos + 8 + len > size {
                break; // partial record
            }
            index.push((pos + 8, len));
            reader.seek_relative(len as i64)?;
            pos += 8 + len;
        }
        Ok((index, pos))
    }

    /// Reads the record with the given position and size.
    fn read(&mut self, pos: u64, size: u64) -> Result<Vec<u8>> {
        let mut entry = vec![0; size as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }
}

impl std::fmt::Display for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file")
    }
}

impl Store for File {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        let mut record = Vec::with_capacity(8 + entry.len());
        record.extend_from_slice(&(entry.len() as u64).to_be_bytes());
        record.extend_from_slice(&entry);
        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&record)?;
        self.index.push((self.write_pos + 8, entry.len() as u64));
        self.write_pos += record.len() as u64;
        Ok(self.index.len() as u64)
    }

    fn get(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        match index {
            0 => Ok(None),
            i => match self.index.get(i as usize - 1).copied() {
                Some((pos, size)) => Ok(Some(self.read(pos, size)?)),
                None => Ok(None),
            },
        }
    }

    fn last_index(&self) -> u64 {
        self.index.len() as u64
    }

    fn scan(&mut self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_> {
        let Some((start, end)) = super::resolve_range(range, self.last_index()) else {
            return Box::new(std::iter::empty());
        };
        let records = self.index[start as usize - 1..=end as usize - 1].to_vec();
        let file = &mut self.file;
        Box::new(records.into_iter().map(move |(pos, size)| {
            let mut entry = vec![0; size as usize];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut entry)?;
            Ok(entry)
        }))
    }

    fn truncate(&mut self, index: u64) -> Result<u64> {
        if index >= self.last_index() {
            return Ok(self.last_index());
        }
        let end = match index {
            0 => 0,
            i => {
                let (pos, size) = self.index[i as usize - 1];
                pos + size
            }
        };
        self.file.set_len(end)?;
        self.file.sync_data()?;
        self.index.truncate(index as usize);
        self.write_pos = end;
        Ok(self.last_index())
    }

    fn get_meta(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn set_meta(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.metadata.insert(key.to_vec(), value);
        self.metadata_file.set_len(0)?;
        self.metadata_file.seek(SeekFrom::Start(0))?;
        encoding::to_writer(&mut self.metadata_file, &self.metadata)?;
        self.metadata_file.sync_data()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for File {
    /// Attempts to sync the entry file on drop, in case of buffered appends.
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            error!("Failed to sync log file on close: {err}");
        }
    }
}
