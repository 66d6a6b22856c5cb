use crate::config::LogConfig;
use crate::error::{RaftError, StorageError};
use crate::record::Record;
use crate::replication::Entry;
use crate::storage::Log;
use std::path::Path;

/// Presents the journal `Log` as the consensus log store. The journal
/// is 1-indexed: its first segment is based at offset 1 so consensus
/// index and record offset coincide.
#[derive(Debug)]
pub struct JournalStore {
    log: Log,
}

impl JournalStore {
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self, RaftError> {
        let config = LogConfig {
            initial_offset: 1,
            ..config
        };
        Ok(Self {
            log: Log::open(dir, config)?,
        })
    }

    /// Lowest retained index; `last_index + 1` when fully compacted.
    pub fn first_index(&self) -> u64 {
        self.log.lowest_offset()
    }

    /// Highest appended index; zero when nothing was ever appended.
    pub fn last_index(&self) -> u64 {
        self.log.highest_offset()
    }

    pub fn entry(&self, index: u64) -> Result<Entry, RaftError> {
        let record = self.log.read(index)?;
        Ok(Entry {
            index: record.offset,
            term: record.term,
            kind: record.kind,
            command: record.value,
        })
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry(index).ok().map(|entry| entry.term)
    }

    /// Entries in `[from, to]`, capped at `max` items.
    pub fn entries(&self, from: u64, to: u64, max: usize) -> Result<Vec<Entry>, RaftError> {
        let mut out = Vec::new();
        let mut index = from;
        while index <= to && out.len() < max {
            out.push(self.entry(index)?);
            index += 1;
        }
        Ok(out)
    }

    pub fn append(&self, entries: &[Entry]) -> Result<(), RaftError> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(RaftError::NonSequentialAppend {
                    expected,
                    attempted: entry.index,
                });
            }
            self.log.append(Record {
                value: entry.command.clone(),
                offset: 0,
                term: entry.term,
                kind: entry.kind,
            })?;
        }
        Ok(())
    }

    /// Drops the conflicting suffix starting at `from`. The log itself
    /// only truncates prefixes, so the surviving prefix is re-read and
    /// the log rebuilt from it.
    pub fn truncate_suffix(&self, from: u64) -> Result<(), RaftError> {
        let first = self.first_index();
        if from > self.last_index() {
            return Ok(());
        }
        if from <= first {
            self.log.reset_at(from)?;
            return Ok(());
        }
        let mut kept = Vec::with_capacity((from - first) as usize);
        for index in first..from {
            kept.push(self.entry(index)?);
        }
        self.log.reset_at(first)?;
        for entry in kept {
            self.log.append(Record {
                value: entry.command,
                offset: 0,
                term: entry.term,
                kind: entry.kind,
            })?;
        }
        Ok(())
    }

    /// Prefix compaction after a snapshot: drops every segment whose
    /// entries all sit at or below `max`.
    pub fn delete_range(&self, max: u64) -> Result<(), RaftError> {
        self.log.truncate(max)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() == 0
    }

    pub fn close(&self) -> Result<(), StorageError> {
        self.log.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn journal(tmp: &TempDir) -> JournalStore {
        JournalStore::open(tmp.path(), LogConfig::default()).unwrap()
    }

    #[test]
    fn starts_one_indexed_and_empty() {
        let tmp = TempDir::new().unwrap();
        let store = journal(&tmp);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn appends_sequentially_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let store = journal(&tmp);
        store
            .append(&[
                Entry::command(1, 1, b"a".to_vec()),
                Entry::command(2, 1, b"b".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(2).unwrap().command, b"b");
        assert_eq!(store.term_at(2), Some(1));
        assert!(matches!(
            store.append(&[Entry::command(5, 1, Vec::new())]),
            Err(RaftError::NonSequentialAppend {
                expected: 3,
                attempted: 5
            })
        ));
    }

    #[test]
    fn truncate_suffix_rewrites_tail() {
        let tmp = TempDir::new().unwrap();
        let store = journal(&tmp);
        store
            .append(&[
                Entry::command(1, 1, b"a".to_vec()),
                Entry::command(2, 1, b"b".to_vec()),
                Entry::command(3, 1, b"c".to_vec()),
            ])
            .unwrap();
        store.truncate_suffix(2).unwrap();
        assert_eq!(store.last_index(), 1);
        store
            .append(&[Entry::command(2, 2, b"x".to_vec())])
            .unwrap();
        assert_eq!(store.entry(2).unwrap().term, 2);
        assert_eq!(store.entry(2).unwrap().command, b"x");
    }

    #[test]
    fn delete_range_compacts_prefix() {
        let tmp = TempDir::new().unwrap();
        let store = JournalStore::open(
            tmp.path(),
            LogConfig {
                max_store_bytes: 32,
                ..Default::default()
            },
        )
        .unwrap();
        for index in 1..=4u64 {
            store
                .append(&[Entry::command(index, 1, b"payload".to_vec())])
                .unwrap();
        }
        store.delete_range(2).unwrap();
        assert!(store.first_index() > 2);
        assert_eq!(store.last_index(), 4);
    }
}
