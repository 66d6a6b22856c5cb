use crate::config::LogConfig;
use crate::error::StorageError;
use crate::record::Record;
use crate::storage::index::Index;
use crate::storage::store::Store;
use std::fs;
use std::path::{Path, PathBuf};

/// One store/index pair covering the absolute offset range
/// `[base_offset, next_offset)`. File names carry the base offset:
/// `<base>.store` and `<base>.index`.
#[derive(Debug)]
pub struct Segment {
    store: Store,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: LogConfig,
}

impl Segment {
    pub fn open(
        dir: impl AsRef<Path>,
        base_offset: u64,
        config: LogConfig,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        let store = Store::open(segment_file(dir, base_offset, "store"))?;
        let index = Index::open(
            segment_file(dir, base_offset, "index"),
            config.max_index_bytes,
        )?;
        // Resume the append cursor from the last index entry, if any.
        let next_offset = match index.read(-1) {
            Some((rel, _)) => base_offset + u64::from(rel) + 1,
            None => base_offset,
        };
        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.next_offset
    }

    /// Appends the record, assigning it the segment's next absolute
    /// offset. Fails with `IndexFull` once the index cannot take
    /// another entry; the segment is maxed at that point.
    pub fn append(&mut self, mut record: Record) -> Result<u64, StorageError> {
        let offset = self.next_offset;
        record.offset = offset;
        let (_, position) = self.store.append(&record.encode())?;
        self.index
            .write((offset - self.base_offset) as u32, position)?;
        self.next_offset += 1;
        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> Result<Record, StorageError> {
        if !self.contains(offset) {
            return Err(StorageError::OffsetOutOfRange { offset });
        }
        let (_, position) = self
            .index
            .read((offset - self.base_offset) as i64)
            .ok_or(StorageError::OffsetOutOfRange { offset })?;
        let bytes = self.store.read(position)?;
        Ok(Record::decode(&bytes)?)
    }

    /// The segment stops accepting appends once either file reaches its
    /// configured cap.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub fn close(&mut self) -> Result<(), StorageError> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Closes the segment and unlinks both backing files.
    pub fn remove(&mut self) -> Result<(), StorageError> {
        self.close()?;
        fs::remove_file(self.index.path())?;
        fs::remove_file(self.store.path())?;
        Ok(())
    }
}

fn segment_file(dir: &Path, base_offset: u64, ext: &str) -> PathBuf {
    dir.join(format!("{base_offset}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(max_store: u64, max_index: u64) -> LogConfig {
        LogConfig {
            max_store_bytes: max_store,
            max_index_bytes: max_index,
            initial_offset: 0,
        }
    }

    #[test]
    fn appends_at_base_offset_and_fills_index() {
        let tmp = TempDir::new().unwrap();
        let mut segment = Segment::open(tmp.path(), 16, config(1024, 3 * 12)).unwrap();
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for want in 16..19u64 {
            let offset = segment.append(Record::new("hello world")).unwrap();
            assert_eq!(offset, want);
            let record = segment.read(offset).unwrap();
            assert_eq!(record.value, b"hello world");
            assert_eq!(record.offset, offset);
        }

        // Index at capacity: the fourth append fails and the segment
        // reports maxed.
        assert!(matches!(
            segment.append(Record::new("hello world")),
            Err(StorageError::IndexFull)
        ));
        assert!(segment.is_maxed());
    }

    #[test]
    fn maxes_on_store_bytes() {
        let tmp = TempDir::new().unwrap();
        let frame = Record::new("hello world").encode().len() as u64 + 8;
        let mut segment = Segment::open(tmp.path(), 0, config(3 * frame, 1024)).unwrap();
        for _ in 0..3 {
            segment.append(Record::new("hello world")).unwrap();
        }
        assert!(segment.is_maxed());
    }

    #[test]
    fn reopen_resumes_next_offset() {
        let tmp = TempDir::new().unwrap();
        {
            let mut segment = Segment::open(tmp.path(), 5, config(1024, 1024)).unwrap();
            segment.append(Record::new("one")).unwrap();
            segment.append(Record::new("two")).unwrap();
            segment.close().unwrap();
        }
        let segment = Segment::open(tmp.path(), 5, config(1024, 1024)).unwrap();
        assert_eq!(segment.next_offset(), 7);
        assert_eq!(segment.read(6).unwrap().value, b"two");
    }

    #[test]
    fn remove_unlinks_files() {
        let tmp = TempDir::new().unwrap();
        let mut segment = Segment::open(tmp.path(), 0, config(1024, 1024)).unwrap();
        segment.append(Record::new("one")).unwrap();
        segment.remove().unwrap();
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }
}
