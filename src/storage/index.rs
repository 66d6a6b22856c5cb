use crate::error::StorageError;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Bytes per index entry: u32 relative offset + u64 store position,
/// both big-endian.
pub(crate) const ENTRY_WIDTH: u64 = 12;
const OFF_WIDTH: usize = 4;

/// Fixed-width table mapping a segment-relative record offset to its
/// byte position in the companion store. The backing file is grown to
/// `max_bytes` up front (the mapping cannot be resized) and trimmed
/// back to the in-use prefix on close.
#[derive(Debug)]
pub struct Index {
    file: File,
    path: PathBuf,
    mmap: Option<MmapMut>,
    size: u64,
}

impl Index {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        // Stat before growing: a cleanly closed index was trimmed to
        // its live size, which is exactly what we must resume from.
        let size = file.metadata()?.len();
        file.set_len(max_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            path,
            mmap: Some(mmap),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of live entries.
    pub fn entries(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    /// Appends one entry, or fails with `IndexFull` when the mapping
    /// has no room for another 12 bytes.
    pub fn write(&mut self, rel_offset: u32, position: u64) -> Result<(), StorageError> {
        let mmap = self.mmap.as_mut().expect("index mapping closed");
        if self.size + ENTRY_WIDTH > mmap.len() as u64 {
            return Err(StorageError::IndexFull);
        }
        let at = self.size as usize;
        mmap[at..at + OFF_WIDTH].copy_from_slice(&rel_offset.to_be_bytes());
        mmap[at + OFF_WIDTH..at + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Reads the entry at `at`, where `-1` selects the last entry.
    /// Returns `None` when the index is empty or `at` is past the
    /// in-use prefix.
    pub fn read(&self, at: i64) -> Option<(u32, u64)> {
        if self.size == 0 {
            return None;
        }
        let n = if at == -1 {
            self.entries() - 1
        } else {
            at as u64
        };
        if (n + 1) * ENTRY_WIDTH > self.size {
            return None;
        }
        let mmap = self.mmap.as_ref().expect("index mapping closed");
        let at = (n * ENTRY_WIDTH) as usize;
        let rel = u32::from_be_bytes(mmap[at..at + OFF_WIDTH].try_into().unwrap());
        let pos = u64::from_be_bytes(
            mmap[at + OFF_WIDTH..at + ENTRY_WIDTH as usize]
                .try_into()
                .unwrap(),
        );
        Some((rel, pos))
    }

    /// Syncs and unmaps the mapping, then trims the zero padding. The
    /// unmap must precede the truncate; truncating a mapped file
    /// corrupts the mapping on some platforms.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
            drop(mmap);
        }
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_entries() {
        let tmp = TempDir::new().unwrap();
        let mut index = Index::open(tmp.path().join("a.index"), 1024).unwrap();
        assert!(index.read(-1).is_none());
        index.write(0, 0).unwrap();
        index.write(1, 19).unwrap();
        assert_eq!(index.read(0), Some((0, 0)));
        assert_eq!(index.read(1), Some((1, 19)));
        assert_eq!(index.read(-1), Some((1, 19)));
        assert!(index.read(2).is_none());
    }

    #[test]
    fn rejects_write_past_capacity() {
        let tmp = TempDir::new().unwrap();
        let mut index = Index::open(tmp.path().join("a.index"), 2 * ENTRY_WIDTH).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 19).unwrap();
        assert!(matches!(
            index.write(2, 38),
            Err(StorageError::IndexFull)
        ));
    }

    #[test]
    fn close_trims_padding_and_reopen_resumes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.index");
        let mut index = Index::open(&path, 1024).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 19).unwrap();
        index.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENTRY_WIDTH);

        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.read(-1), Some((1, 19)));
        assert_eq!(index.entries(), 2);
    }
}
