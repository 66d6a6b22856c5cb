use crate::config::LogConfig;
use crate::error::StorageError;
use crate::record::Record;
use crate::storage::segment::Segment;
use log::debug;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Ordered collection of segments sharing one directory. The last
/// segment is the only writable one; earlier segments are read-only
/// until truncation drops them.
#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    config: LogConfig,
    segments: Vec<Segment>,
}

impl Log {
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut inner = LogInner {
            config: config.with_defaults(),
            segments: Vec::new(),
        };
        setup(&dir, &mut inner)?;
        Ok(Self {
            dir,
            inner: RwLock::new(inner),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends to the active segment, rolling to a fresh segment once
    /// the active one is maxed so the next append lands cleanly.
    pub fn append(&self, record: Record) -> Result<u64, StorageError> {
        let mut inner = self.inner.write();
        // A reopened log may come back with a full tail; roll before
        // appending rather than surfacing IndexFull to the caller.
        if inner.active().is_maxed() {
            let base = inner.active().next_offset();
            roll(&self.dir, &mut inner, base)?;
        }
        let offset = inner.active_mut().append(record)?;
        if inner.active().is_maxed() {
            roll(&self.dir, &mut inner, offset + 1)?;
        }
        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> Result<Record, StorageError> {
        let inner = self.inner.read();
        let segment = inner
            .segments
            .iter()
            .find(|segment| segment.contains(offset))
            .ok_or(StorageError::OffsetOutOfRange { offset })?;
        segment.read(offset)
    }

    pub fn lowest_offset(&self) -> u64 {
        self.inner.read().segments[0].base_offset()
    }

    pub fn highest_offset(&self) -> u64 {
        let next = self
            .inner
            .read()
            .segments
            .last()
            .map(Segment::next_offset)
            .unwrap_or(0);
        next.saturating_sub(1)
    }

    /// Drops every segment whose records all sit at or below `lowest`.
    /// Retention is by whole segments only. If nothing survives, a
    /// fresh segment is opened at `lowest + 1` so the log keeps exactly
    /// one active segment and later appends stay monotonic.
    pub fn truncate(&self, lowest: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            let next = segment.next_offset();
            if next > 0 && next - 1 <= lowest {
                debug!(
                    "event=segment_truncate dir={:?} base={}",
                    self.dir,
                    segment.base_offset()
                );
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;
        if inner.segments.is_empty() {
            let config = inner.config;
            inner
                .segments
                .push(Segment::open(&self.dir, lowest + 1, config)?);
        }
        Ok(())
    }

    /// Streaming view of the raw store bytes of every segment, in
    /// order, exactly as persisted (length prefixes included). Buffers
    /// are flushed and the store files reopened read-only, so the
    /// stream stays valid even if truncation later unlinks them.
    pub fn reader(&self) -> Result<LogReader, StorageError> {
        let inner = self.inner.write();
        let mut parts = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            let store = segment.store();
            store.flush()?;
            parts.push((File::open(store.path())?, store.size()));
        }
        Ok(LogReader { parts, current: 0 })
    }

    pub fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        for segment in &mut inner.segments {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> Result<(), StorageError> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Removes everything and recreates one empty segment at the
    /// configured initial offset.
    pub fn reset(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        for segment in &mut inner.segments {
            segment.close()?;
        }
        inner.segments.clear();
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        setup(&self.dir, &mut inner)?;
        Ok(())
    }

    /// Reset with a new initial offset; used when adopting a snapshot
    /// whose first record starts past zero.
    pub fn reset_at(&self, initial_offset: u64) -> Result<(), StorageError> {
        self.inner.write().config.initial_offset = initial_offset;
        self.reset()
    }
}

impl LogInner {
    fn active(&self) -> &Segment {
        self.segments.last().expect("log keeps an active segment")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments
            .last_mut()
            .expect("log keeps an active segment")
    }
}

fn roll(dir: &Path, inner: &mut LogInner, base_offset: u64) -> Result<(), StorageError> {
    debug!("event=segment_roll dir={dir:?} base={base_offset}");
    inner
        .segments
        .push(Segment::open(dir, base_offset, inner.config)?);
    Ok(())
}

/// Scans the directory for `<base>.store`/`<base>.index` pairs and
/// reopens them in base-offset order; an empty directory gets one
/// fresh segment at the configured initial offset.
fn setup(dir: &Path, inner: &mut LogInner) -> Result<(), StorageError> {
    let mut base_offsets = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(stem) = name
            .strip_suffix(".store")
            .or_else(|| name.strip_suffix(".index"))
        else {
            continue;
        };
        let base = stem
            .parse::<u64>()
            .map_err(|_| StorageError::MalformedFileName(name.into_owned()))?;
        base_offsets.insert(base);
    }
    for base in base_offsets {
        inner.segments.push(Segment::open(dir, base, inner.config)?);
    }
    if inner.segments.is_empty() {
        inner
            .segments
            .push(Segment::open(dir, inner.config.initial_offset, inner.config)?);
    }
    Ok(())
}

/// Concatenated read-only view over the store files captured by
/// `Log::reader`. Each part is bounded to the size observed at capture
/// time.
pub struct LogReader {
    parts: Vec<(File, u64)>,
    current: usize,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current < self.parts.len() {
            let (file, remaining) = &mut self.parts[self.current];
            if *remaining == 0 {
                self.current += 1;
                continue;
            }
            let want = buf.len().min(*remaining as usize);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                self.current += 1;
                continue;
            }
            *remaining -= n as u64;
            return Ok(n);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::LEN_WIDTH;
    use tempfile::TempDir;

    fn config(max_store: u64, max_index: u64, initial: u64) -> LogConfig {
        LogConfig {
            max_store_bytes: max_store,
            max_index_bytes: max_index,
            initial_offset: initial,
        }
    }

    fn small() -> LogConfig {
        // One record per segment: a "hello world" body is 35 bytes,
        // 43 framed.
        config(32, 1024, 0)
    }

    #[test]
    fn appends_assign_contiguous_offsets() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), LogConfig::default()).unwrap();
        for want in 0..3u64 {
            assert_eq!(log.append(Record::new("hello world")).unwrap(), want);
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.read(1).unwrap().value, b"hello world");
    }

    #[test]
    fn read_past_tail_is_out_of_range() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small()).unwrap();
        log.append(Record::new("hello world")).unwrap();
        assert_eq!(log.read(0).unwrap().value, b"hello world");
        assert!(matches!(
            log.read(1),
            Err(StorageError::OffsetOutOfRange { offset: 1 })
        ));
    }

    #[test]
    fn rolls_segments_at_index_capacity() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), config(1024 * 1024, 3 * 12, 0)).unwrap();
        for want in 0..3u64 {
            assert_eq!(log.append(Record::new("hello world")).unwrap(), want);
        }
        // The third append maxed the segment; the fourth lands on a
        // fresh one based at 3.
        assert_eq!(log.append(Record::new("hello world")).unwrap(), 3);
        assert_eq!(log.highest_offset(), 3);
        assert_eq!(log.read(3).unwrap().offset, 3);
    }

    #[test]
    fn reopen_preserves_offsets_and_records() {
        let tmp = TempDir::new().unwrap();
        {
            let log = Log::open(tmp.path(), small()).unwrap();
            for _ in 0..3 {
                log.append(Record::new("hello world")).unwrap();
            }
            log.close().unwrap();
        }
        let log = Log::open(tmp.path(), small()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        for offset in 0..3u64 {
            let record = log.read(offset).unwrap();
            assert_eq!(record.offset, offset);
            assert_eq!(record.value, b"hello world");
        }
    }

    #[test]
    fn truncate_drops_whole_segments() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small()).unwrap();
        for _ in 0..3 {
            log.append(Record::new("hello world")).unwrap();
        }
        log.truncate(1).unwrap();
        assert!(matches!(
            log.read(0),
            Err(StorageError::OffsetOutOfRange { offset: 0 })
        ));
        assert!(log.lowest_offset() > 1);
        assert_eq!(log.read(2).unwrap().value, b"hello world");
    }

    #[test]
    fn truncate_everything_keeps_log_usable() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small()).unwrap();
        for _ in 0..3 {
            log.append(Record::new("hello world")).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.lowest_offset(), 3);
        assert_eq!(log.append(Record::new("next")).unwrap(), 3);
    }

    #[test]
    fn reader_streams_framed_store_bytes() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), LogConfig::default()).unwrap();
        let appended = Record::new("hello world");
        log.append(appended.clone()).unwrap();

        let mut bytes = Vec::new();
        log.reader().unwrap().read_to_end(&mut bytes).unwrap();
        let body_len = u64::from_be_bytes(bytes[..8].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), LEN_WIDTH as usize + body_len);
        let record = Record::decode(&bytes[8..]).unwrap();
        assert_eq!(record.value, appended.value);
        assert_eq!(record.offset, 0);
    }

    #[test]
    fn reset_at_adopts_new_initial_offset() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), LogConfig::default()).unwrap();
        log.append(Record::new("hello world")).unwrap();
        log.reset_at(40).unwrap();
        assert_eq!(log.append(Record::new("hello world")).unwrap(), 40);
        assert_eq!(log.lowest_offset(), 40);
    }
}
