use crate::error::StorageError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Width of the big-endian length prefix framing every record.
pub(crate) const LEN_WIDTH: u64 = 8;

/// Append-only file of length-prefixed records. Writes go through a
/// buffer that is flushed before any read and on close; `size` counts
/// committed file bytes plus buffered bytes, so it is always the byte
/// position of the next frame.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    buf: BufWriter<File>,
    size: u64,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                buf: BufWriter::new(file),
                size,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one framed record and returns `(bytes_written, position)`.
    /// `bytes_written` includes the length prefix.
    pub fn append(&self, bytes: &[u8]) -> Result<(u64, u64), StorageError> {
        let mut inner = self.inner.lock();
        let position = inner.size;
        inner.buf.write_all(&(bytes.len() as u64).to_be_bytes())?;
        inner.buf.write_all(bytes)?;
        let written = LEN_WIDTH + bytes.len() as u64;
        inner.size += written;
        Ok((written, position))
    }

    /// Reads the record framed at `position`. Flushes the write buffer
    /// first; this is the only durability step before reads.
    pub fn read(&self, position: u64) -> Result<Vec<u8>, StorageError> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        let mut file = inner.buf.get_ref();
        file.seek(SeekFrom::Start(position))?;
        let mut len = [0u8; LEN_WIDTH as usize];
        read_frame_exact(&mut file, &mut len, position)?;
        let mut body = vec![0u8; u64::from_be_bytes(len) as usize];
        read_frame_exact(&mut file, &mut body, position)?;
        Ok(body)
    }

    /// Positional read into `buf`; returns the number of bytes read,
    /// which is short at end-of-file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        let mut file = inner.buf.get_ref();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.inner.lock().buf.flush()?;
        Ok(())
    }

    /// Flushes buffered writes. The file handle itself closes on drop.
    pub fn close(&self) -> Result<(), StorageError> {
        self.flush()
    }
}

fn read_frame_exact(
    file: &mut &File,
    buf: &mut [u8],
    position: u64,
) -> Result<(), StorageError> {
    file.read_exact(buf).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            StorageError::Decode { position }
        } else {
            StorageError::Io(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"hello world";

    #[test]
    fn append_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("a.store")).unwrap();
        let width = LEN_WIDTH + PAYLOAD.len() as u64;
        for i in 0..4u64 {
            let (written, position) = store.append(PAYLOAD).unwrap();
            assert_eq!(written, width);
            assert_eq!(position + written, width * (i + 1));
        }
        for i in 0..4u64 {
            assert_eq!(store.read(width * i).unwrap(), PAYLOAD);
        }
    }

    #[test]
    fn read_at_returns_raw_frames() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("a.store")).unwrap();
        store.append(PAYLOAD).unwrap();
        let mut prefix = [0u8; LEN_WIDTH as usize];
        assert_eq!(
            store.read_at(&mut prefix, 0).unwrap(),
            LEN_WIDTH as usize
        );
        assert_eq!(u64::from_be_bytes(prefix), PAYLOAD.len() as u64);
        let mut body = vec![0u8; PAYLOAD.len()];
        store.read_at(&mut body, LEN_WIDTH).unwrap();
        assert_eq!(body, PAYLOAD);
    }

    #[test]
    fn survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.store");
        let (_, position) = {
            let store = Store::open(&path).unwrap();
            let out = store.append(PAYLOAD).unwrap();
            store.close().unwrap();
            out
        };
        let store = Store::open(&path).unwrap();
        assert_eq!(store.read(position).unwrap(), PAYLOAD);
        assert_eq!(store.size(), LEN_WIDTH + PAYLOAD.len() as u64);
    }

    #[test]
    fn torn_tail_reads_as_decode_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.store");
        let store = Store::open(&path).unwrap();
        store.append(PAYLOAD).unwrap();
        store.close().unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(LEN_WIDTH + 3).unwrap();
        drop(file);
        let store = Store::open(&path).unwrap();
        assert!(matches!(
            store.read(0),
            Err(StorageError::Decode { position: 0 })
        ));
    }
}
