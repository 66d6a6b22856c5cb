use crate::error::RaftError;
use crate::record::Record;
use crate::storage::Log;
use std::io::{ErrorKind, Read};
use std::sync::Arc;

/// Command discriminator for replicated appends. The switch over this
/// byte is exhaustive: unknown kinds fail the apply hard rather than
/// being skipped.
pub const CMD_APPEND: u8 = 0;

/// Builds the consensus command for appending `record`: discriminator
/// byte followed by the encoded record body.
pub fn encode_append_command(record: &Record) -> Vec<u8> {
    let body = record.encode();
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(CMD_APPEND);
    buf.extend_from_slice(&body);
    buf
}

/// The deterministic interpreter the node invokes per committed entry.
/// Apply must not depend on local clocks or any state outside the
/// command bytes and the machine itself.
pub trait StateMachine: Send + Sync {
    /// Applies one committed command; returns the assigned offset.
    fn apply(&self, command: &[u8]) -> Result<u64, RaftError>;
    /// Point-in-time snapshot of the full state.
    fn snapshot(&self) -> Result<Box<dyn Read + Send>, RaftError>;
    /// Replaces the full state from a snapshot stream.
    fn restore(&self, reader: &mut dyn Read) -> Result<(), RaftError>;
}

/// State machine over the user log: committed appends land in the log,
/// snapshots are the log's raw framed byte stream.
pub struct CommitLogFsm {
    log: Arc<Log>,
}

impl CommitLogFsm {
    pub fn new(log: Arc<Log>) -> Self {
        Self { log }
    }
}

impl StateMachine for CommitLogFsm {
    fn apply(&self, command: &[u8]) -> Result<u64, RaftError> {
        let (&discriminator, body) = command
            .split_first()
            .ok_or(RaftError::Frame("empty command".into()))?;
        match discriminator {
            CMD_APPEND => {
                let record = Record::decode(body).map_err(crate::error::StorageError::from)?;
                Ok(self.log.append(record)?)
            }
            other => Err(RaftError::UnknownCommand(other)),
        }
    }

    fn snapshot(&self) -> Result<Box<dyn Read + Send>, RaftError> {
        Ok(Box::new(self.log.reader()?))
    }

    /// Reads the length-framed record stream back. The first record's
    /// offset becomes the log's new initial offset: a snapshot may
    /// start anywhere after truncation.
    fn restore(&self, reader: &mut dyn Read) -> Result<(), RaftError> {
        let mut first = true;
        let mut prefix = [0u8; 8];
        loop {
            match reader.read_exact(&mut prefix) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let mut body = vec![0u8; u64::from_be_bytes(prefix) as usize];
            reader.read_exact(&mut body)?;
            let record = Record::decode(&body).map_err(crate::error::StorageError::from)?;
            if first {
                self.log.reset_at(record.offset)?;
                first = false;
            }
            self.log.append(record)?;
        }
        Ok(())
    }
}
