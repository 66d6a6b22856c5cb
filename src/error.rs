use std::io;
use thiserror::Error;

/// Failures raised by the segmented storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("record at byte position {position} is truncated or corrupt")]
    Decode { position: u64 },
    #[error(transparent)]
    Record(#[from] crate::record::RecordFrameError),
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },
    #[error("index is full")]
    IndexFull,
    #[error("segment directory entry {0:?} is not a base offset")]
    MalformedFileName(String),
}

impl StorageError {
    /// True when a read landed past the tail of the log, which callers
    /// with tailing semantics treat as retryable.
    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self, StorageError::OffsetOutOfRange { .. })
    }
}

/// Failures raised by the replication layer.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },
    #[error("apply timed out after {0:?}")]
    ApplyTimeout(std::time::Duration),
    #[error("no leader elected within {0:?}")]
    NoLeader(std::time::Duration),
    #[error("node is shut down")]
    Shutdown,
    #[error("unknown command discriminator {0}")]
    UnknownCommand(u8),
    #[error("expected journal index {expected}, attempted {attempted}")]
    NonSequentialAppend { expected: u64, attempted: u64 },
    #[error("replication frame error: {0}")]
    Frame(String),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Failures raised by the stream layer and RPC surface.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("not a raft rpc")]
    NotRaftRpc,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote error: {0}")]
    Remote(String),
}
