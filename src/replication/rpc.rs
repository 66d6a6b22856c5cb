use crate::replication::Entry;
use thiserror::Error;

const VOTE_VERSION: u8 = 1;
const APPEND_VERSION: u8 = 1;
const SNAPSHOT_VERSION: u8 = 1;

/// Opcodes carried on peer connections after the stream-layer
/// discriminator byte.
pub const OP_REQUEST_VOTE: u8 = 1;
pub const OP_APPEND_ENTRIES: u8 = 2;
pub const OP_INSTALL_SNAPSHOT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl RequestVoteRequest {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let candidate = self.candidate_id.as_bytes();
        if candidate.len() > u16::MAX as usize {
            return Err(FrameError::IdTooLong {
                len: candidate.len(),
            });
        }
        let mut buf = Vec::with_capacity(28 + candidate.len());
        buf.push(VOTE_VERSION);
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.last_log_index.to_le_bytes());
        buf.extend_from_slice(&self.last_log_term.to_le_bytes());
        buf.extend_from_slice(&(candidate.len() as u16).to_le_bytes());
        buf.extend_from_slice(candidate);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = Cursor::new(bytes);
        cursor.version(VOTE_VERSION)?;
        let term = cursor.u64()?;
        let last_log_index = cursor.u64()?;
        let last_log_term = cursor.u64()?;
        let candidate_id = cursor.string()?;
        Ok(Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

impl RequestVoteResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10);
        buf.push(VOTE_VERSION);
        buf.push(u8::from(self.granted));
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 10 {
            return Err(FrameError::Truncated);
        }
        if bytes[0] != VOTE_VERSION {
            return Err(FrameError::InvalidVersion {
                observed: bytes[0],
                expected: VOTE_VERSION,
            });
        }
        Ok(Self {
            granted: bytes[1] & 0x01 == 0x01,
            term: u64::from_le_bytes(bytes[2..10].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<Entry>,
}

impl AppendEntriesRequest {
    pub fn heartbeat(term: u64, leader_id: impl Into<String>, leader_commit: u64) -> Self {
        Self {
            term,
            leader_id: leader_id.into(),
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit,
            entries: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let leader = self.leader_id.as_bytes();
        if leader.len() > u16::MAX as usize {
            return Err(FrameError::IdTooLong { len: leader.len() });
        }
        if self.entries.len() > u16::MAX as usize {
            return Err(FrameError::TooManyEntries {
                count: self.entries.len(),
            });
        }
        let mut buf = Vec::with_capacity(64 + leader.len());
        buf.push(APPEND_VERSION);
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_index.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_term.to_le_bytes());
        buf.extend_from_slice(&self.leader_commit.to_le_bytes());
        buf.extend_from_slice(&(leader.len() as u16).to_le_bytes());
        buf.extend_from_slice(leader);
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for entry in &self.entries {
            if entry.command.len() > u32::MAX as usize {
                return Err(FrameError::PayloadTooLarge {
                    len: entry.command.len(),
                });
            }
            buf.extend_from_slice(&entry.index.to_le_bytes());
            buf.extend_from_slice(&entry.term.to_le_bytes());
            buf.extend_from_slice(&entry.kind.to_le_bytes());
            buf.extend_from_slice(&(entry.command.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry.command);
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = Cursor::new(bytes);
        cursor.version(APPEND_VERSION)?;
        let term = cursor.u64()?;
        let prev_log_index = cursor.u64()?;
        let prev_log_term = cursor.u64()?;
        let leader_commit = cursor.u64()?;
        let leader_id = cursor.string()?;
        let count = cursor.u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let index = cursor.u64()?;
            let term = cursor.u64()?;
            let kind = cursor.u32()?;
            let len = cursor.u32()? as usize;
            let command = cursor.bytes(len)?.to_vec();
            entries.push(Entry {
                index,
                term,
                kind,
                command,
            });
        }
        Ok(Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            leader_commit,
            entries,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    /// First index the follower wants when the prefix check failed.
    pub conflict_index: u64,
}

impl AppendEntriesResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(26);
        buf.push(APPEND_VERSION);
        buf.push(u8::from(self.success));
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.match_index.to_le_bytes());
        buf.extend_from_slice(&self.conflict_index.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 26 {
            return Err(FrameError::Truncated);
        }
        if bytes[0] != APPEND_VERSION {
            return Err(FrameError::InvalidVersion {
                observed: bytes[0],
                expected: APPEND_VERSION,
            });
        }
        Ok(Self {
            success: bytes[1] & 0x01 == 0x01,
            term: u64::from_le_bytes(bytes[2..10].try_into().unwrap()),
            match_index: u64::from_le_bytes(bytes[10..18].try_into().unwrap()),
            conflict_index: u64::from_le_bytes(bytes[18..26].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub last_index: u64,
    pub last_term: u64,
    /// JSON cluster configuration current as of `last_index`.
    pub members: Vec<u8>,
    pub data: Vec<u8>,
}

impl InstallSnapshotRequest {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let leader = self.leader_id.as_bytes();
        if leader.len() > u16::MAX as usize {
            return Err(FrameError::IdTooLong { len: leader.len() });
        }
        let mut buf = Vec::with_capacity(64 + self.data.len());
        buf.push(SNAPSHOT_VERSION);
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.last_index.to_le_bytes());
        buf.extend_from_slice(&self.last_term.to_le_bytes());
        buf.extend_from_slice(&(leader.len() as u16).to_le_bytes());
        buf.extend_from_slice(leader);
        buf.extend_from_slice(&(self.members.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.members);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = Cursor::new(bytes);
        cursor.version(SNAPSHOT_VERSION)?;
        let term = cursor.u64()?;
        let last_index = cursor.u64()?;
        let last_term = cursor.u64()?;
        let leader_id = cursor.string()?;
        let members_len = cursor.u32()? as usize;
        let members = cursor.bytes(members_len)?.to_vec();
        let data_len = cursor.u32()? as usize;
        let data = cursor.bytes(data_len)?.to_vec();
        Ok(Self {
            term,
            leader_id,
            last_index,
            last_term,
            members,
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

impl InstallSnapshotResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10);
        buf.push(SNAPSHOT_VERSION);
        buf.push(u8::from(self.success));
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 10 {
            return Err(FrameError::Truncated);
        }
        if bytes[0] != SNAPSHOT_VERSION {
            return Err(FrameError::InvalidVersion {
                observed: bytes[0],
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(Self {
            success: bytes[1] & 0x01 == 0x01,
            term: u64::from_le_bytes(bytes[2..10].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,
    #[error("unsupported version {observed} (expected {expected})")]
    InvalidVersion { observed: u8, expected: u8 },
    #[error("node id too long ({len} bytes)")]
    IdTooLong { len: usize },
    #[error("payload exceeds u32 limit ({len} bytes)")]
    PayloadTooLarge { len: usize },
    #[error("too many entries ({count})")]
    TooManyEntries { count: usize },
    #[error("node id is not valid UTF-8")]
    InvalidUtf8,
}

/// Bounds-checked little-endian field reader shared by the decoders.
struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn version(&mut self, expected: u8) -> Result<(), FrameError> {
        let observed = self.bytes(1)?[0];
        if observed != expected {
            return Err(FrameError::InvalidVersion { observed, expected });
        }
        Ok(())
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.bytes.len() < self.at + len {
            return Err(FrameError::Truncated);
        }
        let out = &self.bytes[self.at..self.at + len];
        self.at += len;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FrameError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_vote_round_trip() {
        let request = RequestVoteRequest {
            term: 5,
            candidate_id: "node-a".into(),
            last_log_index: 42,
            last_log_term: 4,
        };
        let decoded = RequestVoteRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn vote_response_round_trip() {
        let response = RequestVoteResponse {
            term: 6,
            granted: true,
        };
        assert_eq!(
            RequestVoteResponse::decode(&response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn append_entries_round_trip() {
        let request = AppendEntriesRequest {
            term: 7,
            leader_id: "leader-1".into(),
            prev_log_index: 9,
            prev_log_term: 6,
            leader_commit: 8,
            entries: vec![
                Entry::command(10, 7, b"cmd1".to_vec()),
                Entry::command(11, 7, b"cmd2".to_vec()),
            ],
        };
        let decoded = AppendEntriesRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn append_response_round_trip() {
        let response = AppendEntriesResponse {
            term: 8,
            success: false,
            match_index: 0,
            conflict_index: 11,
        };
        assert_eq!(
            AppendEntriesResponse::decode(&response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn install_snapshot_round_trip() {
        let request = InstallSnapshotRequest {
            term: 3,
            leader_id: "leader-1".into(),
            last_index: 17,
            last_term: 2,
            members: b"{}".to_vec(),
            data: vec![0xAB; 64],
        };
        let decoded = InstallSnapshotRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let request = AppendEntriesRequest::heartbeat(1, "l", 0);
        let encoded = request.encode().unwrap();
        assert!(matches!(
            AppendEntriesRequest::decode(&encoded[..encoded.len() - 1]),
            Err(FrameError::Truncated)
        ));
    }
}
