use thiserror::Error;

/// Entry kind for plain user records.
pub const KIND_COMMAND: u32 = 0;
/// Entry kind for leader no-op barrier entries in the journal.
pub const KIND_NOOP: u32 = 1;
/// Entry kind for replicated membership changes in the journal.
pub const KIND_CONFIGURATION: u32 = 2;

/// The unit of storage: an opaque value plus the metadata assigned on
/// append. `term` and `kind` are only meaningful for journal entries;
/// user records carry zero for both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub value: Vec<u8>,
    pub offset: u64,
    pub term: u64,
    pub kind: u32,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    /// Deterministic binary body. The store frames this with its own
    /// big-endian length prefix; nothing here is self-delimiting.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.value.len());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordFrameError> {
        if bytes.len() < 24 {
            return Err(RecordFrameError::Truncated);
        }
        let offset = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let term = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let kind = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let value_len = u32::from_le_bytes(bytes[20..24].try_into().unwrap()) as usize;
        if bytes.len() < 24 + value_len {
            return Err(RecordFrameError::Truncated);
        }
        Ok(Self {
            value: bytes[24..24 + value_len].to_vec(),
            offset,
            term,
            kind,
        })
    }
}

#[derive(Debug, Error)]
pub enum RecordFrameError {
    #[error("record body truncated")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let record = Record {
            value: b"hello world".to_vec(),
            offset: 42,
            term: 7,
            kind: KIND_COMMAND,
        };
        let decoded = Record::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn rejects_truncated_body() {
        let record = Record::new("payload");
        let encoded = record.encode();
        assert!(Record::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Record::decode(&encoded[..10]).is_err());
    }
}
