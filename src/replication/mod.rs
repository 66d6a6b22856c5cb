//! Leader-based replication over the segmented log: wire frames, the
//! journal adapter, durable consensus state, the commit-log state
//! machine, and the node driver that ties them together.

pub mod distributed;
pub mod fsm;
pub mod log_store;
pub mod node;
pub mod rpc;
pub mod snapshot;
pub mod stable;

pub use distributed::DistributedLog;
pub use fsm::{encode_append_command, CommitLogFsm, StateMachine, CMD_APPEND};
pub use log_store::JournalStore;
pub use node::{PeerDialer, RaftNode, RpcHandle};
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use stable::{HardState, StableStore};

use crate::record::{KIND_COMMAND, KIND_CONFIGURATION, KIND_NOOP};
use serde::{Deserialize, Serialize};

/// One replicated journal entry. `index` is the 1-based consensus
/// index, carried by the journal log as the record offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: u32,
    pub command: Vec<u8>,
}

impl Entry {
    pub fn command(index: u64, term: u64, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: KIND_COMMAND,
            command,
        }
    }

    pub fn noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            kind: KIND_NOOP,
            command: Vec::new(),
        }
    }

    pub fn configuration(index: u64, term: u64, members: &ClusterConfig) -> Self {
        Self {
            index,
            term,
            kind: KIND_CONFIGURATION,
            command: serde_json::to_vec(members).expect("members serialize"),
        }
    }
}

/// Cluster membership as replicated through configuration entries and
/// persisted in the stable store and snapshot metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub addr: String,
}

impl ClusterConfig {
    pub fn single(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            servers: vec![ServerInfo {
                id: id.into(),
                addr: addr.into(),
            }],
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.iter().any(|server| server.id == id)
    }

    pub fn addr_of(&self, id: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|server| server.id == id)
            .map(|server| server.addr.as_str())
    }

    /// Votes needed for a majority of the voting set.
    pub fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }
}
