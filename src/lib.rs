//! Distributed, append-only commit log: segmented on-disk storage with
//! a memory-mapped index, replicated across peers by a leader-based
//! consensus module, served over one multiplexed listener.
#![deny(unused_must_use)]

pub mod agent;
pub mod config;
pub mod error;
pub mod net;
pub mod record;
pub mod replication;
pub mod storage;

pub use agent::{Agent, AgentConfig};
pub use config::{LogConfig, RaftConfig};
pub use error::{NetError, RaftError, StorageError};
pub use net::{
    load_client_config, load_server_config, CommitLog, Connection, ConsumeStream, LogClient,
    PeerClient, StreamLayer, CLIENT_RPC, RAFT_RPC,
};
pub use record::{Record, KIND_COMMAND, KIND_CONFIGURATION, KIND_NOOP};
pub use replication::{
    ClusterConfig, CommitLogFsm, DistributedLog, Entry, HardState, JournalStore, PeerDialer,
    RaftNode, ServerInfo, SnapshotMeta, SnapshotStore, StableStore, StateMachine,
};
pub use storage::{Index, Log, LogReader, Segment, Store};
