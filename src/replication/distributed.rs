use crate::config::{LogConfig, RaftConfig};
use crate::error::RaftError;
use crate::record::Record;
use crate::replication::fsm::{encode_append_command, CommitLogFsm};
use crate::replication::node::{PeerDialer, RaftNode, RpcHandle};
use crate::replication::{JournalStore, ServerInfo, SnapshotStore, StableStore};
use crate::storage::Log;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A log replicated across a cluster. Two sibling logs live under the
/// data directory: the user log (`log/`) that serves reads, and the
/// consensus journal (`raft/log/`) that records replicated commands.
pub struct DistributedLog {
    log: Arc<Log>,
    node: RaftNode,
}

impl DistributedLog {
    pub fn open(
        data_dir: impl AsRef<Path>,
        log_config: LogConfig,
        raft_config: RaftConfig,
        dialer: Arc<dyn PeerDialer>,
    ) -> Result<Self, RaftError> {
        let data_dir = data_dir.as_ref();
        let log = Arc::new(Log::open(data_dir.join("log"), log_config)?);
        let raft_dir = data_dir.join("raft");
        let journal = JournalStore::open(raft_dir.join("log"), log_config)?;
        let stable = StableStore::open(raft_dir.join("stable.json"))?;
        let snapshots = SnapshotStore::open(raft_dir.join("snapshots"))?;
        let fsm = Arc::new(CommitLogFsm::new(log.clone()));
        let node = RaftNode::spawn(raft_config, journal, stable, snapshots, fsm, dialer)?;
        Ok(Self { log, node })
    }

    /// Replicates the record through consensus and returns the offset
    /// the state machine assigned. Fails on followers with `NotLeader`.
    pub fn append(&self, record: Record) -> Result<u64, RaftError> {
        self.node.apply(encode_append_command(&record))
    }

    /// Relaxed-consistency read straight from the local user log; the
    /// record may not yet be acknowledged cluster-wide on this node.
    pub fn read(&self, offset: u64) -> Result<Record, RaftError> {
        Ok(self.log.read(offset)?)
    }

    pub fn lowest_offset(&self) -> u64 {
        self.log.lowest_offset()
    }

    pub fn highest_offset(&self) -> u64 {
        self.log.highest_offset()
    }

    pub fn rpc_handle(&self) -> RpcHandle {
        self.node.rpc_handle()
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    pub fn leader(&self) -> Option<ServerInfo> {
        self.node.leader()
    }

    pub fn wait_for_leader(&self, timeout: Duration) -> Result<ServerInfo, RaftError> {
        self.node.wait_for_leader(timeout)
    }

    /// Adds a voting member; leader only.
    pub fn join(&self, id: impl Into<String>, addr: impl Into<String>) -> Result<(), RaftError> {
        self.node.add_server(id, addr)
    }

    /// Removes a member; leader only.
    pub fn leave(&self, id: impl Into<String>) -> Result<(), RaftError> {
        self.node.remove_server(id)
    }

    pub fn snapshot(&self) -> Result<(), RaftError> {
        self.node.take_snapshot()
    }

    pub fn shutdown(&self) -> Result<(), RaftError> {
        self.node.shutdown()?;
        self.log.close()?;
        Ok(())
    }
}
