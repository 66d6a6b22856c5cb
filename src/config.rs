use std::time::Duration;

const DEFAULT_MAX_STORE_BYTES: u64 = 1024;
const DEFAULT_MAX_INDEX_BYTES: u64 = 1024;

/// Segment sizing for a single log directory. Zero values fall back to
/// the defaults at `Log::open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub max_store_bytes: u64,
    pub max_index_bytes: u64,
    pub initial_offset: u64,
}

impl LogConfig {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.max_store_bytes == 0 {
            self.max_store_bytes = DEFAULT_MAX_STORE_BYTES;
        }
        if self.max_index_bytes == 0 {
            self.max_index_bytes = DEFAULT_MAX_INDEX_BYTES;
        }
        self
    }
}

/// Timing and identity knobs for the replication layer.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Mandatory unique node id.
    pub local_id: String,
    /// Address peers dial to reach this node's stream layer.
    pub advertise_addr: String,
    pub heartbeat_interval: Duration,
    /// Base election timeout; the timer fires after a random duration
    /// in `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,
    /// A leader that cannot reach a quorum within this window steps
    /// down rather than serve stale appends.
    pub leader_lease_timeout: Duration,
    /// Upper bound on how long a freshly advanced commit index may sit
    /// before a heartbeat announces it to followers.
    pub commit_timeout: Duration,
    /// Upper bound a client-initiated apply waits for commit.
    pub apply_timeout: Duration,
    /// Applied-entry count that triggers a snapshot plus journal
    /// compaction. Zero disables automatic snapshots.
    pub snapshot_threshold: u64,
    /// Seed a single-node cluster when no prior state exists.
    pub bootstrap: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            advertise_addr: String::new(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(150),
            leader_lease_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(25),
            apply_timeout: Duration::from_secs(10),
            snapshot_threshold: 8192,
            bootstrap: false,
        }
    }
}
