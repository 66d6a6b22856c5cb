use crate::config::RaftConfig;
use crate::error::{NetError, RaftError};
use crate::record::{KIND_COMMAND, KIND_CONFIGURATION, KIND_NOOP};
use crate::replication::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, OP_APPEND_ENTRIES,
    OP_INSTALL_SNAPSHOT, OP_REQUEST_VOTE,
};
use crate::replication::{
    ClusterConfig, Entry, HardState, JournalStore, ServerInfo, SnapshotMeta, SnapshotStore,
    StableStore, StateMachine,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Entries shipped per append round; a lagging follower catches up
/// over successive heartbeats.
const MAX_APPEND_BATCH: usize = 64;

/// Outbound half of the peer transport. The stream layer provides the
/// production implementation; tests may substitute their own.
pub trait PeerDialer: Send + Sync {
    fn request(&self, addr: &str, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, NetError>;
}

enum NodeCommand {
    Rpc {
        opcode: u8,
        payload: Vec<u8>,
        reply: SyncSender<Result<Vec<u8>, RaftError>>,
    },
    Apply {
        command: Vec<u8>,
        reply: SyncSender<Result<u64, RaftError>>,
    },
    AddServer {
        server: ServerInfo,
        reply: SyncSender<Result<(), RaftError>>,
    },
    RemoveServer {
        id: String,
        reply: SyncSender<Result<(), RaftError>>,
    },
    TakeSnapshot {
        reply: SyncSender<Result<(), RaftError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct NodeShared {
    leader: Mutex<Option<ServerInfo>>,
    is_leader: AtomicBool,
    shutdown: AtomicBool,
}

/// Handle the stream-layer accept loop uses to feed inbound peer
/// frames into the driver thread.
#[derive(Clone)]
pub struct RpcHandle {
    tx: Sender<NodeCommand>,
    shared: Arc<NodeShared>,
}

impl RpcHandle {
    pub fn handle(&self, opcode: u8, payload: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(RaftError::Shutdown);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(NodeCommand::Rpc {
                opcode,
                payload,
                reply: reply_tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.recv().map_err(|_| RaftError::Shutdown)?
    }
}

/// Leader-based consensus driver. All state lives on one background
/// thread; callers talk to it over a command channel and block on
/// per-request reply channels.
pub struct RaftNode {
    tx: Sender<NodeCommand>,
    shared: Arc<NodeShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    apply_timeout: Duration,
}

impl RaftNode {
    pub fn spawn(
        config: RaftConfig,
        journal: JournalStore,
        stable: StableStore,
        snapshots: SnapshotStore,
        fsm: Arc<dyn StateMachine>,
        dialer: Arc<dyn PeerDialer>,
    ) -> Result<Self, RaftError> {
        let shared = Arc::new(NodeShared {
            leader: Mutex::new(None),
            is_leader: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel();
        let apply_timeout = config.apply_timeout;
        let driver = Driver::recover(config, journal, stable, snapshots, fsm, dialer, shared.clone())?;
        let handle = thread::Builder::new()
            .name("raft-driver".into())
            .spawn(move || driver.run(rx))?;
        Ok(Self {
            tx,
            shared,
            handle: Mutex::new(Some(handle)),
            apply_timeout,
        })
    }

    pub fn rpc_handle(&self) -> RpcHandle {
        RpcHandle {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Submits a command for replication and waits for the state
    /// machine's response, up to the configured apply timeout.
    pub fn apply(&self, command: Vec<u8>) -> Result<u64, RaftError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(NodeCommand::Apply {
                command,
                reply: reply_tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        match reply_rx.recv_timeout(self.apply_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RaftError::ApplyTimeout(self.apply_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RaftError::Shutdown),
        }
    }

    pub fn add_server(&self, id: impl Into<String>, addr: impl Into<String>) -> Result<(), RaftError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(NodeCommand::AddServer {
                server: ServerInfo {
                    id: id.into(),
                    addr: addr.into(),
                },
                reply: reply_tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx
            .recv_timeout(self.apply_timeout)
            .map_err(|_| RaftError::Shutdown)?
    }

    pub fn remove_server(&self, id: impl Into<String>) -> Result<(), RaftError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(NodeCommand::RemoveServer {
                id: id.into(),
                reply: reply_tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx
            .recv_timeout(self.apply_timeout)
            .map_err(|_| RaftError::Shutdown)?
    }

    pub fn take_snapshot(&self) -> Result<(), RaftError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(NodeCommand::TakeSnapshot { reply: reply_tx })
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx
            .recv_timeout(self.apply_timeout)
            .map_err(|_| RaftError::Shutdown)?
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::SeqCst)
    }

    pub fn leader(&self) -> Option<ServerInfo> {
        self.shared.leader.lock().clone()
    }

    /// Polls until some node wins an election or the timeout passes.
    pub fn wait_for_leader(&self, timeout: Duration) -> Result<ServerInfo, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::NoLeader(timeout));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn shutdown(&self) -> Result<(), RaftError> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tx.send(NodeCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Driver {
    config: RaftConfig,
    journal: JournalStore,
    stable: StableStore,
    snapshots: SnapshotStore,
    fsm: Arc<dyn StateMachine>,
    dialer: Arc<dyn PeerDialer>,
    shared: Arc<NodeShared>,

    hard: HardState,
    role: Role,
    commit_index: u64,
    last_applied: u64,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    applied_since_snapshot: u64,
    deadline: Instant,

    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    last_contact: HashMap<String, Instant>,
    pending: BTreeMap<u64, SyncSender<Result<u64, RaftError>>>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    fn recover(
        config: RaftConfig,
        journal: JournalStore,
        stable: StableStore,
        snapshots: SnapshotStore,
        fsm: Arc<dyn StateMachine>,
        dialer: Arc<dyn PeerDialer>,
        shared: Arc<NodeShared>,
    ) -> Result<Self, RaftError> {
        let has_state =
            stable.exists() || !journal.is_empty() || !snapshots.is_empty()?;
        let mut hard = stable.load()?;
        let mut snapshot_last_index = 0;
        let mut snapshot_last_term = 0;

        if let Some(meta) = snapshots.latest()? {
            // The user state machine is itself durable; only rewind it
            // to the snapshot when it is actually behind the snapshot.
            if meta.last_index > hard.last_applied {
                let mut data = snapshots.open_data(&meta)?;
                fsm.restore(&mut data)?;
                hard.last_applied = meta.last_index;
            }
            if hard.members.servers.is_empty() {
                hard.members = meta.members.clone();
            }
            snapshot_last_index = meta.last_index;
            snapshot_last_term = meta.last_term;
        }

        // Membership changes recorded after the snapshot win.
        for index in journal.first_index()..=journal.last_index() {
            let entry = journal.entry(index)?;
            if entry.kind == KIND_CONFIGURATION {
                hard.members = serde_json::from_slice(&entry.command)?;
            }
        }

        let mut driver = Self {
            role: Role::Follower,
            commit_index: hard.last_applied,
            last_applied: hard.last_applied,
            snapshot_last_index,
            snapshot_last_term,
            applied_since_snapshot: 0,
            deadline: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_contact: HashMap::new(),
            pending: BTreeMap::new(),
            config,
            journal,
            stable,
            snapshots,
            fsm,
            dialer,
            shared,
            hard,
        };

        if driver.config.bootstrap && !has_state {
            let members = ClusterConfig::single(
                driver.config.local_id.clone(),
                driver.config.advertise_addr.clone(),
            );
            driver.hard.current_term = 1;
            driver
                .journal
                .append(&[Entry::configuration(1, 1, &members)])?;
            driver.hard.members = members;
            driver.stable.store(&driver.hard)?;
            info!(
                "event=bootstrap node={} addr={}",
                driver.config.local_id, driver.config.advertise_addr
            );
        }
        Ok(driver)
    }

    fn run(mut self, rx: Receiver<NodeCommand>) {
        self.reset_election_deadline();
        info!(
            "event=raft_start node={} term={} first={} last={}",
            self.config.local_id,
            self.hard.current_term,
            self.journal.first_index(),
            self.journal.last_index()
        );
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let timeout = self.deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(NodeCommand::Shutdown) => break,
                Ok(command) => self.dispatch(command),
                Err(RecvTimeoutError::Timeout) => self.tick(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.fail_pending(|| RaftError::Shutdown);
        if let Err(err) = self.journal.close() {
            warn!("event=journal_close_error error={err}");
        }
        info!("event=raft_stop node={}", self.config.local_id);
    }

    fn dispatch(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Rpc {
                opcode,
                payload,
                reply,
            } => {
                let response = self.handle_rpc(opcode, &payload);
                let _ = reply.try_send(response);
            }
            NodeCommand::Apply { command, reply } => self.handle_apply(command, reply),
            NodeCommand::AddServer { server, reply } => {
                let result = self.handle_membership_change(|members| {
                    members.servers.retain(|existing| existing.id != server.id);
                    members.servers.push(server.clone());
                });
                let _ = reply.try_send(result);
            }
            NodeCommand::RemoveServer { id, reply } => {
                let result = self.handle_membership_change(|members| {
                    members.servers.retain(|existing| existing.id != id);
                });
                let _ = reply.try_send(result);
            }
            NodeCommand::TakeSnapshot { reply } => {
                let _ = reply.try_send(self.take_snapshot());
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.replicate_to_all();
                if self.lease_expired() {
                    info!(
                        "event=lease_expired node={} term={}",
                        self.config.local_id, self.hard.current_term
                    );
                    self.step_down(self.hard.current_term);
                    return;
                }
                self.deadline = Instant::now() + self.config.heartbeat_interval;
            }
            Role::Follower | Role::Candidate => {
                if self.hard.members.contains(&self.config.local_id) {
                    self.start_election();
                } else {
                    // Not yet part of any configuration: wait to be
                    // contacted by a leader.
                    self.reset_election_deadline();
                }
            }
        }
    }

    fn handle_rpc(&mut self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, RaftError> {
        match opcode {
            OP_REQUEST_VOTE => {
                let request = RequestVoteRequest::decode(payload)
                    .map_err(|err| RaftError::Frame(err.to_string()))?;
                Ok(self.on_request_vote(&request).encode())
            }
            OP_APPEND_ENTRIES => {
                let request = AppendEntriesRequest::decode(payload)
                    .map_err(|err| RaftError::Frame(err.to_string()))?;
                Ok(self.on_append_entries(&request)?.encode())
            }
            OP_INSTALL_SNAPSHOT => {
                let request = InstallSnapshotRequest::decode(payload)
                    .map_err(|err| RaftError::Frame(err.to_string()))?;
                Ok(self.on_install_snapshot(&request)?.encode())
            }
            other => Err(RaftError::Frame(format!("unknown peer opcode {other}"))),
        }
    }

    fn on_request_vote(&mut self, request: &RequestVoteRequest) -> RequestVoteResponse {
        if request.term < self.hard.current_term {
            return RequestVoteResponse {
                term: self.hard.current_term,
                granted: false,
            };
        }
        if request.term > self.hard.current_term {
            self.step_down(request.term);
        }
        let (last_index, last_term) = self.last_entry_id();
        let log_ok = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);
        let can_vote = match &self.hard.voted_for {
            None => true,
            Some(candidate) => candidate == &request.candidate_id,
        };
        let granted = log_ok && can_vote;
        if granted {
            self.hard.voted_for = Some(request.candidate_id.clone());
            if let Err(err) = self.stable.store(&self.hard) {
                warn!("event=stable_store_error error={err}");
                return RequestVoteResponse {
                    term: self.hard.current_term,
                    granted: false,
                };
            }
            self.reset_election_deadline();
            debug!(
                "event=vote_granted node={} candidate={} term={}",
                self.config.local_id, request.candidate_id, request.term
            );
        }
        RequestVoteResponse {
            term: self.hard.current_term,
            granted,
        }
    }

    fn on_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        if request.term < self.hard.current_term {
            return Ok(AppendEntriesResponse {
                term: self.hard.current_term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            });
        }
        if request.term > self.hard.current_term || self.role != Role::Follower {
            self.step_down(request.term);
        }
        self.reset_election_deadline();
        self.note_leader(&request.leader_id);

        // Log-matching check on the entry before the batch.
        let last = self.journal.last_index().max(self.snapshot_last_index);
        if request.prev_log_index > self.snapshot_last_index {
            if request.prev_log_index > last {
                return Ok(AppendEntriesResponse {
                    term: self.hard.current_term,
                    success: false,
                    match_index: 0,
                    conflict_index: last + 1,
                });
            }
            let local_term = self.journal.term_at(request.prev_log_index);
            if local_term != Some(request.prev_log_term) {
                return Ok(AppendEntriesResponse {
                    term: self.hard.current_term,
                    success: false,
                    match_index: 0,
                    conflict_index: request.prev_log_index,
                });
            }
        }

        for entry in &request.entries {
            if entry.index <= self.snapshot_last_index {
                continue;
            }
            if entry.index <= self.journal.last_index() {
                if self.journal.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                // Conflicting suffix from a deposed leader.
                self.journal.truncate_suffix(entry.index)?;
            }
            self.journal.append(std::slice::from_ref(entry))?;
            if entry.kind == KIND_CONFIGURATION {
                self.adopt_configuration(&entry.command)?;
            }
        }

        let match_index = request.prev_log_index + request.entries.len() as u64;
        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(self.journal.last_index());
            self.apply_committed()?;
        }
        Ok(AppendEntriesResponse {
            term: self.hard.current_term,
            success: true,
            match_index,
            conflict_index: 0,
        })
    }

    fn on_install_snapshot(
        &mut self,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        if request.term < self.hard.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.hard.current_term,
                success: false,
            });
        }
        if request.term > self.hard.current_term || self.role != Role::Follower {
            self.step_down(request.term);
        }
        self.reset_election_deadline();
        self.note_leader(&request.leader_id);

        let members: ClusterConfig = serde_json::from_slice(&request.members)?;
        let meta = SnapshotMeta {
            last_index: request.last_index,
            last_term: request.last_term,
            members: members.clone(),
        };
        self.snapshots.create(&meta, &mut request.data.as_slice())?;
        self.fsm.restore(&mut request.data.as_slice())?;

        // Drop the whole journal: anything above the snapshot is
        // unverified, anything at or below it is covered.
        self.journal.truncate_suffix(request.last_index + 1)?;
        self.journal.delete_range(request.last_index)?;

        self.snapshot_last_index = request.last_index;
        self.snapshot_last_term = request.last_term;
        self.commit_index = request.last_index;
        self.last_applied = request.last_index;
        self.applied_since_snapshot = 0;
        self.hard.last_applied = request.last_index;
        self.hard.members = members;
        self.stable.store(&self.hard)?;
        info!(
            "event=snapshot_install node={} index={} term={}",
            self.config.local_id, request.last_index, request.last_term
        );
        Ok(InstallSnapshotResponse {
            term: self.hard.current_term,
            success: true,
        })
    }

    fn handle_apply(&mut self, command: Vec<u8>, reply: SyncSender<Result<u64, RaftError>>) {
        if self.role != Role::Leader {
            let _ = reply.try_send(Err(self.not_leader()));
            return;
        }
        let index = self.journal.last_index() + 1;
        let entry = Entry::command(index, self.hard.current_term, command);
        if let Err(err) = self.journal.append(std::slice::from_ref(&entry)) {
            let _ = reply.try_send(Err(err));
            return;
        }
        self.pending.insert(index, reply);
        self.replicate_to_all();
    }

    fn handle_membership_change(
        &mut self,
        mutate: impl FnOnce(&mut ClusterConfig),
    ) -> Result<(), RaftError> {
        if self.role != Role::Leader {
            return Err(self.not_leader());
        }
        let mut members = self.hard.members.clone();
        mutate(&mut members);
        let index = self.journal.last_index() + 1;
        let entry = Entry::configuration(index, self.hard.current_term, &members);
        self.journal.append(std::slice::from_ref(&entry))?;
        // The new configuration takes effect as soon as it is
        // appended, not when it commits.
        self.adopt_configuration(&entry.command)?;
        for server in &members.servers {
            if server.id != self.config.local_id {
                self.next_index.entry(server.id.clone()).or_insert(1);
                self.match_index.entry(server.id.clone()).or_insert(0);
            }
        }
        self.replicate_to_all();
        Ok(())
    }

    fn adopt_configuration(&mut self, command: &[u8]) -> Result<(), RaftError> {
        let members: ClusterConfig = serde_json::from_slice(command)?;
        info!(
            "event=membership node={} servers={}",
            self.config.local_id,
            members.servers.len()
        );
        self.hard.members = members;
        self.stable.store(&self.hard)?;
        Ok(())
    }

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.hard.current_term += 1;
        self.hard.voted_for = Some(self.config.local_id.clone());
        if let Err(err) = self.stable.store(&self.hard) {
            warn!("event=stable_store_error error={err}");
            self.reset_election_deadline();
            return;
        }
        let term = self.hard.current_term;
        let (last_index, last_term) = self.last_entry_id();
        debug!(
            "event=election_start node={} term={}",
            self.config.local_id, term
        );
        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.local_id.clone(),
            last_log_index: last_index,
            last_log_term: last_term,
        };
        let encoded = match request.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("event=vote_encode_error error={err}");
                self.reset_election_deadline();
                return;
            }
        };

        let mut votes = 1usize;
        let peers: Vec<ServerInfo> = self.peers();
        for peer in peers {
            match self.dialer.request(&peer.addr, OP_REQUEST_VOTE, &encoded) {
                Ok(bytes) => match RequestVoteResponse::decode(&bytes) {
                    Ok(response) if response.term > self.hard.current_term => {
                        self.step_down(response.term);
                        return;
                    }
                    Ok(response) if response.granted => votes += 1,
                    Ok(_) => {}
                    Err(err) => debug!("event=vote_decode_error peer={} error={err}", peer.id),
                },
                Err(err) => debug!("event=vote_request_error peer={} error={err}", peer.id),
            }
        }
        if votes >= self.hard.members.quorum() {
            self.become_leader();
        } else {
            self.reset_election_deadline();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.shared.is_leader.store(true, Ordering::SeqCst);
        *self.shared.leader.lock() = Some(ServerInfo {
            id: self.config.local_id.clone(),
            addr: self.config.advertise_addr.clone(),
        });
        info!(
            "event=leader_elected node={} term={}",
            self.config.local_id, self.hard.current_term
        );
        let last = self.journal.last_index().max(self.snapshot_last_index);
        self.next_index.clear();
        self.match_index.clear();
        self.last_contact.clear();
        let now = Instant::now();
        for peer in self.peers() {
            self.next_index.insert(peer.id.clone(), last + 1);
            self.match_index.insert(peer.id.clone(), 0);
            self.last_contact.insert(peer.id, now);
        }
        // A no-op entry in the fresh term lets earlier entries commit.
        let noop = Entry::noop(self.journal.last_index() + 1, self.hard.current_term);
        if let Err(err) = self.journal.append(std::slice::from_ref(&noop)) {
            warn!("event=noop_append_error error={err}");
        }
        self.replicate_to_all();
        self.deadline = Instant::now() + self.config.heartbeat_interval;
    }

    fn step_down(&mut self, term: u64) {
        let was_leader = self.role == Role::Leader;
        self.role = Role::Follower;
        if term > self.hard.current_term {
            self.hard.current_term = term;
            self.hard.voted_for = None;
            if let Err(err) = self.stable.store(&self.hard) {
                warn!("event=stable_store_error error={err}");
            }
        }
        if was_leader {
            self.shared.is_leader.store(false, Ordering::SeqCst);
            *self.shared.leader.lock() = None;
            self.fail_pending(|| RaftError::NotLeader { leader_hint: None });
        }
        self.reset_election_deadline();
    }

    fn replicate_to_all(&mut self) {
        let peers = self.peers();
        for peer in peers {
            self.replicate_one(&peer);
        }
        self.advance_commit();
    }

    fn replicate_one(&mut self, peer: &ServerInfo) {
        let last = self.journal.last_index();
        let next = *self
            .next_index
            .entry(peer.id.clone())
            .or_insert(last + 1);
        if next < self.journal.first_index() {
            // The follower needs entries already compacted away.
            self.send_snapshot(peer);
            return;
        }
        let prev_log_index = next.saturating_sub(1);

        let prev_log_term = if prev_log_index == 0 {
            0
        } else if let Some(term) = self.journal.term_at(prev_log_index) {
            term
        } else if prev_log_index == self.snapshot_last_index {
            self.snapshot_last_term
        } else {
            // The follower needs entries we have already compacted.
            self.send_snapshot(peer);
            return;
        };

        let entries = if next <= last {
            match self.journal.entries(next, last, MAX_APPEND_BATCH) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("event=journal_read_error error={err}");
                    return;
                }
            }
        } else {
            Vec::new()
        };
        let request = AppendEntriesRequest {
            term: self.hard.current_term,
            leader_id: self.config.local_id.clone(),
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        };
        let encoded = match request.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("event=append_encode_error error={err}");
                return;
            }
        };
        match self.dialer.request(&peer.addr, OP_APPEND_ENTRIES, &encoded) {
            Ok(bytes) => match AppendEntriesResponse::decode(&bytes) {
                Ok(response) if response.term > self.hard.current_term => {
                    self.step_down(response.term);
                }
                Ok(response) if response.success => {
                    self.last_contact.insert(peer.id.clone(), Instant::now());
                    self.match_index.insert(peer.id.clone(), response.match_index);
                    self.next_index
                        .insert(peer.id.clone(), response.match_index + 1);
                }
                Ok(response) => {
                    self.last_contact.insert(peer.id.clone(), Instant::now());
                    let backoff = response.conflict_index.max(1).min(next.saturating_sub(1).max(1));
                    self.next_index.insert(peer.id.clone(), backoff);
                }
                Err(err) => debug!("event=append_decode_error peer={} error={err}", peer.id),
            },
            Err(err) => debug!("event=append_request_error peer={} error={err}", peer.id),
        }
    }

    fn send_snapshot(&mut self, peer: &ServerInfo) {
        let meta = match self.snapshots.latest() {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                if let Err(err) = self.take_snapshot() {
                    warn!("event=snapshot_error error={err}");
                    return;
                }
                match self.snapshots.latest() {
                    Ok(Some(meta)) => meta,
                    _ => return,
                }
            }
            Err(err) => {
                warn!("event=snapshot_error error={err}");
                return;
            }
        };
        let mut data = Vec::new();
        match self.snapshots.open_data(&meta) {
            Ok(mut file) => {
                if let Err(err) = std::io::Read::read_to_end(&mut file, &mut data) {
                    warn!("event=snapshot_read_error error={err}");
                    return;
                }
            }
            Err(err) => {
                warn!("event=snapshot_read_error error={err}");
                return;
            }
        }
        let members = match serde_json::to_vec(&meta.members) {
            Ok(members) => members,
            Err(err) => {
                warn!("event=snapshot_encode_error error={err}");
                return;
            }
        };
        let request = InstallSnapshotRequest {
            term: self.hard.current_term,
            leader_id: self.config.local_id.clone(),
            last_index: meta.last_index,
            last_term: meta.last_term,
            members,
            data,
        };
        let encoded = match request.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("event=snapshot_encode_error error={err}");
                return;
            }
        };
        info!(
            "event=snapshot_send node={} peer={} index={}",
            self.config.local_id, peer.id, meta.last_index
        );
        match self.dialer.request(&peer.addr, OP_INSTALL_SNAPSHOT, &encoded) {
            Ok(bytes) => match InstallSnapshotResponse::decode(&bytes) {
                Ok(response) if response.term > self.hard.current_term => {
                    self.step_down(response.term);
                }
                Ok(response) if response.success => {
                    self.last_contact.insert(peer.id.clone(), Instant::now());
                    self.match_index.insert(peer.id.clone(), meta.last_index);
                    self.next_index.insert(peer.id.clone(), meta.last_index + 1);
                }
                Ok(_) => {}
                Err(err) => debug!("event=snapshot_decode_error peer={} error={err}", peer.id),
            },
            Err(err) => debug!("event=snapshot_request_error peer={} error={err}", peer.id),
        }
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let last = self.journal.last_index();
        let mut matched: Vec<u64> = self
            .hard
            .members
            .servers
            .iter()
            .map(|server| {
                if server.id == self.config.local_id {
                    last
                } else {
                    self.match_index.get(&server.id).copied().unwrap_or(0)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.hard.members.quorum();
        if quorum == 0 || matched.len() < quorum {
            return;
        }
        let majority = matched[quorum - 1];
        if majority > self.commit_index
            && self.journal.term_at(majority) == Some(self.hard.current_term)
        {
            self.commit_index = majority;
            // Followers learn the new commit index on the next append;
            // do not let that sit for a full heartbeat interval.
            self.deadline = self
                .deadline
                .min(Instant::now() + self.config.commit_timeout);
            if let Err(err) = self.apply_committed() {
                warn!("event=apply_error error={err}");
                self.shared.shutdown.store(true, Ordering::SeqCst);
            }
        }
    }

    /// A leader out of touch with a quorum for the lease window stops
    /// serving; a fresher leader probably exists behind a partition.
    fn lease_expired(&self) -> bool {
        let lease = self.config.leader_lease_timeout;
        let now = Instant::now();
        let mut reachable = 1usize;
        for peer in self.peers() {
            let fresh = self
                .last_contact
                .get(&peer.id)
                .map_or(false, |at| now.saturating_duration_since(*at) < lease);
            if fresh {
                reachable += 1;
            }
        }
        reachable < self.hard.members.quorum()
    }

    fn apply_committed(&mut self) -> Result<(), RaftError> {
        let mut applied = false;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.journal.entry(index)?;
            let outcome = match entry.kind {
                KIND_COMMAND => Some(self.fsm.apply(&entry.command)),
                KIND_NOOP | KIND_CONFIGURATION => None,
                other => return Err(RaftError::Frame(format!("unknown entry kind {other}"))),
            };
            self.last_applied = index;
            self.applied_since_snapshot += 1;
            if let Some(reply) = self.pending.remove(&index) {
                if let Some(result) = outcome {
                    let _ = reply.try_send(result);
                } else {
                    let _ = reply.try_send(Ok(index));
                }
            } else if let Some(Err(err)) = outcome {
                warn!("event=fsm_apply_error index={index} error={err}");
            }
            applied = true;
        }
        if applied {
            self.hard.last_applied = self.last_applied;
            self.stable.store(&self.hard)?;
            self.maybe_snapshot();
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.applied_since_snapshot < threshold {
            return;
        }
        if let Err(err) = self.take_snapshot() {
            warn!("event=snapshot_error error={err}");
        }
    }

    /// Persists the state machine and compacts the journal up to the
    /// applied boundary.
    fn take_snapshot(&mut self) -> Result<(), RaftError> {
        if self.last_applied == 0 || self.last_applied <= self.snapshot_last_index {
            return Ok(());
        }
        let term = self
            .journal
            .term_at(self.last_applied)
            .unwrap_or(self.snapshot_last_term);
        let meta = SnapshotMeta {
            last_index: self.last_applied,
            last_term: term,
            members: self.hard.members.clone(),
        };
        let mut data = self.fsm.snapshot()?;
        self.snapshots.create(&meta, &mut *data)?;
        self.journal.delete_range(self.last_applied)?;
        self.snapshot_last_index = self.last_applied;
        self.snapshot_last_term = term;
        self.applied_since_snapshot = 0;
        Ok(())
    }

    fn last_entry_id(&self) -> (u64, u64) {
        let last = self.journal.last_index();
        if last > 0 {
            if let Some(term) = self.journal.term_at(last) {
                return (last, term);
            }
        }
        (self.snapshot_last_index, self.snapshot_last_term)
    }

    fn peers(&self) -> Vec<ServerInfo> {
        self.hard
            .members
            .servers
            .iter()
            .filter(|server| server.id != self.config.local_id)
            .cloned()
            .collect()
    }

    fn note_leader(&mut self, leader_id: &str) {
        let addr = self
            .hard
            .members
            .addr_of(leader_id)
            .unwrap_or_default()
            .to_string();
        *self.shared.leader.lock() = Some(ServerInfo {
            id: leader_id.to_string(),
            addr,
        });
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader_hint: self.shared.leader.lock().as_ref().map(|info| info.id.clone()),
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> RaftError) {
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.try_send(Err(err()));
        }
    }

    fn reset_election_deadline(&mut self) {
        let base = self.config.election_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        self.deadline = Instant::now() + Duration::from_millis(base + jitter);
    }
}
