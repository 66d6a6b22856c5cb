use crate::config::{LogConfig, RaftConfig};
use crate::error::{NetError, RaftError};
use crate::net::server::{serve_client_connection, serve_peer_connection, CommitLog};
use crate::net::stream::StreamLayer;
use crate::replication::DistributedLog;
use log::{info, warn};
use parking_lot::Mutex;
use rustls::{ClientConfig, ServerConfig};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Everything needed to run one node: replicated log, stream layer,
/// and the RPC surface, all behind a single bind address.
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub node_name: String,
    pub bootstrap: bool,
    pub log_config: LogConfig,
    pub raft: RaftConfig,
    pub server_tls: Option<Arc<ServerConfig>>,
    pub peer_tls: Option<Arc<ClientConfig>>,
}

/// Owns a node's components and their lifecycle. `new` returns a
/// running, serving node.
pub struct Agent {
    log: Arc<DistributedLog>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    shut_down_once: Mutex<bool>,
    accept_handle: Mutex<Option<thread::JoinHandle<()>>>,
    client_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, RaftError> {
        let listener = TcpListener::bind(config.bind_addr).map_err(NetError::Io)?;
        let local_addr = listener.local_addr().map_err(NetError::Io)?;
        listener.set_nonblocking(true).map_err(NetError::Io)?;

        let (client_tx, client_rx) = mpsc::channel();
        let stream_layer = StreamLayer::new(listener, config.server_tls, config.peer_tls)
            .with_client_sink(client_tx);
        let dialer = Arc::new(stream_layer.peer_client());

        let raft = RaftConfig {
            local_id: config.node_name.clone(),
            advertise_addr: local_addr.to_string(),
            bootstrap: config.bootstrap,
            ..config.raft
        };
        let log = Arc::new(DistributedLog::open(
            &config.data_dir,
            config.log_config,
            raft,
            dialer,
        )?);
        let shutdown = Arc::new(AtomicBool::new(false));
        info!(
            "event=agent_start node={} addr={local_addr}",
            config.node_name
        );

        let accept_handle = {
            let rpc_handle = log.rpc_handle();
            let flag = shutdown.clone();
            thread::Builder::new()
                .name("stream-accept".into())
                .spawn(move || {
                    while !flag.load(Ordering::SeqCst) {
                        match stream_layer.accept() {
                            Ok(conn) => {
                                let handle = rpc_handle.clone();
                                thread::spawn(move || serve_peer_connection(conn, handle));
                            }
                            Err(NetError::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                                thread::sleep(Duration::from_millis(25));
                            }
                            Err(NetError::NotRaftRpc) => {
                                warn!("event=stream_reject reason=not_raft_rpc");
                            }
                            Err(err) => {
                                warn!("event=stream_accept_error error={err}");
                                break;
                            }
                        }
                    }
                })?
        };

        let client_handle = {
            let commit_log: Arc<dyn CommitLog> = log.clone();
            let flag = shutdown.clone();
            thread::Builder::new()
                .name("client-accept".into())
                .spawn(move || {
                    while let Ok(stream) = client_rx.recv() {
                        let log = commit_log.clone();
                        let flag = flag.clone();
                        thread::spawn(move || serve_client_connection(stream, log, flag));
                    }
                })?
        };

        Ok(Self {
            log,
            local_addr,
            shutdown,
            shut_down_once: Mutex::new(false),
            accept_handle: Mutex::new(Some(accept_handle)),
            client_handle: Mutex::new(Some(client_handle)),
        })
    }

    /// The address clients and peers dial; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn log(&self) -> &DistributedLog {
        &self.log
    }

    /// Asks this node (which must be the leader) to add a voter.
    pub fn join(&self, id: impl Into<String>, addr: impl Into<String>) -> Result<(), RaftError> {
        self.log.join(id, addr)
    }

    pub fn leave(&self, id: impl Into<String>) -> Result<(), RaftError> {
        self.log.leave(id)
    }

    /// Stops serving, shuts the node down, and closes the logs.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<(), RaftError> {
        let mut done = self.shut_down_once.lock();
        if *done {
            return Ok(());
        }
        *done = true;
        self.shutdown.store(true, Ordering::SeqCst);
        self.log.shutdown()?;
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.client_handle.lock().take() {
            let _ = handle.join();
        }
        info!("event=agent_stop addr={}", self.local_addr);
        Ok(())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("event=agent_shutdown_error error={err}");
        }
    }
}
