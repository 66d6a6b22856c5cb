use crate::error::NetError;
use crate::net::{read_response, write_frame};
use crate::replication::node::PeerDialer;
use log::{debug, info};
use parking_lot::Mutex;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

/// Discriminator byte reserved for consensus peer traffic.
pub const RAFT_RPC: u8 = 0x01;
/// Discriminator byte for application RPC sharing the listener.
pub const CLIENT_RPC: u8 = 0x02;

/// Read/write deadline on outbound peer sessions. Inbound sessions
/// stay unbounded; a peer is allowed to idle between frames.
const PEER_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// A peer connection, optionally wrapped in TLS.
pub enum Connection {
    Plain(TcpStream),
    ServerTls(Box<StreamOwned<ServerConnection, TcpStream>>),
    ClientTls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.read(buf),
            Connection::ServerTls(stream) => stream.read(buf),
            Connection::ClientTls(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.write(buf),
            Connection::ServerTls(stream) => stream.write(buf),
            Connection::ClientTls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush(),
            Connection::ServerTls(stream) => stream.flush(),
            Connection::ClientTls(stream) => stream.flush(),
        }
    }
}

/// Adapts one TCP listener so consensus and application traffic share
/// the advertised port. The first byte of every inbound connection
/// routes it: `RAFT_RPC` connections are returned from `accept`
/// (TLS-wrapped when configured), `CLIENT_RPC` connections go to the
/// registered sink, anything else is rejected.
pub struct StreamLayer {
    listener: TcpListener,
    server_tls: Option<Arc<ServerConfig>>,
    peer_tls: Option<Arc<ClientConfig>>,
    client_sink: Option<Sender<TcpStream>>,
}

impl StreamLayer {
    pub fn new(
        listener: TcpListener,
        server_tls: Option<Arc<ServerConfig>>,
        peer_tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        Self {
            listener,
            server_tls,
            peer_tls,
            client_sink: None,
        }
    }

    /// Routes `CLIENT_RPC` connections to `sink` instead of failing
    /// the accept.
    pub fn with_client_sink(mut self, sink: Sender<TcpStream>) -> Self {
        self.client_sink = Some(sink);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts the next consensus peer connection.
    pub fn accept(&self) -> Result<Connection, NetError> {
        loop {
            let (mut stream, addr) = self.listener.accept()?;
            stream.set_nonblocking(false)?;
            let mut first = [0u8; 1];
            // A peer that hangs up before the discriminator only costs
            // this connection, not the listener.
            if let Err(err) = stream.read_exact(&mut first) {
                debug!("event=discriminator_read_error peer={addr} error={err}");
                continue;
            }
            if first[0] == RAFT_RPC {
                debug!("event=peer_accept peer={addr}");
                return match &self.server_tls {
                    Some(config) => {
                        let session = ServerConnection::new(config.clone())?;
                        Ok(Connection::ServerTls(Box::new(StreamOwned::new(
                            session, stream,
                        ))))
                    }
                    None => Ok(Connection::Plain(stream)),
                };
            }
            if first[0] == CLIENT_RPC {
                if let Some(sink) = &self.client_sink {
                    debug!("event=client_accept peer={addr}");
                    if sink.send(stream).is_ok() {
                        continue;
                    }
                }
            }
            return Err(NetError::NotRaftRpc);
        }
    }

    /// Dialer half for outbound peer sessions; shares the peer TLS
    /// configuration.
    pub fn peer_client(&self) -> PeerClient {
        PeerClient {
            peer_tls: self.peer_tls.clone(),
            sessions: Mutex::new(HashMap::new()),
            dial_timeout: Duration::from_millis(250),
        }
    }

    pub fn close(self) -> Result<(), NetError> {
        // The listener closes on drop.
        Ok(())
    }
}

/// Dials peers, writing the `RAFT_RPC` discriminator before anything
/// else, and keeps one session per address, re-dialing once on error.
pub struct PeerClient {
    peer_tls: Option<Arc<ClientConfig>>,
    sessions: Mutex<HashMap<String, Connection>>,
    dial_timeout: Duration,
}

impl PeerClient {
    pub fn dial(&self, addr: &str, timeout: Duration) -> Result<Connection, NetError> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::Protocol(format!("unresolvable peer address {addr}")))?;
        let mut stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(PEER_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(PEER_IO_TIMEOUT))?;
        stream.write_all(&[RAFT_RPC])?;
        info!("event=peer_dial peer={addr}");
        match &self.peer_tls {
            Some(config) => {
                let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
                let name = rustls::ServerName::try_from(host)
                    .map_err(|_| NetError::Protocol(format!("invalid server name {host}")))?;
                let session = ClientConnection::new(config.clone(), name)?;
                Ok(Connection::ClientTls(Box::new(StreamOwned::new(
                    session, stream,
                ))))
            }
            None => Ok(Connection::Plain(stream)),
        }
    }
}

impl PeerDialer for PeerClient {
    fn request(&self, addr: &str, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, NetError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let cached = self.sessions.lock().remove(addr);
            let mut session = match cached {
                Some(session) => session,
                None => match self.dial(addr, self.dial_timeout) {
                    Ok(session) => session,
                    Err(err) if attempts < 2 => {
                        debug!("event=peer_dial_error peer={addr} error={err}");
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };
            let outcome = write_frame(&mut session, opcode, payload)
                .and_then(|_| read_response(&mut session));
            match outcome {
                Ok(response) => {
                    self.sessions.lock().insert(addr.to_string(), session);
                    return Ok(response);
                }
                // Remote errors are definitive; transport errors get
                // one fresh session.
                Err(err @ (NetError::Remote(_) | NetError::NotFound(_))) => {
                    self.sessions.lock().insert(addr.to_string(), session);
                    return Err(err);
                }
                Err(err) if attempts < 2 => {
                    debug!("event=peer_session_error peer={addr} error={err}");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn accept_rejects_unknown_discriminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let layer = StreamLayer::new(listener, None, None);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&[0x7F]).unwrap();
        });
        assert!(matches!(layer.accept(), Err(NetError::NotRaftRpc)));
        client.join().unwrap();
    }

    #[test]
    fn accept_returns_raft_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let layer = StreamLayer::new(listener, None, None);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&[RAFT_RPC]).unwrap();
            stream.write_all(b"ping").unwrap();
        });
        let mut conn = layer.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();
    }

    #[test]
    fn client_connections_route_to_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (sink_tx, sink_rx) = std::sync::mpsc::channel();
        let layer = StreamLayer::new(listener, None, None).with_client_sink(sink_tx);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&[CLIENT_RPC]).unwrap();
            // Follow with a raft connection so accept returns.
            let mut raft = TcpStream::connect(addr).unwrap();
            raft.write_all(&[RAFT_RPC]).unwrap();
        });
        let _peer = layer.accept().unwrap();
        assert!(sink_rx.try_recv().is_ok());
        client.join().unwrap();
    }
}
