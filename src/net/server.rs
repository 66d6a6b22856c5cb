use crate::error::{NetError, RaftError};
use crate::net::{
    read_frame, write_response, Connection, STATUS_ERR, STATUS_NOT_FOUND, STATUS_OK,
};
use crate::record::Record;
use crate::replication::node::RpcHandle;
use crate::replication::DistributedLog;
use crate::storage::Log;
use log::{debug, warn};
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Application RPC opcodes on `CLIENT_RPC` connections.
pub(crate) const OP_PRODUCE: u8 = 1;
pub(crate) const OP_CONSUME: u8 = 2;
pub(crate) const OP_CONSUME_STREAM: u8 = 3;

/// Poll interval while a consume stream waits at the log tail.
const TAIL_POLL: Duration = Duration::from_millis(25);

/// The capability the RPC surface needs from a log. Both the local
/// `Log` and the replicated `DistributedLog` provide it.
pub trait CommitLog: Send + Sync {
    fn append(&self, record: Record) -> Result<u64, RaftError>;
    fn read(&self, offset: u64) -> Result<Record, RaftError>;
}

impl CommitLog for Log {
    fn append(&self, record: Record) -> Result<u64, RaftError> {
        Ok(Log::append(self, record)?)
    }

    fn read(&self, offset: u64) -> Result<Record, RaftError> {
        Ok(Log::read(self, offset)?)
    }
}

impl CommitLog for DistributedLog {
    fn append(&self, record: Record) -> Result<u64, RaftError> {
        DistributedLog::append(self, record)
    }

    fn read(&self, offset: u64) -> Result<Record, RaftError> {
        DistributedLog::read(self, offset)
    }
}

/// Serves one inbound consensus peer connection: frames in, node
/// responses out, until the peer hangs up.
pub fn serve_peer_connection(mut conn: Connection, handle: RpcHandle) {
    loop {
        let (opcode, payload) = match read_frame(&mut conn) {
            Ok(frame) => frame,
            Err(NetError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!("event=peer_read_error error={err}");
                return;
            }
        };
        let outcome = handle.handle(opcode, payload);
        let result = match outcome {
            Ok(response) => write_response(&mut conn, STATUS_OK, &response),
            Err(err) => write_response(&mut conn, STATUS_ERR, err.to_string().as_bytes()),
        };
        if let Err(err) = result {
            debug!("event=peer_write_error error={err}");
            return;
        }
    }
}

/// Serves one application RPC connection until the client hangs up or
/// the node shuts down.
pub fn serve_client_connection(
    mut stream: TcpStream,
    log: Arc<dyn CommitLog>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let (opcode, payload) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(NetError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!("event=client_read_error error={err}");
                return;
            }
        };
        let result = match opcode {
            OP_PRODUCE => handle_produce(&mut stream, &*log, &payload),
            OP_CONSUME => handle_consume(&mut stream, &*log, &payload),
            OP_CONSUME_STREAM => {
                handle_consume_stream(&mut stream, &*log, &payload, &shutdown);
                return;
            }
            other => write_response(
                &mut stream,
                STATUS_ERR,
                format!("unknown opcode {other}").as_bytes(),
            ),
        };
        if result.is_err() {
            return;
        }
    }
}

fn handle_produce(
    stream: &mut TcpStream,
    log: &dyn CommitLog,
    payload: &[u8],
) -> Result<(), NetError> {
    let record = match Record::decode(payload) {
        Ok(record) => record,
        Err(err) => return write_response(stream, STATUS_ERR, err.to_string().as_bytes()),
    };
    match log.append(record) {
        Ok(offset) => write_response(stream, STATUS_OK, &offset.to_le_bytes()),
        Err(err) => write_response(stream, STATUS_ERR, err.to_string().as_bytes()),
    }
}

fn handle_consume(
    stream: &mut TcpStream,
    log: &dyn CommitLog,
    payload: &[u8],
) -> Result<(), NetError> {
    let offset = match decode_offset(payload) {
        Ok(offset) => offset,
        Err(err) => return write_response(stream, STATUS_ERR, err.to_string().as_bytes()),
    };
    match log.read(offset) {
        Ok(record) => write_response(stream, STATUS_OK, &record.encode()),
        Err(err) if is_out_of_range(&err) => {
            write_response(stream, STATUS_NOT_FOUND, err.to_string().as_bytes())
        }
        Err(err) => write_response(stream, STATUS_ERR, err.to_string().as_bytes()),
    }
}

/// Streams records from `start` onward. At the tail the loop polls for
/// new records instead of ending the stream; the stream ends when the
/// client closes its side or the node shuts down.
fn handle_consume_stream(
    stream: &mut TcpStream,
    log: &dyn CommitLog,
    payload: &[u8],
    shutdown: &AtomicBool,
) {
    let mut offset = match decode_offset(payload) {
        Ok(offset) => offset,
        Err(err) => {
            let _ = write_response(stream, STATUS_ERR, err.to_string().as_bytes());
            return;
        }
    };
    if stream.set_read_timeout(Some(TAIL_POLL)).is_err() {
        return;
    }
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match log.read(offset) {
            Ok(record) => {
                if write_response(stream, STATUS_OK, &record.encode()).is_err() {
                    return;
                }
                offset += 1;
            }
            Err(err) if is_out_of_range(&err) => {
                if client_hung_up(stream) {
                    return;
                }
            }
            Err(err) => {
                warn!("event=consume_stream_error offset={offset} error={err}");
                let _ = write_response(stream, STATUS_ERR, err.to_string().as_bytes());
                return;
            }
        }
    }
}

/// The client sends nothing after starting a stream, so any read
/// observing EOF means it is gone; a timeout just means it is idle.
fn client_hung_up(stream: &mut TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.read(&mut probe) {
        Ok(_) => true,
        Err(err) => !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
    }
}

fn is_out_of_range(err: &RaftError) -> bool {
    matches!(err, RaftError::Storage(inner) if inner.is_offset_out_of_range())
}

fn decode_offset(payload: &[u8]) -> Result<u64, NetError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| NetError::Protocol("offset payload must be 8 bytes".into()))?;
    Ok(u64::from_le_bytes(bytes))
}
