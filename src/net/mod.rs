//! One listener per node: consensus peer traffic and application RPC
//! share the advertised port, split by a one-byte discriminator. All
//! RPC uses the same frame shape: `[opcode u8][len u32 LE][payload]`
//! with `[status u8][len u32 LE][payload]` responses.

pub mod client;
pub mod server;
pub mod stream;
pub mod tls;

pub use client::{ConsumeStream, LogClient};
pub use server::{serve_client_connection, serve_peer_connection, CommitLog};
pub use stream::{Connection, PeerClient, StreamLayer, CLIENT_RPC, RAFT_RPC};
pub use tls::{load_client_config, load_server_config};

use crate::error::NetError;
use std::io::{Read, Write};

pub(crate) const STATUS_OK: u8 = 0;
pub(crate) const STATUS_ERR: u8 = 1;
pub(crate) const STATUS_NOT_FOUND: u8 = 2;

pub(crate) fn write_frame(
    stream: &mut impl Write,
    opcode: u8,
    payload: &[u8],
) -> Result<(), NetError> {
    let mut header = [0u8; 5];
    header[0] = opcode;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_frame(stream: &mut impl Read) -> Result<(u8, Vec<u8>), NetError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((header[0], payload))
}

pub(crate) fn write_response(
    stream: &mut impl Write,
    status: u8,
    payload: &[u8],
) -> Result<(), NetError> {
    write_frame(stream, status, payload)
}

/// Reads one response frame and maps non-OK statuses to errors.
pub(crate) fn read_response(stream: &mut impl Read) -> Result<Vec<u8>, NetError> {
    let (status, payload) = read_frame(stream)?;
    match status {
        STATUS_OK => Ok(payload),
        STATUS_NOT_FOUND => Err(NetError::NotFound(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
        _ => Err(NetError::Remote(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
    }
}
