use crate::error::NetError;
use crate::net::server::{OP_CONSUME, OP_CONSUME_STREAM, OP_PRODUCE};
use crate::net::stream::CLIENT_RPC;
use crate::net::{read_response, write_frame};
use crate::record::Record;
use std::io::{ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};

/// Application RPC client over one `CLIENT_RPC` connection.
pub struct LogClient {
    stream: TcpStream,
}

impl LogClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, NetError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.write_all(&[CLIENT_RPC])?;
        Ok(Self { stream })
    }

    /// Appends one record; returns the offset the cluster assigned.
    pub fn produce(&mut self, record: &Record) -> Result<u64, NetError> {
        write_frame(&mut self.stream, OP_PRODUCE, &record.encode())?;
        decode_offset_response(read_response(&mut self.stream)?)
    }

    /// Reads the record at `offset`. An offset past the tail surfaces
    /// as `NetError::NotFound`.
    pub fn consume(&mut self, offset: u64) -> Result<Record, NetError> {
        write_frame(&mut self.stream, OP_CONSUME, &offset.to_le_bytes())?;
        let payload = read_response(&mut self.stream)?;
        Record::decode(&payload).map_err(|err| NetError::Protocol(err.to_string()))
    }

    /// Pipelines a batch of records and collects the per-record offset
    /// acknowledgements in order.
    pub fn produce_stream(
        &mut self,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Vec<u64>, NetError> {
        let mut sent = 0usize;
        for record in records {
            write_frame(&mut self.stream, OP_PRODUCE, &record.encode())?;
            sent += 1;
        }
        let mut offsets = Vec::with_capacity(sent);
        for _ in 0..sent {
            offsets.push(decode_offset_response(read_response(&mut self.stream)?)?);
        }
        Ok(offsets)
    }

    /// Switches this connection into a tailing record stream starting
    /// at `start`. The server keeps the stream open at the tail and
    /// emits records as they arrive.
    pub fn consume_stream(mut self, start: u64) -> Result<ConsumeStream, NetError> {
        write_frame(&mut self.stream, OP_CONSUME_STREAM, &start.to_le_bytes())?;
        Ok(ConsumeStream {
            stream: self.stream,
        })
    }
}

pub struct ConsumeStream {
    stream: TcpStream,
}

impl Iterator for ConsumeStream {
    type Item = Result<Record, NetError>;

    fn next(&mut self) -> Option<Self::Item> {
        match read_response(&mut self.stream) {
            Ok(payload) => {
                Some(Record::decode(&payload).map_err(|err| NetError::Protocol(err.to_string())))
            }
            Err(NetError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => None,
            Err(err) => Some(Err(err)),
        }
    }
}

fn decode_offset_response(payload: Vec<u8>) -> Result<u64, NetError> {
    let bytes: [u8; 8] = payload
        .as_slice()
        .try_into()
        .map_err(|_| NetError::Protocol("offset response must be 8 bytes".into()))?;
    Ok(u64::from_le_bytes(bytes))
}
