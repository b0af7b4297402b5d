use std::{io, net::SocketAddr};

use crate::{pool::PooledBuffer, sequence::SequenceId};

/// The session byte that follows the reliability header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMode {
    Normal = 0,
    OutOfBand = 1,
}

impl PacketMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketMode::Normal),
            1 => Some(PacketMode::OutOfBand),
            _ => None,
        }
    }
}

/// An outgoing datagram in a pooled buffer. Headers are already written;
/// application data is appended through [`io::Write`].
#[derive(Debug)]
pub struct OutPacket {
    buf: PooledBuffer,
    sequence_id: SequenceId,
    is_reliable: bool,
    is_oob: bool,
}

impl OutPacket {
    pub(crate) fn new(
        buf: PooledBuffer,
        sequence_id: SequenceId,
        is_reliable: bool,
        is_oob: bool,
    ) -> Self {
        Self {
            buf,
            sequence_id,
            is_reliable,
            is_oob,
        }
    }
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }
    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }
    pub fn is_oob(&self) -> bool {
        self.is_oob
    }
    /// Bytes left before the packet reaches the connection MTU.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }
    pub(crate) fn buffer(&self) -> &PooledBuffer {
        &self.buf
    }
}

impl io::Write for OutPacket {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.len() > self.buf.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "packet would exceed mtu of {} bytes ({} remaining, {} requested)",
                    self.buf.mtu(),
                    self.buf.remaining(),
                    data.len()
                ),
            ));
        }
        self.buf.as_vec_mut().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An application packet handed out by [`Session::receive`](crate::Session::receive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InPacket {
    pub(crate) payload: Vec<u8>,
    pub(crate) sequence_id: Option<SequenceId>,
    pub(crate) is_oob: bool,
    pub(crate) from: SocketAddr,
}

impl InPacket {
    /// The sequence id of a reliable packet, `None` for unreliable ones.
    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.sequence_id
    }
    pub fn is_reliable(&self) -> bool {
        self.sequence_id.is_some()
    }
    pub fn is_oob(&self) -> bool {
        self.is_oob
    }
    pub fn peer_addr(&self) -> SocketAddr {
        self.from
    }
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    pub fn reader(&self) -> io::Cursor<&[u8]> {
        io::Cursor::new(&self.payload[..])
    }
}
