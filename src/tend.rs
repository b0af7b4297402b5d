use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    consts::{RELIABLE_HEADER_SIZE, SEQUENCE_BITS, UNRELIABLE_HEADER_SIZE},
    incoming::IncomingLogic,
    outgoing::{DeliveryInfo, OrderError, OutgoingLogic},
    sequence::{ReceiveMask, SequenceId},
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too many reliable packets in flight ({0})")]
    TooManyInFlight(u16),
    #[error("packet too small for a header ({0} bytes)")]
    Truncated(usize),
    #[error("malformed header: {0}")]
    Malformed(#[from] io::Error),
    #[error("reliable packet received before the connection was established")]
    NotConnected,
    #[error("packet {0} is a duplicate or out of order")]
    OutOfOrder(SequenceId),
    #[error(transparent)]
    StaleAck(#[from] OrderError),
}

/// Reliability information carried by reliable packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    pub packet_id: SequenceId,
    pub received_id: SequenceId,
    pub receive_mask: ReceiveMask,
}

/// The reliability header at the front of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TendHeader {
    Unreliable,
    Reliable(ReliableHeader),
}

impl TendHeader {
    const RELIABLE_FLAG: u64 = 1 << 55;
    const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

    pub fn is_reliable(&self) -> bool {
        matches!(self, TendHeader::Reliable(_))
    }
    pub fn size(&self) -> usize {
        match self {
            TendHeader::Unreliable => UNRELIABLE_HEADER_SIZE,
            TendHeader::Reliable(_) => RELIABLE_HEADER_SIZE,
        }
    }
    // layout, most significant bit first: flag:1 packet_id:11 received_id:11 mask:32 pad:1
    pub fn write(&self, writer: &mut impl WriteBytesExt) -> io::Result<()> {
        match self {
            TendHeader::Unreliable => writer.write_u8(0),
            TendHeader::Reliable(header) => {
                let packed = Self::RELIABLE_FLAG
                    | u64::from(header.packet_id.value()) << 44
                    | u64::from(header.received_id.value()) << 33
                    | u64::from(header.receive_mask.bits()) << 1;
                writer.write_uint::<BigEndian>(packed, RELIABLE_HEADER_SIZE)
            }
        }
    }
    pub fn read(reader: &mut impl ReadBytesExt) -> io::Result<Self> {
        let first = reader.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(TendHeader::Unreliable);
        }
        let rest = reader.read_uint::<BigEndian>(RELIABLE_HEADER_SIZE - 1)?;
        let packed = u64::from(first) << ((RELIABLE_HEADER_SIZE - 1) * 8) | rest;
        Ok(TendHeader::Reliable(ReliableHeader {
            packet_id: SequenceId::new((packed >> 44 & Self::SEQUENCE_MASK) as u16),
            received_id: SequenceId::new((packed >> 33 & Self::SEQUENCE_MASK) as u16),
            receive_mask: ReceiveMask::new((packed >> 1) as u32),
        }))
    }
}

/// A header that passed ordering checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedHeader {
    pub header: TendHeader,
    /// The header told us something new about our own reliable sends.
    pub did_ack: bool,
}

/// Selective reliability engine: writes and reads [`TendHeader`]s and reports
/// the fate of every reliable packet sent.
#[derive(Debug, Default)]
pub struct Tend {
    incoming: IncomingLogic,
    outgoing: OutgoingLogic,
    connected: bool,
}

impl Tend {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_connected(&self) -> bool {
        self.connected
    }
    /// Reliable packets are ignored until this is set.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
    pub fn incoming(&self) -> &IncomingLogic {
        &self.incoming
    }
    pub fn outgoing(&self) -> &OutgoingLogic {
        &self.outgoing
    }
    pub fn outgoing_sequence_id(&self) -> SequenceId {
        self.outgoing.outgoing_sequence_id()
    }
    /// True when every reliable packet sent so far has been reported on by the remote.
    pub fn can_send(&self) -> bool {
        self.outgoing.in_flight() == 0
    }
    /// Writes the header for the next packet and returns it.
    pub fn write_header(
        &self,
        writer: &mut impl WriteBytesExt,
        is_reliable: bool,
    ) -> Result<TendHeader, Error> {
        let header = if is_reliable {
            if !self.outgoing.can_increment_outgoing_sequence() {
                return Err(Error::TooManyInFlight(self.outgoing.in_flight()));
            }
            TendHeader::Reliable(ReliableHeader {
                packet_id: self.outgoing.outgoing_sequence_id(),
                received_id: self.incoming.last_received_to_us(),
                receive_mask: self.incoming.receive_mask(),
            })
        } else {
            TendHeader::Unreliable
        };
        header.write(writer)?;
        Ok(header)
    }
    /// Reads and validates a header. Any error means the packet must be dropped;
    /// none of them affect the connection.
    ///
    /// Newly learned delivery results are queued for [`dequeue_delivery`](Tend::dequeue_delivery).
    pub fn read_header(&mut self, reader: &mut io::Cursor<&[u8]>) -> Result<ReceivedHeader, Error> {
        let remaining = reader.get_ref().len().saturating_sub(reader.position() as usize);
        if remaining < UNRELIABLE_HEADER_SIZE {
            return Err(Error::Truncated(remaining));
        }
        let header = TendHeader::read(reader)?;
        let TendHeader::Reliable(reliable) = header else {
            return Ok(ReceivedHeader {
                header,
                did_ack: false,
            });
        };
        if !self.connected {
            return Err(Error::NotConnected);
        }
        // a bad ack must leave the receive window untouched
        self.outgoing.check_ack(reliable.received_id)?;
        if !self.incoming.received_to_us(reliable.packet_id) {
            return Err(Error::OutOfOrder(reliable.packet_id));
        }
        let did_ack = self
            .outgoing
            .received_by_remote(reliable.received_id, reliable.receive_mask)?;
        Ok(ReceivedHeader { header, did_ack })
    }
    pub fn dequeue_delivery(&mut self) -> Option<DeliveryInfo> {
        self.outgoing.dequeue()
    }
    pub fn on_packet_sent(&mut self, sequence_id: SequenceId, is_reliable: bool) {
        if is_reliable && sequence_id == self.outgoing.outgoing_sequence_id() {
            self.outgoing.increase_outgoing_sequence_id();
        }
    }
    /// A fresh reliable packet may only carry the current outgoing id.
    pub fn is_valid_seq_to_send(&self, sent: SequenceId) -> bool {
        self.outgoing.last_received_by_remote().is_valid_successor(sent)
            && sent == self.outgoing.outgoing_sequence_id()
    }
}
