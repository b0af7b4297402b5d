//! Connection-oriented client sessions with selective reliability over unreliable datagrams.
//!
//! A [`Session`] performs the handshake with a replication server, keeps the connection alive,
//! and reports for every reliable packet whether it reached the server. Nothing is retransmitted
//! automatically except control messages; the application decides what to do about lost data.

mod ack_queue;
mod bytes;
mod consts;
mod error;
mod incoming;
mod keep_alive;
mod latency;
mod outgoing;
mod packet;
mod pacing;
mod pool;
mod sequence;
mod socket;
mod transport;

#[cfg(test)]
mod simulator;

pub mod oob;
pub mod session;
pub mod tend;

pub use ack_queue::{OobAckQueue, PendingOob};
pub use consts::{
    DEFAULT_DISCONNECT_TIMEOUT_SEC, DEFAULT_KEEP_ALIVE_INTERVAL_SEC, DEFAULT_MTU,
    DEFAULT_PING_INTERVAL_SEC, DEFAULT_SEND_FREQUENCY, LATENCY_SAMPLE_COUNT, MAX_MTU,
    MAX_OOB_PAYLOAD_SIZE, MAX_ROUND_TRIP_SEC, MIN_MTU, MIN_SEND_FREQUENCY, MODE_HEADER_SIZE,
    OOB_PROTOCOL_VERSION, RELIABLE_HEADER_SIZE, SEQUENCE_BITS, SEQUENCE_RANGE,
    UNRELIABLE_HEADER_SIZE, WINDOW_SIZE,
};
pub use error::{Error, Result};
pub use incoming::IncomingLogic;
pub use latency::{LatencyTracker, Ping};
pub use oob::{ClientId, ConnectionCloseReason, ConnectionType, OobMessage};
pub use outgoing::{DeliveryInfo, OrderError, OutgoingLogic};
pub use packet::{InPacket, OutPacket, PacketMode};
pub use pacing::SendPacer;
pub use pool::{BufferPool, PooledBuffer};
pub use sequence::{ChannelId, ReceiveMask, SequenceId};
pub use session::{ConnectSettings, Session, SessionConfig, SessionState, ValidationResponder};
pub use socket::UdpTransport;
pub use tend::{Tend, TendHeader};
pub use transport::{Transport, TransportEvent, TransportState};
