/// Number of bits a [`SequenceId`](crate::SequenceId) occupies on the wire.
pub const SEQUENCE_BITS: u32 = 11;
/// Sequence ids are taken modulo this value.
pub const SEQUENCE_RANGE: u16 = 1 << SEQUENCE_BITS;
/// Width of the receive mask, and therefore the maximum number of reliable packets in flight.
pub const WINDOW_SIZE: u16 = 32;

pub const UNRELIABLE_HEADER_SIZE: usize = 1;
pub const RELIABLE_HEADER_SIZE: usize = 7; // 1 + 11 + 11 + 32 bits, rounded up
pub const MODE_HEADER_SIZE: usize = 1;

pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 1500;
pub const DEFAULT_MTU: usize = 1280;

pub const OOB_PROTOCOL_VERSION: u8 = 1;
pub const MAX_OOB_PAYLOAD_SIZE: usize = 512;

pub const DEFAULT_SEND_FREQUENCY: u16 = 20;
pub const MIN_SEND_FREQUENCY: u16 = 1;
pub const DEFAULT_DISCONNECT_TIMEOUT_SEC: f64 = 15.0;
pub const DEFAULT_PING_INTERVAL_SEC: f64 = 1.0;
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SEC: f64 = 1.0;

/// Round trip samples above this are assumed to be stale entries or clock skew.
pub const MAX_ROUND_TRIP_SEC: f64 = 10.0;
pub const LATENCY_SAMPLE_COUNT: usize = 32;

pub(crate) const SOCKET_RECV_BUF_SIZE: usize = 256 * 1024;
pub(crate) const SOCKET_SEND_BUF_SIZE: usize = 256 * 1024;
