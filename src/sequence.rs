use std::fmt;

use crate::consts::{SEQUENCE_RANGE, WINDOW_SIZE};

/// A wrapping sequence number in `0..SEQUENCE_RANGE`.
///
/// Sequence ids are never compared by raw value. Use [`distance`](SequenceId::distance)
/// or [`is_valid_successor`](SequenceId::is_valid_successor) instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceId(u16);

impl SequenceId {
    pub const MAX: SequenceId = SequenceId(SEQUENCE_RANGE - 1);

    /// Creates a sequence id, wrapping `value` into range.
    pub fn new(value: u16) -> Self {
        Self(value % SEQUENCE_RANGE)
    }
    pub fn value(self) -> u16 {
        self.0
    }
    pub fn next(self) -> Self {
        Self((self.0 + 1) % SEQUENCE_RANGE)
    }
    /// Steps `n` positions backwards.
    pub fn back(self, n: u16) -> Self {
        Self((self.0 + SEQUENCE_RANGE - n % SEQUENCE_RANGE) % SEQUENCE_RANGE)
    }
    /// Circular forward distance from `self` to `other`. Zero means equal.
    pub fn distance(self, other: SequenceId) -> u16 {
        (other.0 + SEQUENCE_RANGE - self.0) % SEQUENCE_RANGE
    }
    /// Returns true if `next` lies 1 to `WINDOW_SIZE` steps ahead of `self`.
    pub fn is_valid_successor(self, next: SequenceId) -> bool {
        (1..=WINDOW_SIZE).contains(&self.distance(next))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bit `i` set means the packet `i` steps before the newest received one arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveMask(u32);

impl ReceiveMask {
    pub fn new(bits: u32) -> Self {
        Self(bits)
    }
    pub fn bits(self) -> u32 {
        self.0
    }
    /// Slides the window forward by `steps` and records the newest packet as received.
    /// The `steps - 1` positions skipped over are recorded as lost.
    pub(crate) fn advance(self, steps: u16) -> Self {
        let shifted = if u32::from(steps) >= u32::BITS {
            0
        } else {
            self.0 << steps
        };
        Self(shifted | 1)
    }
    /// Whether the packet `steps_back` before the newest one was received.
    pub fn is_received(self, steps_back: u16) -> bool {
        u32::from(steps_back) < u32::BITS && (self.0 >> steps_back) & 1 == 1
    }
}

impl fmt::Display for ReceiveMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032b}", self.0)
    }
}

/// A bounded counter where zero is reserved as the end-of-channel marker.
///
/// Wrapping past [`ChannelId::MAX`] continues at 1, never at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u8);

impl ChannelId {
    pub const END: ChannelId = ChannelId(0);
    pub const FIRST: ChannelId = ChannelId(1);
    pub const MAX: ChannelId = ChannelId(u8::MAX);

    pub fn new(value: u8) -> Self {
        Self(value)
    }
    pub fn value(self) -> u8 {
        self.0
    }
    pub fn is_end(self) -> bool {
        self == Self::END
    }
    pub fn next(self) -> Self {
        match self.0 {
            u8::MAX => Self::FIRST,
            value => Self(value + 1),
        }
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::FIRST
    }
}
