use crate::sequence::{ReceiveMask, SequenceId};

/// Accepts or rejects incoming reliable packets and maintains the receive mask
/// that is echoed back to the remote on every reliable send.
#[derive(Debug, Clone)]
pub struct IncomingLogic {
    last_received_to_us: SequenceId,
    receive_mask: ReceiveMask,
}

impl Default for IncomingLogic {
    fn default() -> Self {
        Self::new()
    }
}

impl IncomingLogic {
    pub fn new() -> Self {
        Self {
            last_received_to_us: SequenceId::MAX,
            receive_mask: ReceiveMask::default(),
        }
    }
    pub fn last_received_to_us(&self) -> SequenceId {
        self.last_received_to_us
    }
    pub fn receive_mask(&self) -> ReceiveMask {
        self.receive_mask
    }
    /// Returns false if `next_id` is a duplicate, is behind us, or skips more than the window.
    /// The caller must discard the packet in that case.
    pub fn received_to_us(&mut self, next_id: SequenceId) -> bool {
        if !self.last_received_to_us.is_valid_successor(next_id) {
            log::trace!(
                "rejected packet {next_id}, last received was {}",
                self.last_received_to_us
            );
            return false;
        }
        let steps = self.last_received_to_us.distance(next_id);
        self.receive_mask = self.receive_mask.advance(steps);
        self.last_received_to_us = next_id;
        true
    }
}
