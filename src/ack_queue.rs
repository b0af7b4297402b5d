use std::collections::VecDeque;

use crate::{oob::OobMessage, outgoing::DeliveryInfo, sequence::SequenceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOob {
    pub message: OobMessage,
    pub sequence_id: SequenceId,
}

/// Reliable out-of-band messages waiting for a delivery result, in send order.
#[derive(Debug, Default)]
pub struct OobAckQueue {
    pending: VecDeque<PendingOob>,
}

impl OobAckQueue {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.pending.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
    pub fn clear(&mut self) {
        self.pending.clear();
    }
    pub fn enqueue(&mut self, message: OobMessage, sequence_id: SequenceId) {
        self.pending.push_back(PendingOob {
            message,
            sequence_id,
        });
    }
    pub fn dequeue(&mut self) -> Option<PendingOob> {
        self.pending.pop_front()
    }
    pub fn peek(&self) -> Option<&PendingOob> {
        self.pending.front()
    }
    /// Matches a delivery result against the queue.
    ///
    /// Entries older than `info` can no longer be reported on and are discarded.
    /// Returns the message if it was lost and is worth sending again.
    pub fn resolve(&mut self, info: DeliveryInfo) -> Option<OobMessage> {
        while let Some(head) = self.peek() {
            if head.sequence_id == info.sequence_id {
                break;
            }
            if !head.sequence_id.is_valid_successor(info.sequence_id) {
                // head was sent after the reported packet, which was not out-of-band
                return None;
            }
            log::warn!(
                "discarding {} ({}) with no delivery result",
                head.message,
                head.sequence_id
            );
            self.dequeue();
        }
        let entry = self.dequeue()?;
        if info.was_delivered {
            log::trace!("{} ({}) was delivered", entry.message, entry.sequence_id);
            return None;
        }
        if entry.message.is_ack() {
            return None;
        }
        log::debug!("{} ({}) was lost", entry.message, entry.sequence_id);
        Some(entry.message)
    }
}
