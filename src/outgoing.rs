use std::collections::VecDeque;

use crate::{
    consts::WINDOW_SIZE,
    sequence::{ReceiveMask, SequenceId},
};

/// Whether a previously sent reliable packet reached the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub sequence_id: SequenceId,
    pub was_delivered: bool,
}

/// The remote acknowledged a sequence id outside the window of packets we could have sent.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("remote acknowledged {received} which does not follow {last}")]
pub struct OrderError {
    pub last: SequenceId,
    pub received: SequenceId,
}

/// Assigns outgoing sequence ids and turns the remote's ack window into [`DeliveryInfo`]s.
#[derive(Debug, Clone)]
pub struct OutgoingLogic {
    outgoing_sequence_id: SequenceId,
    last_received_by_remote: SequenceId,
    deliveries: VecDeque<DeliveryInfo>,
}

impl Default for OutgoingLogic {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingLogic {
    pub fn new() -> Self {
        Self {
            outgoing_sequence_id: SequenceId::new(0),
            last_received_by_remote: SequenceId::MAX,
            deliveries: VecDeque::new(),
        }
    }
    pub fn outgoing_sequence_id(&self) -> SequenceId {
        self.outgoing_sequence_id
    }
    pub fn last_received_by_remote(&self) -> SequenceId {
        self.last_received_by_remote
    }
    /// Number of reliable packets sent that the remote has not reported on yet.
    pub fn in_flight(&self) -> u16 {
        self.last_received_by_remote
            .distance(self.outgoing_sequence_id)
            .saturating_sub(1)
    }
    pub fn can_increment_outgoing_sequence(&self) -> bool {
        self.last_received_by_remote
            .distance(self.outgoing_sequence_id)
            <= WINDOW_SIZE
    }
    pub fn increase_outgoing_sequence_id(&mut self) {
        self.outgoing_sequence_id = self.outgoing_sequence_id.next();
    }
    /// Fails if `received_id` is neither the last ack nor a valid successor of it.
    /// Does not change any state.
    pub fn check_ack(&self, received_id: SequenceId) -> Result<(), OrderError> {
        let last = self.last_received_by_remote;
        if last == received_id || last.is_valid_successor(received_id) {
            return Ok(());
        }
        Err(OrderError {
            last,
            received: received_id,
        })
    }
    /// Consumes an ack header from the remote.
    ///
    /// Returns `Ok(false)` if the header carries nothing new. Otherwise queues one
    /// [`DeliveryInfo`] per sequence id between the previous ack and `received_id`, oldest first.
    pub fn received_by_remote(
        &mut self,
        received_id: SequenceId,
        mask: ReceiveMask,
    ) -> Result<bool, OrderError> {
        self.check_ack(received_id)?;
        let last = self.last_received_by_remote;
        let steps = last.distance(received_id);
        if steps == 0 {
            return Ok(false);
        }
        for steps_back in (0..steps).rev() {
            let info = DeliveryInfo {
                sequence_id: received_id.back(steps_back),
                was_delivered: mask.is_received(steps_back),
            };
            log::trace!(
                "packet {} was {}",
                info.sequence_id,
                if info.was_delivered { "delivered" } else { "lost" }
            );
            self.deliveries.push_back(info);
        }
        self.last_received_by_remote = received_id;
        Ok(true)
    }
    pub fn dequeue(&mut self) -> Option<DeliveryInfo> {
        self.deliveries.pop_front()
    }
}
