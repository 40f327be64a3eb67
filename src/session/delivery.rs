//! Per-client delivery bookkeeping
//!
//! Packet identifier allocation, in-flight deliveries, the queue of
//! deliveries awaiting first transmission and the QoS 2 second-phase set.
//! A [`DeliveryState`] is owned by exactly one session.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::SessionError;

/// Opaque reference to a stored message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageRef(Arc<str>);

impl MessageRef {
    /// Fresh random reference
    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageRef {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for MessageRef {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

/// Number of usable packet identifiers (1..=65535)
const PACKET_ID_SPACE: usize = u16::MAX as usize;

/// Delivery state of one client
#[derive(Debug, Default)]
pub struct DeliveryState {
    /// Packet id -> message for deliveries awaiting acknowledgement
    in_flight: BTreeMap<u16, MessageRef>,
    /// Ids handed out and not yet acknowledged
    in_flight_ids: BTreeSet<u16>,
    /// Deliveries awaiting first transmission, oldest first
    queue: VecDeque<MessageRef>,
    /// Outbound QoS 2 ids past PUBREC, awaiting PUBCOMP
    second_phase: HashSet<u16>,
    /// Queue bound; 0 = unbounded
    max_queued: usize,
}

impl DeliveryState {
    pub fn new(max_queued: usize) -> Self {
        Self {
            max_queued,
            ..Default::default()
        }
    }

    pub fn set_max_queued(&mut self, max_queued: usize) {
        self.max_queued = max_queued;
    }

    /// Allocate a packet identifier.
    ///
    /// Starts one past the highest id in flight, wraps from 65535 to 1 and
    /// skips ids still in use. The id joins the in-flight id set until it is
    /// acknowledged. After a wrap a fresh id may equal one acknowledged
    /// moments ago; a stale duplicate ack for it would then match.
    pub fn next_packet_id(&mut self) -> Result<u16, SessionError> {
        if self.in_flight_ids.len() + self.second_phase.len() >= PACKET_ID_SPACE {
            return Err(SessionError::PacketIdsExhausted);
        }

        let mut candidate = match self.in_flight_ids.last() {
            Some(&max) => wrap_next(max),
            None => 1,
        };
        while self.in_flight_ids.contains(&candidate) || self.second_phase.contains(&candidate) {
            candidate = wrap_next(candidate);
        }

        self.in_flight_ids.insert(candidate);
        Ok(candidate)
    }

    /// Record a delivery sent under `packet_id`
    pub fn mark_in_flight(&mut self, packet_id: u16, message: MessageRef) {
        self.in_flight_ids.insert(packet_id);
        self.in_flight.insert(packet_id, message);
    }

    /// Complete the delivery sent under `packet_id`, returning its message.
    /// An unknown id changes nothing.
    pub fn acknowledge(&mut self, packet_id: u16) -> Result<MessageRef, SessionError> {
        match self.in_flight.remove(&packet_id) {
            Some(message) => {
                self.in_flight_ids.remove(&packet_id);
                Ok(message)
            }
            None => {
                warn!(packet_id, "acknowledgement for unknown packet id");
                Err(SessionError::UnknownAcknowledgement(packet_id))
            }
        }
    }

    pub fn is_in_flight(&self, packet_id: u16) -> bool {
        self.in_flight.contains_key(&packet_id)
    }

    /// In-flight deliveries in packet id order
    pub fn in_flight(&self) -> impl Iterator<Item = (u16, &MessageRef)> + '_ {
        self.in_flight.iter().map(|(id, m)| (*id, m))
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Append a delivery awaiting transmission. When the queue is full the
    /// oldest entry is evicted and returned.
    pub fn enqueue(&mut self, message: MessageRef) -> Option<MessageRef> {
        let evicted = if self.max_queued > 0 && self.queue.len() >= self.max_queued {
            let oldest = self.queue.pop_front();
            if let Some(ref oldest) = oldest {
                warn!(message = %oldest, "delivery queue full, dropping oldest entry");
            }
            oldest
        } else {
            None
        };
        self.queue.push_back(message);
        evicted
    }

    /// Take the oldest queued delivery
    pub fn dequeue(&mut self) -> Option<MessageRef> {
        self.queue.pop_front()
    }

    /// Put a delivery back at the head of the queue
    pub fn requeue_front(&mut self, message: MessageRef) {
        self.queue.push_front(message);
    }

    /// Take every queued delivery, oldest first
    pub fn dequeue_all(&mut self) -> Vec<MessageRef> {
        self.queue.drain(..).collect()
    }

    /// Remove one queued delivery; returns whether it was queued
    pub fn remove_enqueued(&mut self, message: &MessageRef) -> bool {
        match self.queue.iter().position(|m| m == message) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn queued(&self) -> impl Iterator<Item = &MessageRef> + '_ {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn mark_second_phase(&mut self, packet_id: u16) {
        self.second_phase.insert(packet_id);
    }

    /// Returns whether the id was awaiting its second acknowledgement
    pub fn clear_second_phase(&mut self, packet_id: u16) -> bool {
        self.second_phase.remove(&packet_id)
    }

    pub fn is_second_phase(&self, packet_id: u16) -> bool {
        self.second_phase.contains(&packet_id)
    }

    /// Second-phase ids in ascending order
    pub fn second_phase_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.second_phase.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop everything, returning the messages that were referenced
    pub fn clear(&mut self) -> Vec<MessageRef> {
        self.in_flight_ids.clear();
        self.second_phase.clear();
        let mut released: Vec<MessageRef> =
            std::mem::take(&mut self.in_flight).into_values().collect();
        released.extend(self.queue.drain(..));
        released
    }
}

#[inline]
fn wrap_next(id: u16) -> u16 {
    if id == u16::MAX {
        1
    } else {
        id + 1
    }
}
