//! Serializable data models for persistence.
//!
//! Storage-friendly versions of runtime types, encoded with bincode.

use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::backend::{Collection, PersistenceOp};
use super::error::{PersistenceError, Result};
use crate::broker::Message;
use crate::protocol::QoS;
use crate::session::{MessageRef, Session};

/// Encode a value using bincode
pub fn encode_value<T: Encode>(value: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
}

/// Decode a value using bincode
pub fn decode_value<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(PersistenceError::from)
}

/// Value of the `sessions` collection
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSessionFlags {
    pub clean_session: bool,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

/// Stored in-flight delivery
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflight {
    pub packet_id: u16,
    pub message_ref: String,
}

/// Stored QoS 2 bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StoredSecondPhase {
    /// Outbound ids that got PUBREC and await PUBCOMP
    pub outbound: Vec<u16>,
    /// Inbound ids that got PUBREC and await PUBREL
    pub inbound: Vec<u16>,
}

impl StoredSecondPhase {
    fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}

/// Stored message content
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// A session assembled from all per-client collections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub client_id: String,
    pub clean_session: bool,
    pub subscriptions: Vec<StoredSubscription>,
    pub inflight: Vec<StoredInflight>,
    pub queue: Vec<String>,
    pub second_phase: StoredSecondPhase,
}

/// Data loaded at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub sessions: Vec<StoredSession>,
    pub messages: Vec<(String, StoredMessage)>,
}

impl StoredSession {
    pub fn new(client_id: String, clean_session: bool) -> Self {
        Self {
            client_id,
            clean_session,
            subscriptions: Vec::new(),
            inflight: Vec::new(),
            queue: Vec::new(),
            second_phase: StoredSecondPhase::default(),
        }
    }

    /// Write operations storing this session, one per collection.
    /// Empty collections are removed rather than stored.
    pub fn to_ops(&self) -> Result<Vec<PersistenceOp>> {
        let key = &self.client_id;
        let mut ops = Vec::with_capacity(5);

        ops.push(put(
            Collection::Sessions,
            key,
            &StoredSessionFlags {
                clean_session: self.clean_session,
            },
        )?);
        ops.push(put_or_remove(
            Collection::Subscriptions,
            key,
            &self.subscriptions,
            self.subscriptions.is_empty(),
        )?);
        ops.push(put_or_remove(
            Collection::Inflight,
            key,
            &self.inflight,
            self.inflight.is_empty(),
        )?);
        ops.push(put_or_remove(
            Collection::Queue,
            key,
            &self.queue,
            self.queue.is_empty(),
        )?);
        ops.push(put_or_remove(
            Collection::SecondPhase,
            key,
            &self.second_phase,
            self.second_phase.is_empty(),
        )?);

        Ok(ops)
    }

    /// Operations deleting every record of `client_id`
    pub fn delete_ops(client_id: &str) -> Vec<PersistenceOp> {
        [
            Collection::Sessions,
            Collection::Subscriptions,
            Collection::Inflight,
            Collection::Queue,
            Collection::SecondPhase,
        ]
        .into_iter()
        .map(|collection| PersistenceOp::Remove {
            collection,
            key: client_id.to_string(),
        })
        .collect()
    }
}

fn put<T: Encode>(collection: Collection, key: &str, value: &T) -> Result<PersistenceOp> {
    Ok(PersistenceOp::Put {
        collection,
        key: key.to_string(),
        value: encode_value(value)?,
    })
}

fn put_or_remove<T: Encode>(
    collection: Collection,
    key: &str,
    value: &T,
    empty: bool,
) -> Result<PersistenceOp> {
    if empty {
        Ok(PersistenceOp::Remove {
            collection,
            key: key.to_string(),
        })
    } else {
        put(collection, key, value)
    }
}

// ============================================================================
// Conversion implementations
// ============================================================================

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        let mut subscriptions: Vec<_> = session
            .subscriptions
            .iter()
            .map(|(filter, qos)| StoredSubscription {
                filter: filter.to_string(),
                qos: *qos as u8,
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        let inflight = session
            .delivery
            .in_flight()
            .map(|(packet_id, message_ref)| StoredInflight {
                packet_id,
                message_ref: message_ref.to_string(),
            })
            .collect();

        let mut inbound: Vec<u16> = session.awaiting_release.iter().copied().collect();
        inbound.sort_unstable();

        Self {
            client_id: session.client_id.to_string(),
            clean_session: session.clean_session,
            subscriptions,
            inflight,
            queue: session
                .delivery
                .queued()
                .map(|message_ref| message_ref.to_string())
                .collect(),
            second_phase: StoredSecondPhase {
                outbound: session.delivery.second_phase_ids(),
                inbound,
            },
        }
    }
}

impl StoredSession {
    /// Rebuild the runtime session; entries with an invalid QoS are dropped
    pub fn into_session(self, max_queued_messages: usize) -> Session {
        let mut session = Session::new(Arc::from(self.client_id), self.clean_session);
        session.delivery.set_max_queued(max_queued_messages);

        for sub in self.subscriptions {
            if let Some(qos) = QoS::from_u8(sub.qos) {
                session.subscriptions.insert(Arc::from(sub.filter), qos);
            }
        }
        for inflight in self.inflight {
            session
                .delivery
                .mark_in_flight(inflight.packet_id, MessageRef::from(inflight.message_ref));
        }
        for message_ref in self.queue {
            session.delivery.enqueue(MessageRef::from(message_ref));
        }
        for id in self.second_phase.outbound {
            session.delivery.mark_second_phase(id);
        }
        session.awaiting_release.extend(self.second_phase.inbound);

        session
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            retain: message.retain,
        }
    }
}

impl TryFrom<StoredMessage> for Message {
    type Error = PersistenceError;

    fn try_from(stored: StoredMessage) -> Result<Self> {
        let qos = QoS::from_u8(stored.qos)
            .ok_or_else(|| PersistenceError::Corruption(format!("invalid QoS {}", stored.qos)))?;
        Ok(Message {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos,
            retain: stored.retain,
        })
    }
}
