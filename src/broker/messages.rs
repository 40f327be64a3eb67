//! Message store
//!
//! One entry per routed PUBLISH, shared by every delivery that references it
//! through a [`MessageRef`]. An entry lives while it has holders: each
//! delivery (queued, in flight, or handed to an online connection) is one
//! holder and releases it when the delivery completes or is dropped.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::persistence::{Collection, PersistenceManager, PersistenceOp, StoredMessage};
use crate::protocol::{Publish, QoS};
use crate::session::MessageRef;

/// A routed application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    /// QoS the message was published with
    pub qos: QoS,
    pub retain: bool,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: Arc::clone(&publish.topic),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl Message {
    /// Outbound PUBLISH for a delivery at `qos`
    pub fn to_publish(&self, qos: QoS, packet_id: Option<u16>, dup: bool) -> Publish {
        Publish {
            dup,
            qos,
            retain: false,
            topic: Arc::clone(&self.topic),
            packet_id,
            payload: self.payload.clone(),
        }
    }
}

struct Entry {
    message: Arc<Message>,
    holders: usize,
    /// Written to the messages collection
    persisted: bool,
}

/// Reference-counted message storage
pub struct MessageStore {
    entries: DashMap<MessageRef, Entry>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Store `message` for `holders` deliveries
    pub fn insert(&self, message: Message, holders: usize) -> MessageRef {
        let message_ref = MessageRef::generate();
        self.entries.insert(
            message_ref.clone(),
            Entry {
                message: Arc::new(message),
                holders,
                persisted: false,
            },
        );
        message_ref
    }

    pub fn get(&self, message_ref: &MessageRef) -> Option<Arc<Message>> {
        self.entries
            .get(message_ref)
            .map(|e| Arc::clone(&e.message))
    }

    /// Make the message durable; called when a persistent session takes a
    /// reference to it
    pub fn persist(&self, message_ref: &MessageRef) {
        let Some(ref persistence) = self.persistence else {
            return;
        };
        let Some(mut entry) = self.entries.get_mut(message_ref) else {
            return;
        };
        if entry.persisted {
            return;
        }
        match crate::persistence::encode_value(&StoredMessage::from(entry.message.as_ref())) {
            Ok(value) => {
                entry.persisted = true;
                persistence.write(PersistenceOp::Put {
                    collection: Collection::Messages,
                    key: message_ref.to_string(),
                    value,
                });
            }
            Err(e) => error!(%message_ref, "failed to encode message: {}", e),
        }
    }

    /// Drop one holder; the entry is removed when none remain
    pub fn release(&self, message_ref: &MessageRef) {
        let removed = self
            .entries
            .remove_if_mut(message_ref, |_, entry| {
                entry.holders = entry.holders.saturating_sub(1);
                entry.holders == 0
            });

        match removed {
            Some((_, entry)) => {
                if entry.persisted {
                    if let Some(ref persistence) = self.persistence {
                        persistence.write(PersistenceOp::Remove {
                            collection: Collection::Messages,
                            key: message_ref.to_string(),
                        });
                    }
                }
            }
            None if !self.entries.contains_key(message_ref) => {
                debug!(%message_ref, "release of unknown message");
            }
            None => {}
        }
    }

    /// Install messages loaded from storage.
    ///
    /// `references` lists every reference held by restored sessions, one
    /// entry per holder. Stored messages nobody references are deleted.
    pub fn restore(&self, stored: Vec<(String, StoredMessage)>, references: &[MessageRef]) -> usize {
        let mut holders: ahash::AHashMap<&MessageRef, usize> = ahash::AHashMap::new();
        for r in references {
            *holders.entry(r).or_default() += 1;
        }

        let mut restored = 0;
        for (key, stored) in stored {
            let message_ref = MessageRef::from(key);
            let Some(&count) = holders.get(&message_ref) else {
                if let Some(ref persistence) = self.persistence {
                    persistence.write(PersistenceOp::Remove {
                        collection: Collection::Messages,
                        key: message_ref.to_string(),
                    });
                }
                continue;
            };
            match Message::try_from(stored) {
                Ok(message) => {
                    self.entries.insert(
                        message_ref,
                        Entry {
                            message: Arc::new(message),
                            holders: count,
                            persisted: true,
                        },
                    );
                    restored += 1;
                }
                Err(e) => warn!(%message_ref, "dropping stored message: {}", e),
            }
        }
        restored
    }

    pub fn holders(&self, message_ref: &MessageRef) -> usize {
        self.entries.get(message_ref).map(|e| e.holders).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}
