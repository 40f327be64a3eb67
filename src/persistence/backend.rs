//! Storage backend trait for persistence.
//!
//! Backends are plain key/value stores partitioned into named collections.
//! Values are opaque bytes; the typed layer lives in [`super::models`].

use std::fmt;

use async_trait::async_trait;

use super::error::Result;
use super::models::{decode_value, LoadedData, StoredSession, StoredSessionFlags};

/// Logical collections held by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Clean-session flag per client
    Sessions,
    /// Filter/QoS pairs per client
    Subscriptions,
    /// Packet id -> message reference per client
    Inflight,
    /// Queued message references per client
    Queue,
    /// QoS 2 packet ids awaiting the second acknowledgement per client
    SecondPhase,
    /// Message contents keyed by reference
    Messages,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Sessions,
        Collection::Subscriptions,
        Collection::Inflight,
        Collection::Queue,
        Collection::SecondPhase,
        Collection::Messages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::Subscriptions => "subscriptions",
            Collection::Inflight => "inflight",
            Collection::Queue => "queue",
            Collection::SecondPhase => "second_phase",
            Collection::Messages => "messages",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence operation for batch writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceOp {
    Put {
        collection: Collection,
        key: String,
        value: Vec<u8>,
    },
    Remove {
        collection: Collection,
        key: String,
    },
}

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, collection: Collection, key: &str) -> Result<()>;

    /// All key/value pairs of a collection
    async fn entries(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>>;

    async fn keys(&self, collection: Collection) -> Result<Vec<String>> {
        Ok(self
            .entries(collection)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    /// Apply a batch of operations
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    /// Force pending writes to durable storage
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Load every session and message at startup
    async fn load_all(&self) -> Result<LoadedData> {
        let mut data = LoadedData::default();

        for (client_id, bytes) in self.entries(Collection::Sessions).await? {
            let flags: StoredSessionFlags = decode_value(&bytes)?;
            let mut session = StoredSession::new(client_id, flags.clean_session);

            if let Some(bytes) = self.get(Collection::Subscriptions, &session.client_id).await? {
                session.subscriptions = decode_value(&bytes)?;
            }
            if let Some(bytes) = self.get(Collection::Inflight, &session.client_id).await? {
                session.inflight = decode_value(&bytes)?;
            }
            if let Some(bytes) = self.get(Collection::Queue, &session.client_id).await? {
                session.queue = decode_value(&bytes)?;
            }
            if let Some(bytes) = self.get(Collection::SecondPhase, &session.client_id).await? {
                session.second_phase = decode_value(&bytes)?;
            }
            data.sessions.push(session);
        }

        for (message_ref, bytes) in self.entries(Collection::Messages).await? {
            data.messages.push((message_ref, decode_value(&bytes)?));
        }

        Ok(data)
    }
}
