//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence,
//! one partition per collection.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{Collection, PersistenceOp, StorageBackend};
use super::error::Result;

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    sessions: PartitionHandle,
    subscriptions: PartitionHandle,
    inflight: PartitionHandle,
    queue: PartitionHandle,
    second_phase: PartitionHandle,
    messages: PartitionHandle,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let open = |collection: Collection| {
            keyspace.open_partition(collection.as_str(), PartitionCreateOptions::default())
        };

        Ok(Self {
            sessions: open(Collection::Sessions)?,
            subscriptions: open(Collection::Subscriptions)?,
            inflight: open(Collection::Inflight)?,
            queue: open(Collection::Queue)?,
            second_phase: open(Collection::SecondPhase)?,
            messages: open(Collection::Messages)?,
            keyspace,
        })
    }

    fn partition(&self, collection: Collection) -> &PartitionHandle {
        match collection {
            Collection::Sessions => &self.sessions,
            Collection::Subscriptions => &self.subscriptions,
            Collection::Inflight => &self.inflight,
            Collection::Queue => &self.queue,
            Collection::SecondPhase => &self.second_phase,
            Collection::Messages => &self.messages,
        }
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.partition(collection).get(key)?.map(|v| v.to_vec()))
    }

    async fn put(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()> {
        self.partition(collection).insert(key, value)?;
        Ok(())
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<()> {
        self.partition(collection).remove(key)?;
        Ok(())
    }

    async fn entries(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>> {
        let mut result = Vec::new();
        for item in self.partition(collection).iter() {
            let (key, value) = item?;
            result.push((String::from_utf8_lossy(&key).to_string(), value.to_vec()));
        }
        Ok(result)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::Put {
                    collection,
                    key,
                    value,
                } => batch.insert(self.partition(collection), key, value),
                PersistenceOp::Remove { collection, key } => {
                    batch.remove(self.partition(collection), key)
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // fjall handles cleanup on drop
        self.flush().await
    }
}
