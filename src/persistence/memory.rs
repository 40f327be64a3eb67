//! In-memory storage backend, used when persistence is disabled and in tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::backend::{Collection, PersistenceOp, StorageBackend};
use super::error::Result;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: DashMap<(Collection, String), Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .get(&(collection, key.to_string()))
            .map(|v| v.clone()))
    }

    async fn put(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()> {
        self.data.insert((collection, key.to_string()), value.to_vec());
        Ok(())
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<()> {
        self.data.remove(&(collection, key.to_string()));
        Ok(())
    }

    async fn entries(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries: Vec<_> = self
            .data
            .iter()
            .filter(|e| e.key().0 == collection)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        for op in ops {
            match op {
                PersistenceOp::Put {
                    collection,
                    key,
                    value,
                } => {
                    self.data.insert((collection, key), value);
                }
                PersistenceOp::Remove { collection, key } => {
                    self.data.remove(&(collection, key));
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
