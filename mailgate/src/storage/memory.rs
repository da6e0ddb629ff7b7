use crate::storage::{Backend, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;

/// Non-persistent backend. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, i64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.entries.get(key).copied())
    }

    async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, value| *value >= cutoff);
        Ok((before - self.entries.len()) as u64)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
