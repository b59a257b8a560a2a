use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: usize, quota: usize },

    #[error("Storage rejected the write: {0}")]
    Rejected(String),

    #[error("Stored value for '{key}' is invalid: {message}")]
    Corrupt { key: String, message: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn corrupt(key: &str, message: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Entries = HashMap<String, Value>;

/// Asynchronous key/value persistence.
///
/// `get` returns only the keys that exist; absent keys are simply missing from
/// the returned map.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, keys: &[&str]) -> Result<Entries, StoreError>;
    async fn set(&self, entries: Entries) -> Result<(), StoreError>;
    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn get(&self, keys: &[&str]) -> Result<Entries, StoreError> {
        (**self).get(keys).await
    }

    async fn set(&self, entries: Entries) -> Result<(), StoreError> {
        (**self).set(entries).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        (**self).remove(keys).await
    }
}

/// In-process store, optionally bounded by a byte quota measured over the
/// serialized JSON values.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    quota: Option<usize>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Reject every subsequent write until switched back.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("store is read-only".to_string()));
        }
        Ok(())
    }
}

fn stored_size(entries: &Entries) -> usize {
    entries
        .iter()
        .map(|(key, value)| key.len() + value.to_string().len())
        .sum()
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<Entries, StoreError> {
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    async fn set(&self, new_entries: Entries) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock().await;

        if let Some(quota) = self.quota {
            let mut candidate = entries.clone();
            candidate.extend(new_entries.clone());
            let used = stored_size(&candidate);
            if used > quota {
                return Err(StoreError::QuotaExceeded { used, quota });
            }
        }

        entries.extend(new_entries);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
