//! In-process [`KvStore`] engine.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{DatabaseError, KvStore};

/// Ordered in-memory key-value store
///
/// Writes can be made to fail for keys under a given prefix, which lets
/// callers exercise their persistence-failure paths.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    failing_prefix: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put/delete on a key starting with `prefix` fail until
    /// cleared with `None`
    pub fn fail_writes_with_prefix(&self, prefix: Option<&str>) {
        let mut failing = self
            .failing_prefix
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *failing = prefix.map(str::to_string);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self, key: &str) -> Result<(), DatabaseError> {
        let failing = self
            .failing_prefix
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match failing.as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(DatabaseError::QueryError(format!(
                "write rejected for key {}",
                key
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), DatabaseError> {
        self.check_writable(key)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.check_writable(key)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
