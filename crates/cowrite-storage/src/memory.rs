//! In-memory storage backend

use crate::{matches_pattern, Storage, StorageError, StorageStats, StoredDocument};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development and tests.
/// Data is lost when the process exits.
///
/// Besides the records, it keeps a log of every successful `put` and can be
/// told to fail writes, which is how persistence failures are exercised.
pub struct MemoryStorage {
    data: DashMap<String, StoredDocument>,
    total_size: AtomicUsize,
    puts: Mutex<Vec<(String, u64, String)>>,
    failing: AtomicBool,
    failures_left: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            total_size: AtomicUsize::new(0),
            puts: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            failures_left: AtomicU64::new(0),
        }
    }

    /// Make every `put` fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make the next `n` puts fail
    pub fn fail_next_puts(&self, n: u64) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Successful puts so far as `(id, revision, content)`, oldest first
    pub fn put_log(&self) -> Vec<(String, u64, String)> {
        self.puts.lock().clone()
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().len()
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        Ok(self.data.get(id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, id: &str, doc: &StoredDocument) -> Result<(), StorageError> {
        if self.should_fail() {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }

        let new_size = doc.content.len();
        match self.data.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                // A put never lowers the stored revision
                if entry.get().revision > doc.revision {
                    return Ok(());
                }
                let old_size = entry.get().content.len();
                self.total_size.fetch_sub(old_size, Ordering::Relaxed);
                entry.insert(doc.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(doc.clone());
            }
        }
        self.total_size.fetch_add(new_size, Ordering::Relaxed);

        self.puts
            .lock()
            .push((id.to_string(), doc.revision, doc.content.clone()));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        match self.data.remove(id) {
            Some((_, doc)) => {
                self.total_size.fetch_sub(doc.content.len(), Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .data
            .iter()
            .filter(|entry| pattern.map_or(true, |p| matches_pattern(entry.key(), p)))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            document_count: self.data.len(),
            total_size_bytes: self.total_size.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let storage = MemoryStorage::new();
        let doc = StoredDocument::new("hello world", 3);

        storage.put("doc1", &doc).await.unwrap();

        let loaded = storage.get("doc1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "hello world");
        assert_eq!(loaded.revision, 3);
        assert!(storage.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_never_lowers_revision() {
        let storage = MemoryStorage::new();

        storage.put("doc1", &StoredDocument::new("new", 5)).await.unwrap();
        storage.put("doc1", &StoredDocument::new("old", 4)).await.unwrap();

        let loaded = storage.get("doc1").await.unwrap().unwrap();
        assert_eq!(loaded.revision, 5);
        assert_eq!(loaded.content, "new");
        assert_eq!(storage.put_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let storage = MemoryStorage::new();
        storage.fail_next_puts(2);

        let doc = StoredDocument::new("x", 1);
        assert!(storage.put("doc1", &doc).await.is_err());
        assert!(storage.put("doc1", &doc).await.is_err());
        assert!(storage.put("doc1", &doc).await.is_ok());

        storage.set_failing(true);
        assert!(storage.put("doc1", &StoredDocument::new("y", 2)).await.is_err());
        storage.set_failing(false);
        assert!(storage.put("doc1", &StoredDocument::new("y", 2)).await.is_ok());
        assert_eq!(storage.put_log().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let storage = MemoryStorage::new();

        for i in 0..3 {
            let id = format!("team:{}", i);
            storage.put(&id, &StoredDocument::new("data", 1)).await.unwrap();
        }
        storage.put("notes:1", &StoredDocument::new("data", 1)).await.unwrap();

        assert_eq!(storage.list(Some("team:*")).await.unwrap().len(), 3);
        assert_eq!(storage.list(None).await.unwrap().len(), 4);

        assert!(storage.delete("notes:1").await.unwrap());
        assert!(!storage.delete("notes:1").await.unwrap());

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.document_count, 3);
        assert_eq!(stats.total_size_bytes, 12);
    }
}
