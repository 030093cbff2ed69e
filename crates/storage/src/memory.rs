use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;

use crate::{ObjectStore, StorageError, keys::validate_key};

/// Process-local object store used by tests and dry runs.
///
/// Records every `put` so callers can assert on upload counts, and can be told
/// to fail a number of upcoming writes or reads with a transient error.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_log: Mutex<Vec<String>>,
    failing_puts: AtomicU32,
    failing_reads: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls for `key`.
    pub fn put_count(&self, key: &str) -> usize {
        let log = self.put_log.lock().expect("put log lock poisoned");
        log.iter().filter(|logged| logged.as_str() == key).count()
    }

    /// Total successful `put` calls across all keys.
    pub fn total_puts(&self) -> usize {
        self.put_log.lock().expect("put log lock poisoned").len()
    }

    /// Make the next `count` writes fail with HTTP 503.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads (`get` or `exists`) fail with HTTP 503.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32, key: &str) -> Result<(), StorageError> {
        let consumed = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1));
        if consumed.is_ok() {
            return Err(StorageError::Status {
                key: key.to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        Self::take_failure(&self.failing_puts, key)?;
        self.objects
            .lock()
            .expect("object map lock poisoned")
            .insert(key.to_string(), bytes);
        self.put_log.lock().expect("put log lock poisoned").push(key.to_string());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        validate_key(key)?;
        Self::take_failure(&self.failing_puts, key)?;
        let mut objects = self.objects.lock().expect("object map lock poisoned");
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), bytes);
        self.put_log.lock().expect("put log lock poisoned").push(key.to_string());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Self::take_failure(&self.failing_reads, key)?;
        Ok(self.objects.lock().expect("object map lock poisoned").get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Self::take_failure(&self.failing_reads, key)?;
        Ok(self.objects.lock().expect("object map lock poisoned").contains_key(key))
    }

    fn object_url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}
