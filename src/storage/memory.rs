//! In-memory [`ObjectStore`] with fault injection

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ObjectInfo, ObjectStore, StorageError};

#[derive(Clone, Debug)]
struct StoredObject {
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// Object store backed by a map
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    unavailable: AtomicBool,
    failing_puts: AtomicU32,
    puts: AtomicUsize,
}

impl InMemoryObjectStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    /// Store an object directly, bypassing fault injection
    pub fn insert(&self, key: impl Into<String>, body: Vec<u8>) {
        self.insert_at(key, body, Utc::now());
    }

    /// Store an object with an explicit last-modified time
    pub fn insert_at(&self, key: impl Into<String>, body: Vec<u8>, last_modified: DateTime<Utc>) {
        self.objects().insert(
            key.into(),
            StoredObject {
                body,
                last_modified,
            },
        );
    }

    /// Read an object directly, bypassing fault injection
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).map(|o| o.body.clone())
    }

    /// All stored keys
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Make every call fail with [`StorageError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `times` puts with [`StorageError::Unavailable`]
    pub fn fail_puts(&self, times: u32) {
        self.failing_puts.store(times, Ordering::SeqCst);
    }

    /// Number of successful puts
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let body = tokio::fs::read(path).await.map_err(|e| StorageError::Fatal {
            key: key.to_string(),
            message: format!("reading {}: {e}", path.display()),
        })?;
        self.put(key, body).await
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        self.check_available()?;
        let consumed = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StorageError::Unavailable("upload reset".to_string()));
        }
        self.insert(key, body);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check_available()?;
        self.object(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        self.check_available()?;
        Ok(self.objects().get(key).map(|o| ObjectInfo {
            size: o.body.len() as u64,
            last_modified: o.last_modified,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.objects().remove(key);
        Ok(())
    }
}
