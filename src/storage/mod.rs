//! Object storage capability
//!
//! Archives live at a fixed key per project:
//! `projects/{user_id}/{project_id}/latest.zip`. Every archive overwrites the
//! previous one, so the key always points at the most recent dehydration.

pub mod memory;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Build the archive key for a project
pub fn archive_key(user_id: Uuid, project_id: Uuid) -> String {
    format!("projects/{user_id}/{project_id}/latest.zip")
}

/// Classified object storage failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// No object at the key
    #[error("object {key} not found")]
    NotFound {
        /// Object key
        key: String,
    },

    /// Storage endpoint unreachable, timed out or returned a server error
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Permission denied, bad bucket, malformed request
    #[error("storage request for {key} failed: {message}")]
    Fatal {
        /// Object key
        key: String,
        /// Description of what failed
        message: String,
    },
}

impl StorageError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// Whether the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Metadata of a stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Size in bytes
    pub size: u64,
    /// Last write time
    pub last_modified: DateTime<Utc>,
}

/// Blob operations used by hydration, dehydration and the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any previous one
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    /// Write an object from a local file, replacing any previous one
    ///
    /// The file is streamed from disk on every call.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    /// Read an object; [`StorageError::NotFound`] when absent
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Read object metadata; `Ok(None)` when absent
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError>;

    /// Delete an object; succeeds when already absent
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_archive_key_schema() {
        let user = Uuid::parse_str("6f1c0b7e-1d2a-4c3b-9e8f-0a1b2c3d4e5f").unwrap();
        let project = Uuid::parse_str("0d9e8f7a-6b5c-4d3e-8f2a-1b0c9d8e7f6a").unwrap();
        assert_eq!(
            archive_key(user, project),
            "projects/6f1c0b7e-1d2a-4c3b-9e8f-0a1b2c3d4e5f/0d9e8f7a-6b5c-4d3e-8f2a-1b0c9d8e7f6a/latest.zip"
        );
    }

    #[test]
    fn story_only_unavailable_is_retryable() {
        assert!(StorageError::Unavailable("timeout".into()).is_retryable());
        assert!(!StorageError::NotFound { key: "k".into() }.is_retryable());
        assert!(!StorageError::Fatal {
            key: "k".into(),
            message: "AccessDenied".into()
        }
        .is_retryable());
    }
}
