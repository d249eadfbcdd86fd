//! S3 adapter for [`ObjectStore`]
//!
//! Credentials, region and endpoint come from the standard AWS environment
//! (`AWS_ACCESS_KEY_ID`, `AWS_REGION`, `AWS_ENDPOINT_URL`, ...), which also
//! covers S3-compatible stores.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ObjectInfo, ObjectStore, StorageError};

/// Object store backed by an S3 bucket
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Wrap an existing client
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the AWS environment
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();
        Self::new(Client::from_conf(s3_config), bucket)
    }

    async fn upload(&self, key: &str, body: ByteStream, size: u64) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/zip")
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        debug!(bucket = %self.bucket, key, size, "uploaded object");
        Ok(())
    }
}

fn classify<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Unavailable(message)
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            if status == 429 || status >= 500 {
                StorageError::Unavailable(message)
            } else {
                StorageError::Fatal {
                    key: key.to_string(),
                    message,
                }
            }
        }
        _ => StorageError::Fatal {
            key: key.to_string(),
            message,
        },
    }
}

fn to_chrono(t: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.secs(), t.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let size = body.len() as u64;
        self.upload(key, ByteStream::from(body), size).await
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let local = |e: &dyn std::fmt::Display| StorageError::Fatal {
            key: key.to_string(),
            message: format!("reading {}: {e}", path.display()),
        };
        let size = tokio::fs::metadata(path).await.map_err(|e| local(&e))?.len();
        let body = ByteStream::from_path(path).await.map_err(|e| local(&e))?;
        self.upload(key, body, size).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                return Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(classify(e, key)),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(format!("reading {key}: {e}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        let output = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => return Ok(None),
            Err(e) => return Err(classify(e, key)),
        };
        let last_modified = output
            .last_modified()
            .and_then(to_chrono)
            .ok_or_else(|| StorageError::Fatal {
                key: key.to_string(),
                message: "object has no last-modified time".to_string(),
            })?;
        Ok(Some(ObjectInfo {
            size: output
                .content_length()
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or(0),
            last_modified,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        debug!(bucket = %self.bucket, key, "deleted object");
        Ok(())
    }
}
