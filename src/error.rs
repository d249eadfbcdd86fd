//! Error types for the Canopy engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Control-plane failures keep the [`ApiError`] taxonomy so callers can
//! distinguish transient failures from fatal ones.

use thiserror::Error;

use crate::cluster::ApiError;
use crate::storage::StorageError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Canopy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Cluster control-plane error
    #[error("cluster error: {source}")]
    Cluster {
        /// The classified control-plane error
        #[from]
        source: ApiError,
    },

    /// Object storage error
    #[error("storage error: {source}")]
    Storage {
        /// The underlying storage error
        #[from]
        source: StorageError,
    },

    /// Malformed input (missing identifiers, invalid configuration)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (if known)
        field: Option<String>,
    },

    /// Archive pack/unpack failure
    #[error("archive error [{context}]: {message}")]
    Archive {
        /// Description of what failed
        message: String,
        /// Where the failure happened (pack, unpack, hydrate, dehydrate)
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Another lifecycle transition is already in flight for this project
    #[error("project {project} is busy: {operation} in progress")]
    Busy {
        /// Project id
        project: String,
        /// The transition currently holding the project
        operation: String,
    },

    /// Dehydration could not be confirmed; the volume was kept
    #[error("dehydration failed for project {project}: {message}")]
    DehydrationFailed {
        /// Project id
        project: String,
        /// Description of what failed
        message: String,
    },

    /// A record the engine depends on does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (project, container)
        kind: String,
        /// Record identifier
        id: String,
    },

    /// A wait-for-status poll did not converge in time
    #[error("timed out waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an archive error with context
    pub fn archive(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Archive {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a busy error for a project
    pub fn busy(project: impl ToString, operation: impl Into<String>) -> Self {
        Self::Busy {
            project: project.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a dehydration failure for a project
    pub fn dehydration_failed(project: impl ToString, msg: impl Into<String>) -> Self {
        Self::DehydrationFailed {
            project: project.to_string(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout { what: what.into() }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are caller bugs and never retried.
    /// Dehydration failures are always retried on the next check cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Cluster { source } => source.is_transient(),
            Error::Storage { source } => source.is_retryable(),
            Error::Validation { .. } => false,
            Error::Archive { .. } => true,
            Error::Serialization { .. } => false,
            Error::Busy { .. } => true,
            Error::DehydrationFailed { .. } => true,
            Error::NotFound { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::archive("zip", e.to_string())
    }
}
