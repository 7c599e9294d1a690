//! Error types for akp
//!
//! Errors are structured with fields to aid debugging: the entity or instance
//! involved, the operation that failed and, for RPC failures, the underlying
//! status. Controllers never panic on remote errors; they surface one of these.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::{RpcCode, RpcError};

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for akp operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid declared input
    #[error("validation error for {entity}: {message}")]
    Validation {
        /// Entity with the invalid configuration
        entity: String,
        /// Description of what's invalid
        message: String,
        /// The invalid attribute path (e.g., "entries[1].ip")
        field: Option<String>,
    },

    /// Two entries of one resource share an ip
    #[error("ip address {ip} appears multiple times in entries")]
    DuplicateInResource {
        /// The repeated ip
        ip: String,
    },

    /// A requested ip is already present on the instance
    #[error("ip address {ip} already exists in the IP allow list of instance {instance_id}")]
    AlreadyExists {
        /// The conflicting ip
        ip: String,
        /// Instance holding the list
        instance_id: String,
    },

    /// Platform RPC failed with a non-retryable status
    #[error("{operation} failed: {source}")]
    Rpc {
        /// Label of the call (e.g., "get instance")
        operation: String,
        /// Status returned by the platform
        #[source]
        source: RpcError,
    },

    /// Platform RPC kept failing with transient statuses
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Label of the call
        operation: String,
        /// Total number of attempts made
        attempts: u32,
        /// Last status returned
        #[source]
        source: RpcError,
    },

    /// A status wait ran past its deadline
    #[error("timed out after {elapsed:?} waiting for {label} to reach one of [{targets}]")]
    Timeout {
        /// What was being waited for
        label: String,
        /// The target status set
        targets: String,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// The caller cancelled the operation
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// The caller's deadline expired during an operation
    #[error("{operation}: deadline exceeded")]
    DeadlineExceeded {
        /// Operation that observed the deadline
        operation: String,
    },

    /// Applying or deleting manifests on a user cluster failed
    #[error("manifest error [{operation}]: {message}")]
    Manifest {
        /// apply, delete, render, client
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Owned entries survived a delete that the server accepted
    #[error(
        "verification failed for instance {instance_id}: ip addresses still present after delete: {}",
        .remaining.join(", ")
    )]
    VerificationFailed {
        /// Instance holding the list
        instance_id: String,
        /// Owned ips still present
        remaining: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Provider configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's missing or wrong
        message: String,
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
    /// Create a validation error without entity context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            entity: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for an entity
    pub fn validation_for(entity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for an entity and attribute path
    pub fn validation_for_field(
        entity: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap an RPC error that will not be retried
    pub fn rpc(operation: impl Into<String>, source: RpcError) -> Self {
        Self::Rpc {
            operation: operation.into(),
            source,
        }
    }

    /// Create a manifest error
    pub fn manifest(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
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

    /// Status code of the underlying RPC failure, if any
    pub fn rpc_code(&self) -> Option<RpcCode> {
        match self {
            Error::Rpc { source, .. } | Error::RetriesExhausted { source, .. } => {
                Some(source.code)
            }
            _ => None,
        }
    }

    /// True if the platform reported the entity as absent
    pub fn is_not_found(&self) -> bool {
        self.rpc_code() == Some(RpcCode::NotFound)
    }

    /// Check if this error is retryable
    ///
    /// Validation, duplicate and verification failures need a config or state
    /// fix. Exhausted retries already spent their budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Rpc { source, .. } => source.is_retryable(),
            Error::Timeout { .. } => true,
            Error::Manifest { .. } => true,
            Error::Internal { .. } => true,
            Error::Validation { .. }
            | Error::DuplicateInResource { .. }
            | Error::AlreadyExists { .. }
            | Error::RetriesExhausted { .. }
            | Error::Cancelled { .. }
            | Error::DeadlineExceeded { .. }
            | Error::VerificationFailed { .. }
            | Error::Serialization { .. }
            | Error::Config { .. } => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Manifest { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
