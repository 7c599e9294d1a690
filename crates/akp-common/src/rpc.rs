//! Platform RPC status codes and transient-failure classification
//!
//! The platform speaks gRPC status codes, also when reached through its HTTP
//! gateway. Classification works on the typed code first; message matching is
//! only a fallback for transport failures that never got a code. Internal
//! errors reported by the platform itself are permanent; bare 5xx responses
//! from a proxy in front of it are decoded as `Unknown` so the message
//! decides.

use std::fmt;

use serde::{Deserialize, Serialize};

/// gRPC-style status code reported by the platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    /// Not an error
    Ok,
    /// The operation was cancelled by the caller
    Canceled,
    /// Unknown error, typically a transport failure without a status
    Unknown,
    /// The request carried invalid arguments
    InvalidArgument,
    /// The deadline expired before the operation completed
    DeadlineExceeded,
    /// The requested entity does not exist
    NotFound,
    /// The entity already exists
    AlreadyExists,
    /// The caller lacks permission
    PermissionDenied,
    /// A quota or rate limit was exhausted
    ResourceExhausted,
    /// The system is not in a state required for the operation
    FailedPrecondition,
    /// The operation was aborted, typically a concurrency conflict
    Aborted,
    /// The operation was attempted past the valid range
    OutOfRange,
    /// The operation is not implemented by the server
    Unimplemented,
    /// Internal server error
    Internal,
    /// The service is currently unavailable
    Unavailable,
    /// Unrecoverable data loss or corruption
    DataLoss,
    /// The request lacks valid authentication credentials
    Unauthenticated,
}

impl RpcCode {
    /// Map a numeric gRPC status code
    pub fn from_i32(code: i32) -> Option<Self> {
        let code = match code {
            0 => Self::Ok,
            1 => Self::Canceled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }

    /// Map an HTTP status returned by the platform's HTTP gateway
    ///
    /// Follows the grpc-gateway mapping in reverse. Where several codes share
    /// an HTTP status the most conservative one is chosen.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Ok,
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            412 => Self::FailedPrecondition,
            429 => Self::ResourceExhausted,
            499 => Self::Canceled,
            501 => Self::Unimplemented,
            502 | 503 => Self::Unavailable,
            504 => Self::DeadlineExceeded,
            500 => Self::Internal,
            _ => Self::Unknown,
        }
    }

    /// Codes the platform emits during brief reconciliation windows
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::DeadlineExceeded
                | Self::Aborted
                | Self::ResourceExhausted
                | Self::Canceled
        )
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::OutOfRange => "OutOfRange",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DataLoss => "DataLoss",
            Self::Unauthenticated => "Unauthenticated",
        };
        f.write_str(name)
    }
}

/// Error returned by a platform RPC
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct RpcError {
    /// Status code
    pub code: RpcCode,
    /// Server or transport supplied message
    pub message: String,
}

impl RpcError {
    /// Create an error with the given code
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a NotFound error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    /// Shorthand for an Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    /// Shorthand for an error without a typed status
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unknown, message)
    }

    /// True if the entity does not exist
    pub fn is_not_found(&self) -> bool {
        self.code == RpcCode::NotFound
    }

    /// Whether retrying the call may succeed
    pub fn is_retryable(&self) -> bool {
        is_retryable(self.code, &self.message)
    }
}

/// Message fragments that identify connection-level failures
const TRANSIENT_MESSAGE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "connection termination",
    "upstream connect error",
    "broken pipe",
    "network is unreachable",
    "no route to host",
    "network",
    "timeout",
    "timed out",
    "unexpected eof",
    "tls handshake",
    "temporarily unavailable",
];

/// Decide whether a failed RPC should be retried.
///
/// Depends only on the code and the message text. Typed codes decide on their
/// own; the message is consulted only for `Unknown`, which is what untyped
/// transport errors surface as.
pub fn is_retryable(code: RpcCode, message: &str) -> bool {
    if code.is_transient() {
        return true;
    }
    if code != RpcCode::Unknown {
        return false;
    }
    let message = message.to_ascii_lowercase();
    TRANSIENT_MESSAGE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}
