// src/core/errors.rs

//! Defines the primary error type for the entire node core.

use crate::core::protocol::status;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the node.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete frame in stream")]
    IncompleteFrame,

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Payload of {size} bytes exceeds the configured maximum of {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Pool queue is full, request rejected")]
    Overloaded,

    #[error("Connection has been reset")]
    ConnectionReset,

    #[error("Transaction timed out")]
    Timeout,

    #[error("Node is shutting down")]
    Shutdown,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("No backend with id {0}")]
    UnknownBackend(i32),

    #[error("Unknown command opcode {0:#x}")]
    UnknownOpcode(u32),

    #[error("Operation not supported by this backend")]
    Unsupported,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote replied with status {status}")]
    Remote { status: i32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Maps this error onto the negative-errno status code carried in reply headers.
    pub fn wire_status(&self) -> i32 {
        match self {
            NodeError::Io(e) => -e.raw_os_error().unwrap_or(status::EIO),
            NodeError::IncompleteFrame | NodeError::MalformedHeader(_) => -status::EBADMSG,
            NodeError::PayloadTooLarge { .. } => -status::EMSGSIZE,
            NodeError::Overloaded => -status::ENOBUFS,
            NodeError::ConnectionReset => -status::ECONNRESET,
            NodeError::Timeout => -status::ETIMEDOUT,
            NodeError::Shutdown => -status::ESHUTDOWN,
            NodeError::AuthFailed(_) => -status::EPERM,
            NodeError::UnknownBackend(_) => -status::ENXIO,
            NodeError::UnknownOpcode(_) | NodeError::Unsupported => -status::ENOTSUP,
            NodeError::InvalidRequest(_) => -status::EINVAL,
            NodeError::Remote { status } => *status,
            NodeError::Internal(_) => -status::EIO,
        }
    }

    /// Reconstructs an error from a negative-errno reply status.
    pub fn from_wire_status(st: i32) -> Self {
        match -st {
            status::ETIMEDOUT => NodeError::Timeout,
            status::ECONNRESET => NodeError::ConnectionReset,
            status::ENOBUFS => NodeError::Overloaded,
            status::ESHUTDOWN => NodeError::Shutdown,
            _ => NodeError::Remote { status: st },
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// The Arc wrapper allows cheap, shared cloning.
impl Clone for NodeError {
    fn clone(&self) -> Self {
        match self {
            NodeError::Io(e) => NodeError::Io(Arc::clone(e)),
            NodeError::IncompleteFrame => NodeError::IncompleteFrame,
            NodeError::MalformedHeader(s) => NodeError::MalformedHeader(s.clone()),
            NodeError::PayloadTooLarge { size, limit } => NodeError::PayloadTooLarge {
                size: *size,
                limit: *limit,
            },
            NodeError::Overloaded => NodeError::Overloaded,
            NodeError::ConnectionReset => NodeError::ConnectionReset,
            NodeError::Timeout => NodeError::Timeout,
            NodeError::Shutdown => NodeError::Shutdown,
            NodeError::AuthFailed(s) => NodeError::AuthFailed(s.clone()),
            NodeError::UnknownBackend(id) => NodeError::UnknownBackend(*id),
            NodeError::UnknownOpcode(op) => NodeError::UnknownOpcode(*op),
            NodeError::Unsupported => NodeError::Unsupported,
            NodeError::InvalidRequest(s) => NodeError::InvalidRequest(s.clone()),
            NodeError::Remote { status } => NodeError::Remote { status: *status },
            NodeError::Internal(s) => NodeError::Internal(s.clone()),
        }
    }
}

impl PartialEq for NodeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NodeError::Io(e1), NodeError::Io(e2)) => e1.to_string() == e2.to_string(),
            (NodeError::MalformedHeader(s1), NodeError::MalformedHeader(s2)) => s1 == s2,
            (
                NodeError::PayloadTooLarge {
                    size: s1,
                    limit: l1,
                },
                NodeError::PayloadTooLarge {
                    size: s2,
                    limit: l2,
                },
            ) => s1 == s2 && l1 == l2,
            (NodeError::AuthFailed(s1), NodeError::AuthFailed(s2)) => s1 == s2,
            (NodeError::UnknownBackend(a), NodeError::UnknownBackend(b)) => a == b,
            (NodeError::UnknownOpcode(a), NodeError::UnknownOpcode(b)) => a == b,
            (NodeError::InvalidRequest(s1), NodeError::InvalidRequest(s2)) => s1 == s2,
            (NodeError::Remote { status: a }, NodeError::Remote { status: b }) => a == b,
            (NodeError::Internal(s1), NodeError::Internal(s2)) => s1 == s2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<String> for NodeError {
    fn from(s: String) -> Self {
        NodeError::Internal(s)
    }
}
