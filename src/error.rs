//! Error taxonomy shared by the control plane, the data path and the
//! atomic surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-visible error codes. The numeric values are part of the
/// external contract and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum FamErrorKind {
    NoError = 0,
    Unknown = 1,
    NoPerm = 2,
    Timeout = 3,
    Invalid = 4,
    Libfabric = 5,
    Shm = 6,
    NotFound = 7,
    AlreadyExist = 8,
    Allocator = 9,
    Rpc = 10,
    Pmi = 11,
    OutOfRange = 12,
    NullPtr = 13,
    Unimpl = 14,
    Resource = 15,
    InvalidOp = 16,
    RpcClientNotFound = 17,
    MemservListEmpty = 18,
    AtomicQueueFull = 19,
    AtomicQueueInsert = 20,
}

impl fmt::Display for FamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FamErrorKind::NoError => "NO_ERROR",
            FamErrorKind::Unknown => "UNKNOWN",
            FamErrorKind::NoPerm => "NOPERM",
            FamErrorKind::Timeout => "TIMEOUT",
            FamErrorKind::Invalid => "INVALID",
            FamErrorKind::Libfabric => "LIBFABRIC",
            FamErrorKind::Shm => "SHM",
            FamErrorKind::NotFound => "NOTFOUND",
            FamErrorKind::AlreadyExist => "ALREADYEXIST",
            FamErrorKind::Allocator => "ALLOCATOR",
            FamErrorKind::Rpc => "RPC",
            FamErrorKind::Pmi => "PMI",
            FamErrorKind::OutOfRange => "OUTOFRANGE",
            FamErrorKind::NullPtr => "NULLPTR",
            FamErrorKind::Unimpl => "UNIMPL",
            FamErrorKind::Resource => "RESOURCE",
            FamErrorKind::InvalidOp => "INVALIDOP",
            FamErrorKind::RpcClientNotFound => "RPC_CLIENT_NOTFOUND",
            FamErrorKind::MemservListEmpty => "MEMSERV_LIST_EMPTY",
            FamErrorKind::AtomicQueueFull => "ATOMIC_QUEUE_FULL",
            FamErrorKind::AtomicQueueInsert => "ATOMIC_QUEUE_INSERT",
        };
        f.write_str(name)
    }
}

/// Error type carried on every fallible runtime path.
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct FamError {
    kind: FamErrorKind,
    message: String,
}

impl FamError {
    pub fn new(kind: FamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FamErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::Invalid, message)
    }

    pub fn no_perm(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::NoPerm, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::NotFound, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::OutOfRange, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::Resource, message)
    }

    pub fn rpc(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::Rpc, message)
    }

    pub fn unimpl(message: impl Into<String>) -> Self {
        Self::new(FamErrorKind::Unimpl, message)
    }
}

pub type FamResult<T> = Result<T, FamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(FamErrorKind::NoError as i32, 0);
        assert_eq!(FamErrorKind::Unknown as i32, 1);
        assert_eq!(FamErrorKind::OutOfRange as i32, 12);
        assert_eq!(FamErrorKind::AtomicQueueInsert as i32, 20);
    }

    #[test]
    fn display_includes_code_name() {
        let err = FamError::out_of_range("offset beyond data item");
        assert_eq!(err.to_string(), "OUTOFRANGE: offset beyond data item");
    }
}
