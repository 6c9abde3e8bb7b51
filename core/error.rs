// Error types that cross crate boundaries
use thiserror::Error;

/// An allocation could not be satisfied.
///
/// Callers treat this as "wait a little and retry the same operation"; it never
/// causes a disconnect on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not enough memory")]
pub struct OutOfMemory;

impl From<std::collections::TryReserveError> for OutOfMemory {
    fn from(_: std::collections::TryReserveError) -> Self {
        OutOfMemory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuidError {
    #[error("guid must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("guid is not valid hex")]
    NotHex,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address entry {0:?} has no method prefix")]
    MissingMethod(String),
    #[error("malformed key/value pair {0:?}")]
    MalformedPair(String),
    #[error("key {0:?} appears twice in one entry")]
    DuplicateKey(String),
    #[error("bad escape sequence in {0:?}")]
    BadEscape(String),
    #[error("{method} address requires the {key} key")]
    MissingKey { method: String, key: &'static str },
    #[error("{method} address cannot combine {first} and {second}")]
    ConflictingKeys {
        method: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("invalid port {0:?}")]
    BadPort(String),
    #[error("unknown tcp family {0:?}")]
    BadFamily(String),
    #[error("unsupported transport method {0:?}")]
    UnsupportedMethod(String),
    #[error("invalid guid: {0}")]
    Guid(#[from] GuidError),
}
