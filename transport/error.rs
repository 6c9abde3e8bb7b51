// Errors raised while opening or accepting transports
use busline_core::AddressError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("nonce file {path:?}: {reason}")]
    Nonce { path: String, reason: String },
    #[error("peer sent the wrong nonce")]
    NonceMismatch,
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("no address entry could be opened: {0}")]
    NoUsableAddress(String),
}

impl From<nix::errno::Errno> for TransportError {
    fn from(errno: nix::errno::Errno) -> Self {
        TransportError::Io(io::Error::from(errno))
    }
}
