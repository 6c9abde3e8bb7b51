// Errors surfaced by the connection API
use busline_core::OutOfMemory;
use busline_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    #[error("connection is closed")]
    Disconnected,
    #[error("unix fds cannot be passed on this connection")]
    UnixFdsUnsupported,
}
