// Transport module: sockets, the handshake and the per-connection I/O state machine
pub mod auth;
pub mod error;
pub mod limits;
pub mod loader;
pub mod poll;
pub mod socket_transport;
mod stream;
pub mod tcp;
pub mod traits;
pub mod transport;
pub mod unix;

#[cfg(test)]
mod testing;

pub use auth::{Mechanism, SaslAuth};
pub use error::TransportError;
pub use limits::*;
pub use loader::FrameLoader;
pub use socket_transport::SocketTransport;
pub use tcp::{TcpListener, TcpSocket};
pub use traits::*;
pub use transport::*;
pub use unix::{UnixListener, UnixSocket};
