// Core module: identity, addressing and framing types shared by every busline crate (NO socket I/O)
pub mod address;
pub mod credentials;
pub mod error;
pub mod protocol;
pub mod timeout;
pub mod types;
pub mod watch;

pub use address::*;
pub use credentials::*;
pub use error::*;
pub use protocol::*;
pub use timeout::*;
pub use types::*;
pub use watch::*;
