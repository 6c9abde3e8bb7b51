// lib: connections over socket transports, driven by a poll(2) reactor
// Ties the transport state machine to an application: queues outgoing messages,
// hands received ones to an event handler and multiplexes many connections on one loop

// Re-export core identity, addressing and framing types
pub use busline_core::*;

// Re-export transport abstractions
pub use busline_transport::*;

pub use busline_buffer::{LiveCharge, LiveCounter, LocklessQueue};

pub mod config;
pub mod connection;
pub mod error;
pub mod mainloop;

pub use config::{Settings, SETTINGS};
pub use connection::{Connection, Event, EventHandler, IncomingMessage};
pub use error::ConnectionError;
pub use mainloop::{Clock, MonotonicClock, Reactor, ReactorConfig};
