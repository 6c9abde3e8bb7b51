// Buffer module: lock-free received-message queue and live-message accounting
pub mod counter;
pub mod lockless;

pub use counter::*;
pub use lockless::*;
