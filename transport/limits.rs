// Per-transport resource ceilings
use busline_core::MAXIMUM_MESSAGE_LENGTH;

/// Fds a single message may carry unless configured otherwise.
pub const DEFAULT_MESSAGE_UNIX_FDS: usize = 16;
/// Bytes read or written per socket per iteration before yielding to others.
pub const DEFAULT_BYTES_PER_ITERATION: usize = 2048;
/// Received-but-unprocessed bytes allowed before reading pauses.
pub const DEFAULT_MAX_LIVE_BYTES: usize = 63 * 1024 * 1024;
pub const DEFAULT_MAX_LIVE_UNIX_FDS: usize = DEFAULT_MESSAGE_UNIX_FDS * 4;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    pub max_message_size: usize,
    pub max_message_unix_fds: usize,
    pub max_live_bytes: usize,
    pub max_live_unix_fds: usize,
    pub max_bytes_read_per_iteration: usize,
    pub max_bytes_written_per_iteration: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        TransportLimits {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_message_unix_fds: DEFAULT_MESSAGE_UNIX_FDS,
            max_live_bytes: DEFAULT_MAX_LIVE_BYTES,
            max_live_unix_fds: DEFAULT_MAX_LIVE_UNIX_FDS,
            max_bytes_read_per_iteration: DEFAULT_BYTES_PER_ITERATION,
            max_bytes_written_per_iteration: DEFAULT_BYTES_PER_ITERATION,
        }
    }
}

impl TransportLimits {
    /// Clamps values to what the framing can express and replaces zero budgets.
    pub fn sanitized(mut self) -> Self {
        self.max_message_size = self.max_message_size.min(MAXIMUM_MESSAGE_LENGTH);
        self.max_message_unix_fds = self
            .max_message_unix_fds
            .min(busline_core::MAXIMUM_MESSAGE_UNIX_FDS);
        if self.max_bytes_read_per_iteration == 0 {
            self.max_bytes_read_per_iteration = DEFAULT_BYTES_PER_ITERATION;
        }
        if self.max_bytes_written_per_iteration == 0 {
            self.max_bytes_written_per_iteration = DEFAULT_BYTES_PER_ITERATION;
        }
        self
    }
}
