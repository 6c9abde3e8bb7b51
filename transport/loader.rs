// Frame loader: reassembles messages from the received byte stream
use crate::limits::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MESSAGE_UNIX_FDS};
use crate::traits::{LoaderBuffer, MessageLoader};
use busline_core::{FrameHeader, Message, OutOfMemory, HEADER_LEN};
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use tracing::{debug, trace};

pub struct FrameLoader {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
    messages: VecDeque<Message>,
    corrupted: Option<String>,
    max_message_size: usize,
    max_message_unix_fds: usize,
    unix_fd_passing: bool,
}

impl Default for FrameLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLoader {
    pub fn new() -> Self {
        FrameLoader {
            data: Vec::new(),
            fds: Vec::new(),
            messages: VecDeque::new(),
            corrupted: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_message_unix_fds: DEFAULT_MESSAGE_UNIX_FDS,
            unix_fd_passing: false,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.data.len()
    }

    fn corrupt(&mut self, reason: String) {
        debug!(reason = %reason, "message stream corrupted");
        self.corrupted = Some(reason);
    }

    /// Header of the frame at the front of the buffer, if complete and acceptable.
    fn current_header(&mut self) -> Option<FrameHeader> {
        let header = match FrameHeader::from_bytes(&self.data) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(e) => {
                self.corrupt(format!("invalid header: {e:?}"));
                return None;
            }
        };
        if header.body_len as usize > self.max_message_size {
            self.corrupt(format!(
                "message of {} bytes exceeds the {} byte limit",
                header.body_len, self.max_message_size
            ));
            return None;
        }
        if header.unix_fds as usize > self.max_message_unix_fds {
            self.corrupt(format!(
                "message declares {} fds, limit is {}",
                header.unix_fds, self.max_message_unix_fds
            ));
            return None;
        }
        if self.fds.len() > header.unix_fds as usize {
            self.corrupt(format!(
                "received {} fds for a message declaring {}",
                self.fds.len(),
                header.unix_fds
            ));
            return None;
        }
        Some(header)
    }
}

impl MessageLoader for FrameLoader {
    fn get_buffer(&mut self) -> LoaderBuffer<'_> {
        let (max_to_read, may_read_unix_fds) = if !self.unix_fd_passing {
            (usize::MAX, false)
        } else if self.data.len() < HEADER_LEN {
            (HEADER_LEN - self.data.len(), true)
        } else {
            // Stop at the end of this frame so the next frame's fds cannot arrive early.
            match self.current_header() {
                Some(header) => (header.frame_len().saturating_sub(self.data.len()), true),
                None => (0, false),
            }
        };
        LoaderBuffer {
            data: &mut self.data,
            max_to_read,
            may_read_unix_fds,
        }
    }

    fn return_buffer(&mut self) {}

    fn get_unix_fds(&mut self) -> Result<usize, OutOfMemory> {
        let room = self.max_message_unix_fds.saturating_sub(self.fds.len());
        self.fds.try_reserve(room)?;
        Ok(room)
    }

    fn return_unix_fds(&mut self, fds: Vec<OwnedFd>) {
        if !fds.is_empty() {
            trace!(count = fds.len(), "loader received fds");
        }
        self.fds.extend(fds);
    }

    fn pending_unix_fds(&self) -> usize {
        self.fds.len()
    }

    fn set_unix_fd_passing(&mut self, enabled: bool) {
        self.unix_fd_passing = enabled;
    }

    fn queue_messages(&mut self) -> Result<(), OutOfMemory> {
        while self.corrupted.is_none() {
            let Some(header) = self.current_header() else {
                break;
            };
            let frame_len = header.frame_len();
            if self.data.len() < frame_len {
                break;
            }
            let n_fds = header.unix_fds as usize;
            if self.fds.len() < n_fds {
                self.corrupt(format!(
                    "message declares {} fds but only {} arrived",
                    n_fds,
                    self.fds.len()
                ));
                break;
            }

            self.messages.try_reserve(1)?;
            let mut body = Vec::new();
            body.try_reserve_exact(header.body_len as usize)?;
            body.extend_from_slice(&self.data[HEADER_LEN..frame_len]);

            let fds: Vec<OwnedFd> = self.fds.drain(..n_fds).collect();
            self.data.drain(..frame_len);
            trace!(serial = header.serial, len = frame_len, fds = n_fds, "loaded message");
            self.messages.push_back(Message::from_frame(header, body, fds));
        }
        Ok(())
    }

    fn peek_message(&self) -> Option<&Message> {
        self.messages.front()
    }

    fn pop_message(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    fn is_corrupted(&self) -> bool {
        self.corrupted.is_some()
    }

    fn corruption_reason(&self) -> Option<&str> {
        self.corrupted.as_deref()
    }

    fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size.min(busline_core::MAXIMUM_MESSAGE_LENGTH);
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn set_max_message_unix_fds(&mut self, n: usize) {
        self.max_message_unix_fds = n.min(busline_core::MAXIMUM_MESSAGE_UNIX_FDS);
    }

    fn max_message_unix_fds(&self) -> usize {
        self.max_message_unix_fds
    }
}
