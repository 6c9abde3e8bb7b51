// Transport abstraction - the seams between the socket state machine and its collaborators
use crate::poll::{poll_one, PollRequest};
use crate::transport::{AuthProgress, DispatchStatus, Transport};
use busline_buffer::LiveCharge;
use busline_core::{Credentials, Guid, Message, OutOfMemory, Watch, WatchFlags};
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use tracing::debug;

/// Where an authentication conversation stands after doing as much work as it can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    WaitingForInput,
    WaitingForMemory,
    HaveBytesToSend,
    NeedDisconnect,
    Authenticated,
}

/// The handshake run before any message may flow.
pub trait AuthConversation: Send {
    fn do_work(&mut self) -> AuthState;

    /// Bytes queued for the peer; empty when there is nothing to send.
    fn bytes_to_send(&self) -> &[u8];
    fn bytes_sent(&mut self, n: usize);

    /// Buffer raw input is appended to; hand it back with [`return_buffer`].
    ///
    /// [`return_buffer`]: AuthConversation::return_buffer
    fn get_buffer(&mut self) -> &mut Vec<u8>;
    fn return_buffer(&mut self);

    fn needs_encoding(&self) -> bool;
    fn needs_decoding(&self) -> bool;
    fn encode_data(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), OutOfMemory>;
    fn decode_data(&mut self, encoded: &[u8], out: &mut Vec<u8>) -> Result<(), OutOfMemory>;

    /// Who the peer proved to be. Empty until authenticated.
    fn identity(&self) -> Credentials;
    fn guid_from_server(&self) -> Option<Guid>;
    /// Credentials read off the socket, available to mechanisms that check them.
    fn set_credentials(&mut self, credentials: &Credentials) -> Result<(), OutOfMemory>;

    fn set_unix_fd_possible(&mut self, possible: bool);
    fn unix_fd_negotiated(&self) -> bool;

    /// Input that arrived after the end of the handshake; belongs to the message stream.
    fn take_unused_bytes(&mut self) -> Vec<u8>;
}

/// Where the next read should land and how much of it is wanted.
pub struct LoaderBuffer<'a> {
    pub data: &'a mut Vec<u8>,
    pub max_to_read: usize,
    pub may_read_unix_fds: bool,
}

/// Turns the received byte stream (and descriptors) into whole messages.
pub trait MessageLoader: Send {
    fn get_buffer(&mut self) -> LoaderBuffer<'_>;
    fn return_buffer(&mut self);

    /// How many descriptors the next read may accept.
    fn get_unix_fds(&mut self) -> Result<usize, OutOfMemory>;
    fn return_unix_fds(&mut self, fds: Vec<OwnedFd>);
    fn pending_unix_fds(&self) -> usize;
    fn set_unix_fd_passing(&mut self, enabled: bool);

    /// Moves every complete frame from the buffer onto the ready queue.
    fn queue_messages(&mut self) -> Result<(), OutOfMemory>;
    fn peek_message(&self) -> Option<&Message>;
    fn pop_message(&mut self) -> Option<Message>;

    fn is_corrupted(&self) -> bool;
    fn corruption_reason(&self) -> Option<&str>;

    fn set_max_message_size(&mut self, size: usize);
    fn max_message_size(&self) -> usize;
    fn set_max_message_unix_fds(&mut self, n: usize);
    fn max_message_unix_fds(&self) -> usize;
}

/// The object that owns a transport: supplies outgoing messages, receives
/// incoming ones, and knows how to register watches.
pub trait TransportOwner {
    fn has_messages_to_send(&self) -> bool;
    fn message_to_send(&self) -> Option<&Message>;
    /// The head of the outgoing queue is done with, delivered or not.
    fn message_sent(&mut self);
    fn queue_received_message(&mut self, message: Message, charge: LiveCharge);
    fn add_watch(&mut self, watch: &Watch) -> Result<(), OutOfMemory>;
    fn remove_watch(&mut self, watch: &Watch);
    fn notify_disconnected(&mut self);
}

/// A connected, non-blocking byte stream.
///
/// `read` appends to `buf`; a return of `Ok(0)` means end of stream.
pub trait Socket: Send {
    fn as_raw_fd(&self) -> RawFd;
    fn read(&mut self, buf: &mut Vec<u8>, max: usize) -> io::Result<usize>;
    fn write_two(&mut self, first: &[u8], second: &[u8]) -> io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_two(data, &[])
    }

    fn read_with_unix_fds(
        &mut self,
        buf: &mut Vec<u8>,
        max: usize,
        _max_fds: usize,
    ) -> io::Result<(usize, Vec<OwnedFd>)> {
        self.read(buf, max).map(|n| (n, Vec::new()))
    }

    fn write_with_unix_fds(&mut self, first: &[u8], second: &[u8], _fds: &[RawFd]) -> io::Result<usize> {
        self.write_two(first, second)
    }

    /// Sends the single credentials byte that opens every conversation.
    fn send_credentials(&mut self) -> io::Result<()>;
    /// Reads the peer's credentials byte and whatever the kernel says about the peer.
    fn read_credentials(&mut self) -> io::Result<Credentials>;

    fn can_pass_unix_fds(&self) -> bool {
        false
    }
}

/// What one blocking iteration should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationFlags {
    pub do_reading: bool,
    pub do_writing: bool,
    pub block: bool,
}

/// A concrete transport. `Drop` plays the part of finalize.
pub trait TransportBackend: Send {
    fn base(&self) -> &Transport;
    fn base_mut(&mut self) -> &mut Transport;

    fn handle_watch(
        &mut self,
        owner: &mut dyn TransportOwner,
        watch: &Watch,
        condition: WatchFlags,
    ) -> Result<(), OutOfMemory>;

    fn disconnect(&mut self, owner: &mut dyn TransportOwner);

    /// The transport has been given an owner; register the watches with it.
    fn connection_set(&mut self, owner: &mut dyn TransportOwner) -> Result<(), OutOfMemory>;

    /// First half of an iteration: decide what to poll for. `None` means
    /// there is nothing worth waiting on.
    fn prepare_iteration(
        &mut self,
        owner: &mut dyn TransportOwner,
        flags: IterationFlags,
        timeout: Option<std::time::Duration>,
    ) -> Option<PollRequest>;

    /// Second half of an iteration, with the conditions the poll reported.
    fn finish_iteration(
        &mut self,
        owner: &mut dyn TransportOwner,
        flags: IterationFlags,
        revents: io::Result<WatchFlags>,
    ) -> Result<(), OutOfMemory>;

    /// Recomputes which watches should be enabled.
    fn check_watches(&mut self, owner: &mut dyn TransportOwner);

    /// Feeds back the verdict of an authorization request taken with
    /// [`Transport::take_authorization_request`].
    fn complete_authorization(&mut self, owner: &mut dyn TransportOwner, allowed: bool);

    /// Finishes authentication if it can. A refused peer is disconnected.
    fn try_to_authenticate(&mut self, owner: &mut dyn TransportOwner) -> bool {
        match self.base_mut().authentication_step() {
            AuthProgress::Authenticated => true,
            AuthProgress::NotYet => false,
            AuthProgress::Refused => {
                self.disconnect(owner);
                false
            }
        }
    }

    fn dispatch_status(&mut self, owner: &mut dyn TransportOwner) -> DispatchStatus {
        if !self.base().live_counter().below_limits() {
            // the owner has to release something first
            return DispatchStatus::Complete;
        }
        if !self.try_to_authenticate(owner) {
            if self.base_mut().auth.do_work() == AuthState::WaitingForMemory {
                return DispatchStatus::NeedMemory;
            }
            if !self.try_to_authenticate(owner) {
                return DispatchStatus::Complete;
            }
        }

        let base = self.base_mut();
        if base.recover_unused_bytes().is_err() {
            return DispatchStatus::NeedMemory;
        }
        if base.loader.queue_messages().is_err() {
            return DispatchStatus::NeedMemory;
        }
        if base.loader.peek_message().is_some() {
            DispatchStatus::DataRemains
        } else {
            DispatchStatus::Complete
        }
    }

    /// Hands every loaded message to the owner, charged to the live counter.
    fn queue_messages(&mut self, owner: &mut dyn TransportOwner) -> Result<(), OutOfMemory> {
        let status = loop {
            match self.dispatch_status(owner) {
                DispatchStatus::DataRemains => {
                    let base = self.base_mut();
                    let Some(message) = base.loader.pop_message() else {
                        break DispatchStatus::Complete;
                    };
                    let charge = base.live.charge(message.size(), message.unix_fds().len());
                    owner.queue_received_message(message, charge);
                }
                other => break other,
            }
        };

        if self.base().loader.is_corrupted() {
            debug!(
                reason = self.base().loader.corruption_reason().unwrap_or("unknown"),
                "corrupted message stream, disconnecting"
            );
            self.disconnect(owner);
        }

        match status {
            DispatchStatus::NeedMemory => Err(OutOfMemory),
            _ => Ok(()),
        }
    }

    /// One iteration with the poll done in place. Owners that must release a
    /// lock around the poll call the two halves themselves.
    fn do_iteration(
        &mut self,
        owner: &mut dyn TransportOwner,
        flags: IterationFlags,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), OutOfMemory> {
        let Some(request) = self.prepare_iteration(owner, flags, timeout) else {
            return Ok(());
        };
        let revents = poll_one(&request);
        if let Err(e) = &revents {
            debug!(fd = request.fd, error = %e, "poll failed during transport iteration");
        }
        self.finish_iteration(owner, flags, revents)
    }
}

/// Accepts incoming connections as server-side transports.
pub trait TransportListener: Send {
    type Backend: TransportBackend;

    fn as_raw_fd(&self) -> RawFd;
    fn guid(&self) -> Guid;
    fn address(&self) -> String;
    /// `Ok(None)` when no connection is waiting.
    fn accept(&mut self) -> io::Result<Option<Self::Backend>>;
}
