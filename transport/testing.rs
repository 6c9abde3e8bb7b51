// In-memory stand-ins for the transport's collaborators
use crate::traits::{AuthConversation, AuthState, Socket, TransportOwner};
use busline_buffer::LiveCharge;
use busline_core::{Credentials, Guid, Message, OutOfMemory, Watch};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

/// A conversation that is already over, with a fixed outcome.
pub struct ScriptedAuth {
    identity: Credentials,
    server_guid: Option<Guid>,
    pub unused: Vec<u8>,
    input: Vec<u8>,
    fd_possible: bool,
}

impl ScriptedAuth {
    pub fn authenticated(identity: Credentials) -> Self {
        ScriptedAuth {
            identity,
            server_guid: None,
            unused: Vec::new(),
            input: Vec::new(),
            fd_possible: false,
        }
    }

    pub fn with_server_guid(mut self, guid: Guid) -> Self {
        self.server_guid = Some(guid);
        self
    }
}

impl AuthConversation for ScriptedAuth {
    fn do_work(&mut self) -> AuthState {
        AuthState::Authenticated
    }

    fn bytes_to_send(&self) -> &[u8] {
        &[]
    }

    fn bytes_sent(&mut self, _n: usize) {}

    fn get_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.input
    }

    fn return_buffer(&mut self) {}

    fn needs_encoding(&self) -> bool {
        false
    }

    fn needs_decoding(&self) -> bool {
        false
    }

    fn encode_data(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), OutOfMemory> {
        out.extend_from_slice(plain);
        Ok(())
    }

    fn decode_data(&mut self, encoded: &[u8], out: &mut Vec<u8>) -> Result<(), OutOfMemory> {
        out.extend_from_slice(encoded);
        Ok(())
    }

    fn identity(&self) -> Credentials {
        self.identity.clone()
    }

    fn guid_from_server(&self) -> Option<Guid> {
        self.server_guid
    }

    fn set_credentials(&mut self, _credentials: &Credentials) -> Result<(), OutOfMemory> {
        Ok(())
    }

    fn set_unix_fd_possible(&mut self, possible: bool) {
        self.fd_possible = possible;
    }

    fn unix_fd_negotiated(&self) -> bool {
        self.fd_possible
    }

    fn take_unused_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.unused)
    }
}

/// What a [`FakeSocket`] has seen, shared with the test.
#[derive(Default)]
pub struct Wire {
    pub incoming: Vec<u8>,
    pub written: Vec<u8>,
    /// Errors returned by the next writes that carry fds.
    pub fd_write_errors: VecDeque<io::Error>,
    pub peer: Credentials,
    pub closed: usize,
}

pub struct FakeSocket {
    fd: RawFd,
    wire: Arc<Mutex<Wire>>,
    pass_fds: bool,
}

impl FakeSocket {
    pub fn new(fd: RawFd, pass_fds: bool) -> (Self, Arc<Mutex<Wire>>) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        (
            FakeSocket {
                fd,
                wire: Arc::clone(&wire),
                pass_fds,
            },
            wire,
        )
    }
}

impl Socket for FakeSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn read(&mut self, buf: &mut Vec<u8>, max: usize) -> io::Result<usize> {
        let mut wire = self.wire.lock();
        if wire.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = max.min(wire.incoming.len());
        buf.extend(wire.incoming.drain(..n));
        Ok(n)
    }

    fn write_two(&mut self, first: &[u8], second: &[u8]) -> io::Result<usize> {
        let mut wire = self.wire.lock();
        wire.written.extend_from_slice(first);
        wire.written.extend_from_slice(second);
        Ok(first.len() + second.len())
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
        let error = self.wire.lock().fd_write_errors.pop_front();
        match error {
            Some(e) => Err(e),
            None => self.write_two(first, second),
        }
    }

    fn send_credentials(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_credentials(&mut self) -> io::Result<Credentials> {
        Ok(self.wire.lock().peer.clone())
    }

    fn can_pass_unix_fds(&self) -> bool {
        self.pass_fds
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        self.wire.lock().closed += 1;
    }
}

/// Owner that records everything the transport tells it.
#[derive(Default)]
pub struct RecordingOwner {
    pub outgoing: VecDeque<Message>,
    pub sent: usize,
    pub received: Vec<(Message, LiveCharge)>,
    pub watches: Vec<Watch>,
    pub disconnects: usize,
}

impl TransportOwner for RecordingOwner {
    fn has_messages_to_send(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn message_to_send(&self) -> Option<&Message> {
        self.outgoing.front()
    }

    fn message_sent(&mut self) {
        self.outgoing.pop_front();
        self.sent += 1;
    }

    fn queue_received_message(&mut self, message: Message, charge: LiveCharge) {
        self.received.push((message, charge));
    }

    fn add_watch(&mut self, watch: &Watch) -> Result<(), OutOfMemory> {
        self.watches.push(watch.clone());
        Ok(())
    }

    fn remove_watch(&mut self, watch: &Watch) {
        self.watches.retain(|w| !w.ptr_eq(watch));
    }

    fn notify_disconnected(&mut self) {
        self.disconnects += 1;
    }
}
