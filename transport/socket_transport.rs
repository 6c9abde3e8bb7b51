// Socket transport: drives one non-blocking socket through the handshake and message I/O
use crate::auth::SaslAuth;
use crate::limits::TransportLimits;
use crate::loader::FrameLoader;
use crate::poll::PollRequest;
use crate::tcp::TcpSocket;
use crate::traits::{
    AuthConversation, AuthState, IterationFlags, MessageLoader, Socket, TransportBackend, TransportOwner,
};
use crate::transport::{read_interest, write_interest, Transport};
use crate::unix::UnixSocket;
use crate::TransportError;
use busline_buffer::LiveCounter;
use busline_core::{Guid, OutOfMemory, SocketTarget, TransportAddress, Watch, WatchFlags};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Shrink target for the encoded-outgoing buffer between messages.
const ENCODED_RETAIN: usize = 2048;

pub struct SocketTransport {
    base: Transport,
    /// `None` once disconnected; dropping it closes the descriptor.
    socket: Option<Box<dyn Socket>>,
    fd: RawFd,
    read_watch: Option<Watch>,
    write_watch: Option<Watch>,
    /// Encoded form of the message being written, when the auth mechanism encodes.
    encoded_outgoing: Vec<u8>,
    encoded_incoming: Vec<u8>,
    /// Write cursor into the head of the outgoing queue.
    message_bytes_written: usize,
}

impl SocketTransport {
    pub fn with_parts(
        socket: Box<dyn Socket>,
        mut auth: Box<dyn AuthConversation>,
        loader: Box<dyn MessageLoader>,
        server_guid: Option<Guid>,
        address: Option<String>,
        limits: TransportLimits,
    ) -> Self {
        let fd = socket.as_raw_fd();
        auth.set_unix_fd_possible(socket.can_pass_unix_fds());
        let base = Transport::new(auth, loader, server_guid, address, limits);

        let read_watch = Watch::new(fd, WatchFlags::READABLE, false);
        let write_watch = Watch::new(fd, WatchFlags::WRITABLE, false);

        // Crossing a live limit in either direction toggles reading.
        let watch = read_watch.clone();
        let authenticated = base.authenticated_flag();
        base.live_counter().set_notify(Some(Arc::new(move |counter: &LiveCounter| {
            if authenticated.load(Ordering::Acquire) && watch.is_valid() {
                watch.set_enabled(counter.below_limits());
            }
        })));

        debug!(fd, side = base.side(), "socket transport created");
        SocketTransport {
            base,
            socket: Some(socket),
            fd,
            read_watch: Some(read_watch),
            write_watch: Some(write_watch),
            encoded_outgoing: Vec::new(),
            encoded_incoming: Vec::new(),
            message_bytes_written: 0,
        }
    }

    /// Server end of an accepted connection.
    pub fn server(socket: Box<dyn Socket>, guid: Guid, address: Option<String>, limits: TransportLimits) -> Self {
        Self::with_parts(
            socket,
            Box::new(SaslAuth::server(guid)),
            Box::new(FrameLoader::new()),
            Some(guid),
            address,
            limits,
        )
    }

    /// Client end; `expected_guid` is checked against what the server announces.
    pub fn client(
        socket: Box<dyn Socket>,
        expected_guid: Option<Guid>,
        address: Option<String>,
        limits: TransportLimits,
    ) -> Self {
        let mut transport = Self::with_parts(
            socket,
            Box::new(SaslAuth::client()),
            Box::new(FrameLoader::new()),
            None,
            address,
            limits,
        );
        transport.base.set_expected_guid(expected_guid);
        transport
    }

    /// Connects to one resolved address entry.
    pub fn open(address: &TransportAddress, limits: TransportLimits) -> Result<Self, TransportError> {
        let socket: Box<dyn Socket> = match &address.target {
            SocketTarget::UnixPath(_) | SocketTarget::UnixAbstract(_) => Box::new(UnixSocket::connect(&address.target)?),
            SocketTarget::Tcp { .. } | SocketTarget::NonceTcp { .. } => Box::new(TcpSocket::connect(&address.target)?),
        };
        debug!(address = %address.entry, "connected");
        Ok(Self::client(socket, address.expected_guid, Some(address.entry.clone()), limits))
    }

    /// Tries each entry of an address string in turn; the first that connects wins.
    pub fn open_any(address: &str, limits: TransportLimits) -> Result<Self, TransportError> {
        let mut last_error = None;
        for entry in TransportAddress::parse_all(address)? {
            match Self::open(&entry, limits) {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    debug!(address = %entry.entry, error = %e, "could not connect");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::NoUsableAddress(address.to_string())))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn read_watch(&self) -> Option<&Watch> {
        self.read_watch.as_ref()
    }

    pub fn write_watch(&self) -> Option<&Watch> {
        self.write_watch.as_ref()
    }

    fn check_read_watch(&mut self, owner: &dyn TransportOwner) {
        let inputs = self.base.interest_inputs(owner.has_messages_to_send());
        if let Some(watch) = &self.read_watch {
            watch.set_enabled(read_interest(&inputs));
        }
    }

    fn check_write_watch(&mut self, owner: &dyn TransportOwner) {
        let inputs = self.base.interest_inputs(owner.has_messages_to_send());
        if let Some(watch) = &self.write_watch {
            watch.set_enabled(write_interest(&inputs));
        }
    }

    fn read_watch_enabled(&self) -> bool {
        self.read_watch.as_ref().is_some_and(Watch::is_enabled)
    }

    /// Sends or receives the credentials byte. Would-block leaves the step pending.
    fn exchange_credentials(
        &mut self,
        owner: &mut dyn TransportOwner,
        do_reading: bool,
        do_writing: bool,
    ) -> Result<(), OutOfMemory> {
        if do_writing && self.base.send_credentials_pending {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };
            match socket.send_credentials() {
                Ok(()) => {
                    trace!(fd = self.fd, "sent credentials byte");
                    self.base.send_credentials_pending = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "failed to send credentials");
                    self.disconnect(owner);
                    return Ok(());
                }
            }
        }
        if self.base.send_credentials_pending {
            return Ok(());
        }

        if do_reading && self.base.receive_credentials_pending {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };
            match socket.read_credentials() {
                Ok(credentials) => {
                    trace!(fd = self.fd, peer = %credentials, "read peer credentials");
                    self.base.credentials = credentials;
                    self.base.receive_credentials_pending = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "failed to read credentials");
                    self.disconnect(owner);
                    return Ok(());
                }
            }
        }

        if !self.base.send_credentials_pending && !self.base.receive_credentials_pending {
            self.base.auth.set_credentials(&self.base.credentials)?;
        }
        Ok(())
    }

    /// Returns false when nothing more can be read right now.
    fn read_data_into_auth(&mut self, owner: &mut dyn TransportOwner) -> Result<bool, OutOfMemory> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(false);
        };
        let max = self.base.limits().max_bytes_read_per_iteration;
        let auth = &mut self.base.auth;

        let result = if auth.needs_decoding() {
            self.encoded_incoming.clear();
            match socket.read(&mut self.encoded_incoming, max) {
                Ok(n) if n > 0 => {
                    let mut plain = Vec::new();
                    auth.decode_data(&self.encoded_incoming, &mut plain)?;
                    self.encoded_incoming.clear();
                    let buffer = auth.get_buffer();
                    buffer.try_reserve(plain.len())?;
                    buffer.extend_from_slice(&plain);
                    auth.return_buffer();
                    Ok(n)
                }
                other => other,
            }
        } else {
            let buffer = auth.get_buffer();
            let r = socket.read(buffer, max);
            auth.return_buffer();
            r
        };

        match result {
            Ok(0) => {
                debug!(fd = self.fd, "peer closed the connection during authentication");
                self.disconnect(owner);
                Ok(false)
            }
            Ok(n) => {
                trace!(fd = self.fd, bytes = n, "read authentication data");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => Err(OutOfMemory),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                debug!(fd = self.fd, error = %e, "read error during authentication");
                self.disconnect(owner);
                Ok(false)
            }
        }
    }

    /// Returns false when nothing more can be written right now.
    fn write_data_from_auth(&mut self, owner: &mut dyn TransportOwner) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        let bytes = self.base.auth.bytes_to_send();
        if bytes.is_empty() {
            return false;
        }
        match socket.write(bytes) {
            Ok(n) => {
                trace!(fd = self.fd, bytes = n, "wrote authentication data");
                self.base.auth.bytes_sent(n);
                n > 0
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                debug!(fd = self.fd, error = %e, "write error during authentication");
                self.disconnect(owner);
                false
            }
        }
    }

    /// Runs the handshake as far as the socket allows. Returns whether
    /// authentication completed during this call.
    fn do_authentication(
        &mut self,
        owner: &mut dyn TransportOwner,
        do_reading: bool,
        do_writing: bool,
    ) -> Result<bool, OutOfMemory> {
        let was_authenticated = self.base.is_authenticated();
        if was_authenticated {
            return Ok(false);
        }

        let mut result = Ok(());
        loop {
            if self.try_to_authenticate(owner) || !self.base.is_connected() {
                break;
            }
            if let Err(e) = self.exchange_credentials(owner, do_reading, do_writing) {
                result = Err(e);
                break;
            }
            if self.base.send_credentials_pending || self.base.receive_credentials_pending {
                break;
            }

            match self.base.auth.do_work() {
                AuthState::WaitingForInput => {
                    if !do_reading {
                        break;
                    }
                    match self.read_data_into_auth(owner) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                AuthState::WaitingForMemory => {
                    result = Err(OutOfMemory);
                    break;
                }
                AuthState::HaveBytesToSend => {
                    if !do_writing || !self.write_data_from_auth(owner) {
                        break;
                    }
                }
                AuthState::NeedDisconnect => {
                    debug!(fd = self.fd, side = self.base.side(), "authentication failed");
                    self.disconnect(owner);
                    break;
                }
                AuthState::Authenticated => {
                    // Either done now or waiting on a verdict; nothing more to do here.
                    self.try_to_authenticate(owner);
                    break;
                }
            }
        }

        let completed = was_authenticated != self.base.is_authenticated();
        self.check_read_watch(owner);
        self.check_write_watch(owner);
        result.map(|()| completed)
    }

    fn do_reading(&mut self, owner: &mut dyn TransportOwner) -> Result<(), OutOfMemory> {
        if !self.try_to_authenticate(owner) {
            return Ok(());
        }
        self.base.recover_unused_bytes()?;

        let max = self.base.limits().max_bytes_read_per_iteration;
        let mut total = 0usize;
        loop {
            // Reading stops while the owner is holding too much.
            self.check_read_watch(owner);
            if !self.read_watch_enabled() || total > max {
                return Ok(());
            }
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };

            let result = if self.base.auth.needs_decoding() {
                self.encoded_incoming.clear();
                match socket.read(&mut self.encoded_incoming, max) {
                    Ok(n) if n > 0 => {
                        let buffer = self.base.loader.get_buffer();
                        let decoded = self.base.auth.decode_data(&self.encoded_incoming, buffer.data);
                        self.base.loader.return_buffer();
                        decoded?;
                        self.encoded_incoming.clear();
                        Ok(n)
                    }
                    other => other,
                }
            } else {
                let (max_to_read, may_read_unix_fds) = {
                    let buffer = self.base.loader.get_buffer();
                    (buffer.max_to_read.min(max), buffer.may_read_unix_fds)
                };
                self.base.loader.return_buffer();
                if max_to_read == 0 {
                    // the loader refuses more input; queueing will tell why
                    self.queue_messages(owner)?;
                    return Ok(());
                }

                if may_read_unix_fds && self.base.unix_fd_passing() {
                    let max_fds = self.base.loader.get_unix_fds()?;
                    let buffer = self.base.loader.get_buffer();
                    let r = socket.read_with_unix_fds(buffer.data, max_to_read, max_fds);
                    self.base.loader.return_buffer();
                    r.map(|(n, fds)| {
                        if !fds.is_empty() {
                            trace!(fd = self.fd, count = fds.len(), "received unix fds");
                        }
                        self.base.loader.return_unix_fds(fds);
                        n
                    })
                } else {
                    let buffer = self.base.loader.get_buffer();
                    let r = socket.read(buffer.data, max_to_read);
                    self.base.loader.return_buffer();
                    r
                }
            };

            match result {
                Ok(0) => {
                    debug!(fd = self.fd, "end of stream");
                    self.disconnect(owner);
                    return Ok(());
                }
                Ok(n) => {
                    trace!(fd = self.fd, bytes = n, "read message data");
                    total += n;
                    self.queue_messages(owner)?;
                }
                Err(e) if e.kind() == io::ErrorKind::OutOfMemory => return Err(OutOfMemory),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read error, disconnecting");
                    self.disconnect(owner);
                    return Ok(());
                }
            }
        }
    }

    fn finish_message(&mut self, owner: &mut dyn TransportOwner) {
        self.message_bytes_written = 0;
        self.encoded_outgoing.clear();
        self.encoded_outgoing.shrink_to(ENCODED_RETAIN);
        owner.message_sent();
    }

    fn do_writing(&mut self, owner: &mut dyn TransportOwner) -> Result<(), OutOfMemory> {
        if !self.try_to_authenticate(owner) || !self.base.is_connected() {
            return Ok(());
        }

        let max = self.base.limits().max_bytes_written_per_iteration;
        let send_fds = self.base.unix_fd_passing();
        let mut total = 0usize;

        while self.base.is_connected() && owner.has_messages_to_send() {
            if total > max {
                return Ok(());
            }
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };
            let Some(message) = owner.message_to_send() else {
                return Ok(());
            };

            let (header, body) = message.network_data();
            let (written, total_to_write) = if self.base.auth.needs_encoding() {
                if self.encoded_outgoing.is_empty() {
                    self.base.auth.encode_data(&header, &mut self.encoded_outgoing)?;
                    if let Err(e) = self.base.auth.encode_data(body, &mut self.encoded_outgoing) {
                        self.encoded_outgoing.clear();
                        return Err(e);
                    }
                }
                let pending = &self.encoded_outgoing[self.message_bytes_written..];
                (socket.write(pending), self.encoded_outgoing.len())
            } else {
                let total_to_write = header.len() + body.len();
                let written = if self.message_bytes_written < header.len() {
                    let head = &header[self.message_bytes_written..];
                    let fds: Vec<RawFd> = message.unix_fds().iter().map(AsRawFd::as_raw_fd).collect();
                    if self.message_bytes_written == 0 && send_fds && !fds.is_empty() {
                        socket.write_with_unix_fds(head, body, &fds)
                    } else {
                        socket.write_two(head, body)
                    }
                } else {
                    socket.write(&body[self.message_bytes_written - header.len()..])
                };
                (written, total_to_write)
            };

            match written {
                Ok(n) => {
                    trace!(fd = self.fd, bytes = n, "wrote message data");
                    total += n;
                    self.message_bytes_written += n;
                    debug_assert!(self.message_bytes_written <= total_to_write);
                    if self.message_bytes_written >= total_to_write {
                        self.finish_message(owner);
                    } else if n == 0 {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // the hangup arrives on the read side
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::ETOOMANYREFS) => {
                    warn!(fd = self.fd, "kernel refused to pass the message's fds, dropping the message");
                    self.finish_message(owner);
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write error, disconnecting");
                    self.disconnect(owner);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn is_own_watch(slot: &Option<Watch>, watch: &Watch) -> bool {
        slot.as_ref().is_some_and(|w| w.ptr_eq(watch))
    }

    fn free_watches(&mut self, owner: &mut dyn TransportOwner) {
        for watch in [self.read_watch.take(), self.write_watch.take()].into_iter().flatten() {
            owner.remove_watch(&watch);
            watch.invalidate();
        }
    }
}

impl TransportBackend for SocketTransport {
    fn base(&self) -> &Transport {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Transport {
        &mut self.base
    }

    fn handle_watch(
        &mut self,
        owner: &mut dyn TransportOwner,
        watch: &Watch,
        condition: WatchFlags,
    ) -> Result<(), OutOfMemory> {
        if !self.base.is_connected() {
            return Ok(());
        }
        let is_read = Self::is_own_watch(&self.read_watch, watch);
        let is_write = Self::is_own_watch(&self.write_watch, watch);
        if !is_read && !is_write {
            warn!(fd = watch.fd(), "asked to handle a watch this transport does not own");
            return Ok(());
        }

        let failed = condition.intersects(WatchFlags::ERROR | WatchFlags::INVALID);
        let hangup = condition.contains(WatchFlags::HANGUP);
        let readable = condition.contains(WatchFlags::READABLE);

        // Buffered input may still be waiting; let the read side notice the error.
        if !readable && (failed || hangup) && is_write && self.read_watch_enabled() {
            return Ok(());
        }
        if failed || (hangup && !readable) {
            debug!(fd = self.fd, condition = ?condition, "hang up or error on watch");
            self.disconnect(owner);
            return Ok(());
        }

        if is_read && readable {
            let completed = self.do_authentication(owner, true, false)?;
            // Hand the authenticated state up before any message is read.
            if !completed {
                self.do_reading(owner)?;
            }
        } else if is_write && condition.contains(WatchFlags::WRITABLE) {
            self.do_authentication(owner, false, true)?;
            self.do_writing(owner)?;
            self.check_write_watch(owner);
        } else {
            trace!(fd = self.fd, condition = ?condition, is_read, "watch fired without a usable condition");
        }
        Ok(())
    }

    fn disconnect(&mut self, owner: &mut dyn TransportOwner) {
        if !self.base.is_connected() {
            return;
        }
        debug!(fd = self.fd, side = self.base.side(), "disconnecting");
        self.free_watches(owner);
        self.socket.take();
        self.base.mark_disconnected();
        owner.notify_disconnected();
    }

    fn connection_set(&mut self, owner: &mut dyn TransportOwner) -> Result<(), OutOfMemory> {
        let (Some(read_watch), Some(write_watch)) = (self.read_watch.clone(), self.write_watch.clone()) else {
            return Ok(());
        };
        owner.add_watch(&write_watch)?;
        if let Err(e) = owner.add_watch(&read_watch) {
            owner.remove_watch(&write_watch);
            return Err(e);
        }
        self.check_read_watch(owner);
        self.check_write_watch(owner);
        Ok(())
    }

    fn prepare_iteration(
        &mut self,
        owner: &mut dyn TransportOwner,
        flags: IterationFlags,
        timeout: Option<Duration>,
    ) -> Option<PollRequest> {
        trace!(fd = self.fd, ?flags, ?timeout, "iteration");
        if !self.base.is_connected() {
            return None;
        }

        let mut interest = WatchFlags::NONE;
        if self.try_to_authenticate(owner) {
            // With only writing asked for, try the write before paying for a poll.
            if flags.do_writing && !flags.do_reading && !flags.block && owner.has_messages_to_send() {
                if self.do_writing(owner).is_err() {
                    debug!(fd = self.fd, "out of memory while writing");
                }
                if !self.base.is_connected() || !owner.has_messages_to_send() {
                    self.check_write_watch(owner);
                    return None;
                }
            }
            if flags.do_reading {
                interest |= WatchFlags::READABLE;
            }
            if flags.do_writing {
                interest |= WatchFlags::WRITABLE;
            }
        } else {
            if !self.base.is_connected() {
                return None;
            }
            let auth_state = self.base.auth.do_work();
            if self.base.receive_credentials_pending || auth_state == AuthState::WaitingForInput {
                interest |= WatchFlags::READABLE;
            }
            if self.base.send_credentials_pending || auth_state == AuthState::HaveBytesToSend {
                interest |= WatchFlags::WRITABLE;
            }
        }

        if interest.is_empty() {
            self.check_write_watch(owner);
            return None;
        }
        Some(PollRequest {
            fd: self.fd,
            interest,
            timeout: if flags.block { timeout } else { Some(Duration::ZERO) },
        })
    }

    fn finish_iteration(
        &mut self,
        owner: &mut dyn TransportOwner,
        flags: IterationFlags,
        revents: io::Result<WatchFlags>,
    ) -> Result<(), OutOfMemory> {
        let result = match revents {
            Err(e) => {
                debug!(fd = self.fd, error = %e, "poll failed");
                Ok(())
            }
            Ok(_) if !self.base.is_connected() => Ok(()),
            Ok(revents) if revents.intersects(WatchFlags::ERROR | WatchFlags::INVALID) => {
                debug!(fd = self.fd, revents = ?revents, "error on socket");
                self.disconnect(owner);
                Ok(())
            }
            Ok(revents) => self.iterate_ready(owner, flags, revents),
        };
        // An iteration always notices newly queued outgoing messages.
        self.check_write_watch(owner);
        result
    }

    fn check_watches(&mut self, owner: &mut dyn TransportOwner) {
        self.check_read_watch(owner);
        self.check_write_watch(owner);
    }

    fn complete_authorization(&mut self, owner: &mut dyn TransportOwner, allowed: bool) {
        if !self.base.finish_authorization(allowed) {
            self.disconnect(owner);
        }
        self.check_watches(owner);
    }
}

impl SocketTransport {
    fn iterate_ready(
        &mut self,
        owner: &mut dyn TransportOwner,
        flags: IterationFlags,
        revents: WatchFlags,
    ) -> Result<(), OutOfMemory> {
        // A hangup with nothing readable left is seen by the next read as end of stream.
        let need_read = revents.intersects(WatchFlags::READABLE | WatchFlags::HANGUP);
        let need_write = revents.contains(WatchFlags::WRITABLE);
        trace!(fd = self.fd, need_read, need_write, "iteration ready");

        if self.do_authentication(owner, need_read, need_write)? {
            return Ok(());
        }
        if need_read && flags.do_reading {
            self.do_reading(owner)?;
        }
        if need_write && flags.do_writing {
            self.do_writing(owner)?;
        }
        Ok(())
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.base.live_counter().set_notify(None);
        for watch in [self.read_watch.take(), self.write_watch.take()].into_iter().flatten() {
            watch.invalidate();
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("fd", &self.fd)
            .field("base", &self.base)
            .field("message_bytes_written", &self.message_bytes_written)
            .finish()
    }
}
