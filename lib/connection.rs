// Connection: owns one transport, queues traffic both ways and delivers events
use crate::config::SETTINGS;
use crate::error::ConnectionError;
use crate::mainloop::Reactor;
use busline_buffer::{LiveCharge, LocklessQueue};
use busline_core::{Credentials, Guid, Message, OutOfMemory, ProcessId, Timeout, UserId, Watch, WatchFlags};
use busline_transport::poll::poll_one;
use busline_transport::{
    DispatchStatus, IterationFlags, SocketTransport, Transport, TransportBackend, TransportError, TransportLimits,
    TransportListener, TransportOwner, UnixUserPredicate, WindowsUserPredicate,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

/// A received message. It counts against the connection's live limits until
/// dropped, so holding on to many of them pauses reading.
pub struct IncomingMessage {
    message: Message,
    _charge: LiveCharge,
}

impl IncomingMessage {
    /// Releases the live accounting and keeps only the message.
    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Deref for IncomingMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for IncomingMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.message, f)
    }
}

#[derive(Debug)]
pub enum Event {
    Message(IncomingMessage),
    /// The transport is gone. Delivered once, after every message received before it.
    Disconnected,
}

pub type EventHandler = Box<dyn FnMut(&Connection, Event) + Send>;

struct ConnectionState {
    outgoing: VecDeque<Message>,
    incoming: LocklessQueue<IncomingMessage>,
    watches: Vec<Watch>,
    reactor: Option<Reactor>,
    this: Weak<ConnectionShared>,
    auth_timeout: Option<Timeout>,
    disconnect_pending: bool,
    last_serial: u32,
}

impl ConnectionState {
    fn next_serial(&mut self) -> u32 {
        self.last_serial = self.last_serial.wrapping_add(1);
        if self.last_serial == 0 {
            self.last_serial = 1;
        }
        self.last_serial
    }

    fn drop_auth_timeout(&mut self) {
        if let Some(timeout) = self.auth_timeout.take() {
            timeout.set_enabled(false);
            timeout.clear_handler();
            if let Some(reactor) = &self.reactor {
                reactor.remove_timeout(&timeout);
            }
        }
    }
}

impl TransportOwner for ConnectionState {
    fn has_messages_to_send(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn message_to_send(&self) -> Option<&Message> {
        self.outgoing.front()
    }

    fn message_sent(&mut self) {
        if let Some(message) = self.outgoing.pop_front() {
            trace!(serial = message.serial(), size = message.size(), "message sent");
        }
    }

    fn queue_received_message(&mut self, message: Message, charge: LiveCharge) {
        trace!(serial = message.serial(), size = message.size(), "message received");
        self.incoming.push(IncomingMessage {
            message,
            _charge: charge,
        });
    }

    fn add_watch(&mut self, watch: &Watch) -> Result<(), OutOfMemory> {
        self.watches.try_reserve(1)?;
        let this = self.this.clone();
        watch.set_handler(Box::new(move |w, condition| match this.upgrade() {
            Some(shared) => Connection { shared }.handle_watch(w, condition),
            None => Ok(()),
        }));
        if let Some(reactor) = &self.reactor {
            reactor.add_watch(watch)?;
        }
        self.watches.push(watch.clone());
        Ok(())
    }

    fn remove_watch(&mut self, watch: &Watch) {
        let before = self.watches.len();
        self.watches.retain(|w| !w.ptr_eq(watch));
        if self.watches.len() != before {
            if let Some(reactor) = &self.reactor {
                reactor.remove_watch(watch);
            }
        }
    }

    fn notify_disconnected(&mut self) {
        debug!("connection closed");
        self.disconnect_pending = true;
    }
}

struct ConnectionInner {
    transport: Box<dyn TransportBackend>,
    state: ConnectionState,
}

struct ConnectionShared {
    inner: Mutex<ConnectionInner>,
    incoming: LocklessQueue<IncomingMessage>,
    handler: Mutex<Option<EventHandler>>,
    disconnect_delivered: AtomicBool,
}

impl Drop for ConnectionShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let state = &mut inner.state;
        if let Some(reactor) = state.reactor.take() {
            for watch in &state.watches {
                reactor.remove_watch(watch);
            }
            if let Some(timeout) = state.auth_timeout.take() {
                reactor.remove_timeout(&timeout);
            }
        }
    }
}

/// Shared handle to one connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Connects to the first reachable entry of a server address.
    pub fn open(address: &str) -> Result<Self, ConnectionError> {
        Self::open_with_limits(address, SETTINGS.limits)
    }

    pub fn open_with_limits(address: &str, limits: TransportLimits) -> Result<Self, ConnectionError> {
        let transport = SocketTransport::open_any(address, limits)?;
        Ok(Self::from_transport(transport)?)
    }

    /// Takes the next waiting peer off a listener, if any.
    pub fn accept<L>(listener: &mut L) -> Result<Option<Self>, ConnectionError>
    where
        L: TransportListener,
        L::Backend: 'static,
    {
        match listener.accept().map_err(TransportError::from)? {
            Some(transport) => Ok(Some(Self::from_transport(transport)?)),
            None => Ok(None),
        }
    }

    pub fn from_transport(transport: impl TransportBackend + 'static) -> Result<Self, OutOfMemory> {
        let incoming = LocklessQueue::new();
        let shared = Arc::new_cyclic(|this| ConnectionShared {
            inner: Mutex::new(ConnectionInner {
                transport: Box::new(transport),
                state: ConnectionState {
                    outgoing: VecDeque::new(),
                    incoming: incoming.clone_handle(),
                    watches: Vec::new(),
                    reactor: None,
                    this: this.clone(),
                    auth_timeout: None,
                    disconnect_pending: false,
                    last_serial: 0,
                },
            }),
            incoming,
            handler: Mutex::new(None),
            disconnect_delivered: AtomicBool::new(false),
        });

        {
            let mut inner = shared.inner.lock();
            let ConnectionInner { transport, state } = &mut *inner;
            transport.connection_set(state)?;
            debug!(side = transport.base().side(), "connection created");
        }
        Ok(Connection { shared })
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Hands the connection's watches (and auth timeout) to a reactor.
    pub fn attach(&self, reactor: &Reactor) -> Result<(), OutOfMemory> {
        {
            let mut inner = self.shared.inner.lock();
            let state = &mut inner.state;
            if let Some(current) = &state.reactor {
                if !current.ptr_eq(reactor) {
                    error!("connection is already attached to another reactor");
                    debug_assert!(false, "connection is already attached to another reactor");
                }
                return Ok(());
            }

            let mut added = 0;
            let mut result = Ok(());
            for watch in &state.watches {
                if let Err(e) = reactor.add_watch(watch) {
                    result = Err(e);
                    break;
                }
                added += 1;
            }
            if result.is_ok() {
                if let Some(timeout) = &state.auth_timeout {
                    result = reactor.add_timeout(timeout);
                }
            }
            if let Err(e) = result {
                for watch in &state.watches[..added] {
                    reactor.remove_watch(watch);
                }
                return Err(e);
            }
            state.reactor = Some(reactor.clone());
        }
        self.queue_dispatch_if_needed();
        Ok(())
    }

    /// Takes the connection's watches back from its reactor.
    pub fn detach(&self) {
        let mut inner = self.shared.inner.lock();
        let state = &mut inner.state;
        if let Some(reactor) = state.reactor.take() {
            for watch in &state.watches {
                reactor.remove_watch(watch);
            }
            if let Some(timeout) = &state.auth_timeout {
                reactor.remove_timeout(timeout);
            }
        }
    }

    /// Queues a message. A zero serial gets the next one from this
    /// connection; the serial used is returned.
    pub fn send(&self, mut message: Message) -> Result<u32, ConnectionError> {
        let mut inner = self.shared.inner.lock();
        let ConnectionInner { transport, state } = &mut *inner;
        if !transport.base().is_connected() {
            return Err(ConnectionError::Disconnected);
        }
        if !message.unix_fds().is_empty() && !transport.base().unix_fd_passing() {
            return Err(ConnectionError::UnixFdsUnsupported);
        }
        let serial = match message.serial() {
            0 => state.next_serial(),
            serial => serial,
        };
        message.set_serial(serial);
        state.outgoing.try_reserve(1).map_err(OutOfMemory::from)?;
        trace!(serial, size = message.size(), "message queued");
        state.outgoing.push_back(message);
        transport.check_watches(state);
        Ok(serial)
    }

    pub fn has_messages_to_send(&self) -> bool {
        !self.shared.inner.lock().state.outgoing.is_empty()
    }

    pub fn outgoing_len(&self) -> usize {
        self.shared.inner.lock().state.outgoing.len()
    }

    /// Blocks until everything queued has been written or the connection closes.
    pub fn flush(&self) -> Result<(), OutOfMemory> {
        while self.is_connected() && self.has_messages_to_send() {
            self.iterate(
                IterationFlags {
                    do_reading: true,
                    do_writing: true,
                    block: true,
                },
                None,
            )?;
        }
        Ok(())
    }

    /// One blocking read/write pass, waiting at most `timeout` (`None` waits
    /// until something happens). Returns whether the connection is still open.
    pub fn read_write(&self, timeout: Option<Duration>) -> Result<bool, OutOfMemory> {
        self.iterate(
            IterationFlags {
                do_reading: true,
                do_writing: true,
                block: true,
            },
            timeout,
        )?;
        Ok(self.is_connected())
    }

    fn iterate(&self, flags: IterationFlags, timeout: Option<Duration>) -> Result<(), OutOfMemory> {
        let result = {
            let mut inner = self.shared.inner.lock();
            let request = {
                let ConnectionInner { transport, state } = &mut *inner;
                transport.prepare_iteration(state, flags, timeout)
            };
            self.settle(&mut inner);

            match request {
                Some(request) => {
                    let revents = MutexGuard::unlocked(&mut inner, || poll_one(&request));
                    if let Err(e) = &revents {
                        debug!(fd = request.fd, error = %e, "poll failed during connection iteration");
                    }
                    let result = {
                        let ConnectionInner { transport, state } = &mut *inner;
                        transport.finish_iteration(state, flags, revents)
                    };
                    self.settle(&mut inner);
                    result
                }
                None => Ok(()),
            }
        };
        self.queue_dispatch_if_needed();
        result
    }

    fn handle_watch(&self, watch: &Watch, condition: WatchFlags) -> Result<(), OutOfMemory> {
        let result = {
            let mut inner = self.shared.inner.lock();
            let result = {
                let ConnectionInner { transport, state } = &mut *inner;
                transport.handle_watch(state, watch, condition)
            };
            self.settle(&mut inner);
            result
        };
        self.queue_dispatch_if_needed();
        result
    }

    /// Runs user authorization predicates the transport asked for, with the
    /// connection unlocked, and drops the auth timeout once it is moot.
    fn settle(&self, inner: &mut MutexGuard<'_, ConnectionInner>) {
        while let Some(request) = inner.transport.base_mut().take_authorization_request() {
            let allowed = MutexGuard::unlocked(inner, || request.evaluate());
            trace!(allowed, "authorization predicate answered");
            let ConnectionInner { transport, state } = &mut **inner;
            transport.complete_authorization(state, allowed);
        }

        let ConnectionInner { transport, state } = &mut **inner;
        let base = transport.base();
        if state.auth_timeout.is_some() && (base.is_authenticated() || !base.is_connected()) {
            state.drop_auth_timeout();
        }
    }

    fn queue_dispatch_if_needed(&self) {
        let reactor = self.shared.inner.lock().state.reactor.clone();
        let Some(reactor) = reactor else {
            return;
        };
        if self.dispatch_status() != DispatchStatus::Complete && reactor.queue_dispatch(self).is_err() {
            debug!("no memory to queue connection for dispatch");
        }
    }

    /// Installs the receiver of messages and the disconnect notice. Without
    /// one, messages wait for [`Connection::pop_message`].
    pub fn set_event_handler(&self, handler: impl FnMut(&Connection, Event) + Send + 'static) {
        *self.shared.handler.lock() = Some(Box::new(handler));
        self.queue_dispatch_if_needed();
    }

    pub fn clear_event_handler(&self) {
        self.shared.handler.lock().take();
    }

    pub fn dispatch_status(&self) -> DispatchStatus {
        let mut inner = self.shared.inner.lock();
        let status = {
            let ConnectionInner { transport, state } = &mut *inner;
            transport.dispatch_status(state)
        };
        self.settle(&mut inner);

        if self.shared.handler.lock().is_none() {
            return DispatchStatus::Complete;
        }
        if !self.shared.incoming.is_empty() || self.disconnect_event_pending(&inner) {
            return DispatchStatus::DataRemains;
        }
        status
    }

    fn disconnect_event_pending(&self, inner: &ConnectionInner) -> bool {
        inner.state.disconnect_pending && !self.shared.disconnect_delivered.load(Ordering::Acquire)
    }

    /// Moves loaded messages into the incoming queue and, with a handler
    /// installed, delivers one event to it.
    pub fn dispatch(&self) -> DispatchStatus {
        if self.shared.incoming.is_empty() && self.load_incoming().is_err() {
            return DispatchStatus::NeedMemory;
        }

        let taken = self.shared.handler.lock().take();
        let Some(mut handler) = taken else {
            return DispatchStatus::Complete;
        };

        let event = match self.shared.incoming.pop() {
            Some(message) => Some(Event::Message(message)),
            None => self.take_disconnect_event(),
        };
        if let Some(event) = event {
            handler(self, event);
        }

        {
            let mut slot = self.shared.handler.lock();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
        self.dispatch_status()
    }

    fn load_incoming(&self) -> Result<(), OutOfMemory> {
        let mut inner = self.shared.inner.lock();
        let result = {
            let ConnectionInner { transport, state } = &mut *inner;
            transport.queue_messages(state)
        };
        self.settle(&mut inner);
        result
    }

    fn take_disconnect_event(&self) -> Option<Event> {
        let inner = self.shared.inner.lock();
        if !inner.state.disconnect_pending {
            return None;
        }
        if self.shared.disconnect_delivered.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Event::Disconnected)
    }

    /// Next received message, loading more from the transport if the queue is empty.
    pub fn pop_message(&self) -> Option<IncomingMessage> {
        if let Some(message) = self.shared.incoming.pop() {
            return Some(message);
        }
        if self.load_incoming().is_err() {
            debug!("no memory to load incoming messages");
        }
        self.shared.incoming.pop()
    }

    pub fn incoming_len(&self) -> usize {
        self.shared.incoming.len()
    }

    /// Closes the transport. Safe to call any number of times.
    pub fn disconnect(&self) {
        {
            let mut inner = self.shared.inner.lock();
            {
                let ConnectionInner { transport, state } = &mut *inner;
                transport.disconnect(state);
            }
            self.settle(&mut inner);
        }
        self.queue_dispatch_if_needed();
    }

    /// Disconnects a peer that has not authenticated within `timeout`.
    pub fn set_auth_timeout(&self, timeout: Duration) -> Result<(), OutOfMemory> {
        let mut inner = self.shared.inner.lock();
        let ConnectionInner { transport, state } = &mut *inner;
        state.drop_auth_timeout();
        if transport.base().is_authenticated() || !transport.base().is_connected() {
            return Ok(());
        }

        let timer = Timeout::new(timeout, true);
        let this = state.this.clone();
        timer.set_handler(Box::new(move |t| {
            t.set_enabled(false);
            if let Some(shared) = this.upgrade() {
                let connection = Connection { shared };
                if !connection.is_authenticated() {
                    debug!("peer did not authenticate in time, disconnecting");
                    connection.disconnect();
                }
            }
            Ok(())
        }));
        if let Some(reactor) = &state.reactor {
            reactor.add_timeout(&timer)?;
        }
        state.auth_timeout = Some(timer);
        Ok(())
    }

    fn with_base<R>(&self, f: impl FnOnce(&Transport) -> R) -> R {
        let inner = self.shared.inner.lock();
        f(inner.transport.base())
    }

    fn with_transport<R>(
        &self,
        f: impl FnOnce(&mut (dyn TransportBackend + 'static), &mut ConnectionState) -> R,
    ) -> R {
        let mut inner = self.shared.inner.lock();
        let ConnectionInner { transport, state } = &mut *inner;
        f(transport.as_mut(), state)
    }

    pub fn is_connected(&self) -> bool {
        self.with_base(|t| t.is_connected())
    }

    pub fn is_authenticated(&self) -> bool {
        self.with_base(|t| t.is_authenticated())
    }

    pub fn is_anonymous(&self) -> bool {
        self.with_base(|t| t.is_anonymous())
    }

    pub fn is_server(&self) -> bool {
        self.with_base(|t| t.is_server())
    }

    pub fn address(&self) -> Option<String> {
        self.with_base(|t| t.address().map(str::to_owned))
    }

    pub fn server_id(&self) -> Option<Guid> {
        self.with_base(|t| t.server_id())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.with_base(|t| t.credentials())
    }

    pub fn unix_user(&self) -> Option<UserId> {
        self.with_base(|t| t.unix_user())
    }

    pub fn unix_process_id(&self) -> Option<ProcessId> {
        self.with_base(|t| t.unix_process_id())
    }

    pub fn windows_user(&self) -> Option<String> {
        self.with_base(|t| t.windows_user())
    }

    pub fn linux_security_label(&self) -> Option<String> {
        self.with_base(|t| t.linux_security_label())
    }

    pub fn adt_audit_session_data(&self) -> Option<Vec<u8>> {
        self.with_base(|t| t.adt_audit_session_data())
    }

    pub fn can_pass_unix_fds(&self) -> bool {
        self.with_base(|t| t.unix_fd_passing())
    }

    /// Replaces the default same-user rule for unix peers. The predicate runs
    /// with the connection unlocked.
    pub fn set_unix_user_predicate(&self, predicate: impl Fn(UserId) -> bool + Send + Sync + 'static) {
        let predicate: UnixUserPredicate = Arc::new(predicate);
        self.with_transport(|t, _| {
            t.base_mut().set_unix_user_predicate(Some(predicate));
        });
    }

    pub fn clear_unix_user_predicate(&self) {
        self.with_transport(|t, _| {
            t.base_mut().set_unix_user_predicate(None);
        });
    }

    pub fn set_windows_user_predicate(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        let predicate: WindowsUserPredicate = Arc::new(predicate);
        self.with_transport(|t, _| {
            t.base_mut().set_windows_user_predicate(Some(predicate));
        });
    }

    pub fn clear_windows_user_predicate(&self) {
        self.with_transport(|t, _| {
            t.base_mut().set_windows_user_predicate(None);
        });
    }

    pub fn set_allow_anonymous(&self, allow: bool) {
        self.with_transport(|t, _| t.base_mut().set_allow_anonymous(allow));
    }

    pub fn limits(&self) -> TransportLimits {
        self.with_base(|t| t.limits())
    }

    pub fn set_max_message_size(&self, size: usize) {
        self.with_transport(|t, _| t.base_mut().set_max_message_size(size));
    }

    pub fn set_max_message_unix_fds(&self, n: usize) {
        self.with_transport(|t, _| t.base_mut().set_max_message_unix_fds(n));
    }

    /// Bytes of received, unprocessed messages at which reading pauses.
    pub fn set_max_received_size(&self, size: usize) {
        self.with_transport(|t, state| {
            t.base_mut().set_max_received_size(size);
            t.check_watches(state);
        });
    }

    pub fn set_max_received_unix_fds(&self, n: usize) {
        self.with_transport(|t, state| {
            t.base_mut().set_max_received_unix_fds(n);
            t.check_watches(state);
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        let base = inner.transport.base();
        f.debug_struct("Connection")
            .field("side", &base.side())
            .field("connected", &base.is_connected())
            .field("authenticated", &base.is_authenticated())
            .field("outgoing", &inner.state.outgoing.len())
            .field("incoming", &self.shared.incoming.len())
            .finish()
    }
}
