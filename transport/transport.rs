// Transport base: handshake bookkeeping, peer authorization, limits
use crate::limits::TransportLimits;
use crate::traits::{AuthConversation, AuthState, MessageLoader};
use busline_buffer::LiveCounter;
use busline_core::{Credentials, Guid, OutOfMemory, UserId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub type UnixUserPredicate = Arc<dyn Fn(UserId) -> bool + Send + Sync>;
pub type WindowsUserPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Whether the received-message queue has something for the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Complete,
    DataRemains,
    NeedMemory,
}

/// A user-supplied authorization check waiting to be run.
///
/// The owner runs [`evaluate`](AuthorizationRequest::evaluate) with its lock
/// released and reports the verdict back to the transport.
#[derive(Clone)]
pub enum AuthorizationRequest {
    UnixUser { uid: UserId, predicate: UnixUserPredicate },
    WindowsUser { sid: String, predicate: WindowsUserPredicate },
}

impl AuthorizationRequest {
    pub fn evaluate(&self) -> bool {
        match self {
            AuthorizationRequest::UnixUser { uid, predicate } => predicate(*uid),
            AuthorizationRequest::WindowsUser { sid, predicate } => predicate(sid),
        }
    }
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthorizationRequest::UnixUser { uid, .. } => write!(f, "UnixUser({uid})"),
            AuthorizationRequest::WindowsUser { sid, .. } => write!(f, "WindowsUser({sid})"),
        }
    }
}

enum Verdict {
    Unasked,
    Requested(AuthorizationRequest),
    /// Handed to the owner; waiting for the answer.
    Asked,
}

/// Result of one attempt to finish authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProgress {
    Authenticated,
    NotYet,
    /// The peer may not use this transport; the caller disconnects.
    Refused,
}

/// Everything the watch decisions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestInputs {
    pub disconnected: bool,
    pub authenticated: bool,
    pub send_credentials_pending: bool,
    pub receive_credentials_pending: bool,
    pub auth_state: AuthState,
    pub below_live_limits: bool,
    pub has_messages_to_send: bool,
}

/// Should the read watch be enabled?
pub fn read_interest(i: &InterestInputs) -> bool {
    if i.disconnected {
        return false;
    }
    if i.authenticated {
        return i.below_live_limits;
    }
    if i.receive_credentials_pending {
        return true;
    }
    matches!(i.auth_state, AuthState::WaitingForInput | AuthState::WaitingForMemory)
}

/// Should the write watch be enabled?
pub fn write_interest(i: &InterestInputs) -> bool {
    if i.disconnected {
        return false;
    }
    if i.authenticated {
        return i.has_messages_to_send;
    }
    if i.send_credentials_pending {
        return true;
    }
    i.auth_state == AuthState::HaveBytesToSend
}

/// State shared by every concrete transport.
pub struct Transport {
    pub(crate) auth: Box<dyn AuthConversation>,
    pub(crate) loader: Box<dyn MessageLoader>,
    /// What the socket said about the peer, before authentication.
    pub(crate) credentials: Credentials,
    pub(crate) live: Arc<LiveCounter>,
    authenticated: Arc<AtomicBool>,
    disconnected: bool,
    is_server: bool,
    pub(crate) send_credentials_pending: bool,
    pub(crate) receive_credentials_pending: bool,
    expected_guid: Option<Guid>,
    server_guid: Option<Guid>,
    address: Option<String>,
    allow_anonymous: bool,
    unix_user_predicate: Option<UnixUserPredicate>,
    windows_user_predicate: Option<WindowsUserPredicate>,
    verdict: Verdict,
    unused_bytes_recovered: bool,
    unused_stash: Option<Vec<u8>>,
    limits: TransportLimits,
}

impl Transport {
    /// A server transport is one created with its own GUID; it reads the
    /// peer's credentials first, a client sends its own first.
    pub fn new(
        auth: Box<dyn AuthConversation>,
        mut loader: Box<dyn MessageLoader>,
        server_guid: Option<Guid>,
        address: Option<String>,
        limits: TransportLimits,
    ) -> Self {
        let limits = limits.sanitized();
        loader.set_max_message_size(limits.max_message_size);
        loader.set_max_message_unix_fds(limits.max_message_unix_fds);
        let is_server = server_guid.is_some();

        Transport {
            auth,
            loader,
            credentials: Credentials::new(),
            live: LiveCounter::new(ceiling(limits.max_live_bytes), ceiling(limits.max_live_unix_fds)),
            authenticated: Arc::new(AtomicBool::new(false)),
            disconnected: false,
            is_server,
            send_credentials_pending: !is_server,
            receive_credentials_pending: is_server,
            expected_guid: None,
            server_guid,
            address,
            allow_anonymous: false,
            unix_user_predicate: None,
            windows_user_predicate: None,
            verdict: Verdict::Unasked,
            unused_bytes_recovered: false,
            unused_stash: None,
            limits,
        }
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn side(&self) -> &'static str {
        if self.is_server {
            "server"
        } else {
            "client"
        }
    }

    /// Once true, stays true, even after a disconnect.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn authenticated_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.authenticated)
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected
    }

    /// Returns true only the first time.
    pub(crate) fn mark_disconnected(&mut self) -> bool {
        !std::mem::replace(&mut self.disconnected, true)
    }

    pub fn live_counter(&self) -> &Arc<LiveCounter> {
        &self.live
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn set_expected_guid(&mut self, guid: Option<Guid>) {
        self.expected_guid = guid;
    }

    pub fn expected_guid(&self) -> Option<Guid> {
        self.expected_guid
    }

    pub fn set_allow_anonymous(&mut self, allow: bool) {
        self.allow_anonymous = allow;
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    /// Replaces the unix-user check; returns the previous one.
    pub fn set_unix_user_predicate(&mut self, predicate: Option<UnixUserPredicate>) -> Option<UnixUserPredicate> {
        std::mem::replace(&mut self.unix_user_predicate, predicate)
    }

    pub fn set_windows_user_predicate(
        &mut self,
        predicate: Option<WindowsUserPredicate>,
    ) -> Option<WindowsUserPredicate> {
        std::mem::replace(&mut self.windows_user_predicate, predicate)
    }

    pub fn interest_inputs(&mut self, has_messages_to_send: bool) -> InterestInputs {
        let auth_state = if self.is_authenticated() || self.disconnected {
            AuthState::Authenticated
        } else {
            self.auth.do_work()
        };
        InterestInputs {
            disconnected: self.disconnected,
            authenticated: self.is_authenticated(),
            send_credentials_pending: self.send_credentials_pending,
            receive_credentials_pending: self.receive_credentials_pending,
            auth_state,
            below_live_limits: self.live.below_limits(),
            has_messages_to_send,
        }
    }

    /// One attempt at finishing authentication, including peer authorization.
    pub fn authentication_step(&mut self) -> AuthProgress {
        if self.is_authenticated() {
            return AuthProgress::Authenticated;
        }
        if self.disconnected
            || self.send_credentials_pending
            || self.receive_credentials_pending
            || !matches!(self.verdict, Verdict::Unasked)
        {
            return AuthProgress::NotYet;
        }
        if self.auth.do_work() != AuthState::Authenticated {
            return AuthProgress::NotYet;
        }

        if self.is_server {
            let identity = self.auth.identity();
            if let (Some(predicate), Some(uid)) = (&self.unix_user_predicate, identity.unix_uid()) {
                self.verdict = Verdict::Requested(AuthorizationRequest::UnixUser {
                    uid,
                    predicate: Arc::clone(predicate),
                });
                return AuthProgress::NotYet;
            }
            if let (Some(predicate), Some(sid)) = (&self.windows_user_predicate, identity.windows_sid()) {
                self.verdict = Verdict::Requested(AuthorizationRequest::WindowsUser {
                    sid: sid.to_string(),
                    predicate: Arc::clone(predicate),
                });
                return AuthProgress::NotYet;
            }
            if !self.allowed_by_default_rules(&identity) {
                return AuthProgress::Refused;
            }
        } else if let Some(expected) = self.expected_guid {
            let actual = self.auth.guid_from_server();
            if actual != Some(expected) {
                warn!(%expected, actual = ?actual, "server guid does not match the address, disconnecting");
                return AuthProgress::Refused;
            }
        }

        self.set_authenticated();
        AuthProgress::Authenticated
    }

    fn set_authenticated(&mut self) {
        debug!(side = self.side(), "transport authenticated");
        self.authenticated.store(true, Ordering::Release);
    }

    /// Anyone when anonymous peers are allowed; otherwise our own user or root.
    fn allowed_by_default_rules(&self, identity: &Credentials) -> bool {
        if self.allow_anonymous {
            return true;
        }
        if identity.is_anonymous() {
            debug!("anonymous peer refused");
            return false;
        }
        let ours = Credentials::from_current_process();
        if identity.same_user_as(&ours) {
            return true;
        }
        if identity.unix_uid().is_some_and(|uid| uid.is_root()) {
            debug!("peer is root, allowing");
            return true;
        }
        debug!(peer = %identity, ours = %ours, "peer is a different user, refusing");
        false
    }

    /// Hands out a pending user-predicate check, at most once.
    pub fn take_authorization_request(&mut self) -> Option<AuthorizationRequest> {
        match std::mem::replace(&mut self.verdict, Verdict::Unasked) {
            Verdict::Requested(request) => {
                self.verdict = Verdict::Asked;
                Some(request)
            }
            other => {
                self.verdict = other;
                None
            }
        }
    }

    pub fn awaiting_authorization(&self) -> bool {
        !matches!(self.verdict, Verdict::Unasked)
    }

    /// Records the verdict. Returns false when the peer was refused.
    pub(crate) fn finish_authorization(&mut self, allowed: bool) -> bool {
        self.verdict = Verdict::Unasked;
        if self.disconnected {
            return false;
        }
        if !allowed {
            debug!(side = self.side(), "peer rejected by authorization predicate");
            return false;
        }
        self.set_authenticated();
        true
    }

    pub fn unused_bytes_recovered(&self) -> bool {
        self.unused_bytes_recovered
    }

    /// Moves what the handshake read past its end into the loader.
    pub fn recover_unused_bytes(&mut self) -> Result<(), OutOfMemory> {
        if self.unused_bytes_recovered {
            return Ok(());
        }
        let bytes = match self.unused_stash.take() {
            Some(bytes) => bytes,
            None => self.auth.take_unused_bytes(),
        };

        let result = if self.auth.needs_decoding() {
            let buffer = self.loader.get_buffer();
            let r = self.auth.decode_data(&bytes, buffer.data);
            self.loader.return_buffer();
            r
        } else {
            let buffer = self.loader.get_buffer();
            let r = buffer.data.try_reserve(bytes.len()).map_err(OutOfMemory::from);
            if r.is_ok() {
                buffer.data.extend_from_slice(&bytes);
            }
            self.loader.return_buffer();
            r
        };
        if let Err(e) = result {
            self.unused_stash = Some(bytes);
            return Err(e);
        }

        if !bytes.is_empty() {
            debug!(len = bytes.len(), "recovered bytes read during authentication");
        }
        self.loader.set_unix_fd_passing(self.auth.unix_fd_negotiated());
        self.unused_bytes_recovered = true;
        Ok(())
    }

    /// True once authenticated with fd passing agreed by both sides.
    pub fn unix_fd_passing(&self) -> bool {
        self.is_authenticated() && self.auth.unix_fd_negotiated()
    }

    fn peer_identity(&self) -> Option<Credentials> {
        self.is_authenticated().then(|| self.auth.identity())
    }

    /// Unauthenticated peers count as anonymous.
    pub fn is_anonymous(&self) -> bool {
        self.peer_identity().map_or(true, |id| id.is_anonymous())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.peer_identity()
    }

    pub fn unix_user(&self) -> Option<UserId> {
        self.peer_identity()?.unix_uid()
    }

    pub fn unix_process_id(&self) -> Option<busline_core::ProcessId> {
        self.peer_identity()?.pid()
    }

    pub fn windows_user(&self) -> Option<String> {
        self.peer_identity()?.windows_sid().map(str::to_string)
    }

    pub fn linux_security_label(&self) -> Option<String> {
        self.peer_identity()?.linux_security_label().map(str::to_string)
    }

    pub fn adt_audit_session_data(&self) -> Option<Vec<u8>> {
        self.peer_identity()?.audit_data().map(<[u8]>::to_vec)
    }

    /// Our own GUID on a server; the server's once a client is authenticated.
    pub fn server_id(&self) -> Option<Guid> {
        if self.is_server {
            self.server_guid
        } else if self.is_authenticated() {
            self.auth.guid_from_server()
        } else {
            None
        }
    }

    pub fn limits(&self) -> TransportLimits {
        self.limits
    }

    pub fn set_max_message_size(&mut self, size: usize) {
        self.loader.set_max_message_size(size);
        self.limits.max_message_size = self.loader.max_message_size();
    }

    pub fn max_message_size(&self) -> usize {
        self.loader.max_message_size()
    }

    pub fn set_max_message_unix_fds(&mut self, n: usize) {
        self.loader.set_max_message_unix_fds(n);
        self.limits.max_message_unix_fds = self.loader.max_message_unix_fds();
    }

    pub fn max_message_unix_fds(&self) -> usize {
        self.loader.max_message_unix_fds()
    }

    /// Ceiling on received-but-unprocessed bytes. The owner re-checks watches afterwards.
    pub fn set_max_received_size(&mut self, size: usize) {
        self.limits.max_live_bytes = size;
        self.live.set_size_limit(ceiling(size));
    }

    pub fn max_received_size(&self) -> usize {
        self.limits.max_live_bytes
    }

    pub fn set_max_received_unix_fds(&mut self, n: usize) {
        self.limits.max_live_unix_fds = n;
        self.live.set_unix_fd_limit(ceiling(n));
    }

    pub fn max_received_unix_fds(&self) -> usize {
        self.limits.max_live_unix_fds
    }

    pub fn set_max_bytes_per_iteration(&mut self, read: usize, written: usize) {
        self.limits.max_bytes_read_per_iteration = read;
        self.limits.max_bytes_written_per_iteration = written;
        self.limits = self.limits.sanitized();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transport")
            .field("side", &self.side())
            .field("authenticated", &self.is_authenticated())
            .field("disconnected", &self.disconnected)
            .field("send_credentials_pending", &self.send_credentials_pending)
            .field("receive_credentials_pending", &self.receive_credentials_pending)
            .field("live", &self.live)
            .finish()
    }
}

// Limits past i64::MAX mean unlimited.
fn ceiling(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::FrameLoader;
    use crate::testing::ScriptedAuth;
    use busline_core::ProcessId;
    use proptest::prelude::*;

    fn server_with(identity: Credentials) -> Transport {
        let mut t = Transport::new(
            Box::new(ScriptedAuth::authenticated(identity)),
            Box::new(FrameLoader::new()),
            Some(Guid::generate()),
            None,
            TransportLimits::default(),
        );
        t.receive_credentials_pending = false;
        t
    }

    fn uid_creds(uid: u32) -> Credentials {
        let mut c = Credentials::new();
        c.add_unix_uid(UserId(uid));
        c.add_pid(ProcessId(99));
        c
    }

    fn own_uid() -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn foreign_uid() -> u32 {
        // neither us nor root
        if own_uid() == 4242 {
            4243
        } else {
            4242
        }
    }

    #[test]
    fn roles_follow_server_guid() {
        let server = server_with(Credentials::new());
        assert!(server.is_server());
        let client = Transport::new(
            Box::new(ScriptedAuth::authenticated(Credentials::new())),
            Box::new(FrameLoader::new()),
            None,
            None,
            TransportLimits::default(),
        );
        assert!(!client.is_server());
        assert!(client.send_credentials_pending);
        assert!(!client.receive_credentials_pending);
    }

    #[test]
    fn same_user_is_allowed() {
        let mut t = server_with(uid_creds(own_uid()));
        assert_eq!(t.authentication_step(), AuthProgress::Authenticated);
        assert_eq!(t.unix_user(), Some(UserId(own_uid())));
        assert_eq!(t.unix_process_id(), Some(ProcessId(99)));
    }

    #[test]
    fn root_is_allowed() {
        let mut t = server_with(uid_creds(0));
        assert_eq!(t.authentication_step(), AuthProgress::Authenticated);
    }

    #[test]
    fn foreign_user_is_refused() {
        let mut t = server_with(uid_creds(foreign_uid()));
        assert_eq!(t.authentication_step(), AuthProgress::Refused);
        assert!(!t.is_authenticated());
    }

    #[test]
    fn anonymous_needs_permission() {
        let mut t = server_with(Credentials::new());
        assert_eq!(t.authentication_step(), AuthProgress::Refused);

        let mut t = server_with(Credentials::new());
        t.set_allow_anonymous(true);
        assert_eq!(t.authentication_step(), AuthProgress::Authenticated);
        assert!(t.is_anonymous());
    }

    #[test]
    fn allowing_anonymous_admits_any_user() {
        let mut t = server_with(uid_creds(foreign_uid()));
        t.set_allow_anonymous(true);
        assert_eq!(t.authentication_step(), AuthProgress::Authenticated);
        assert_eq!(t.unix_user(), Some(UserId(foreign_uid())));
    }

    #[test]
    fn unlimited_live_ceilings_stay_readable() {
        let mut t = server_with(uid_creds(own_uid()));
        t.set_max_received_size(usize::MAX);
        t.set_max_received_unix_fds(usize::MAX);
        assert_eq!(t.live_counter().size_limit(), i64::MAX);
        assert!(t.live_counter().below_limits());

        let t = Transport::new(
            Box::new(ScriptedAuth::authenticated(Credentials::new())),
            Box::new(FrameLoader::new()),
            None,
            None,
            TransportLimits {
                max_live_bytes: usize::MAX,
                ..TransportLimits::default()
            },
        );
        assert!(t.live_counter().below_limits());
    }

    #[test]
    fn predicate_runs_through_request() {
        let mut t = server_with(uid_creds(foreign_uid()));
        let expected = foreign_uid();
        t.set_unix_user_predicate(Some(Arc::new(move |uid| uid.0 == expected)));

        assert_eq!(t.authentication_step(), AuthProgress::NotYet);
        let request = t.take_authorization_request().unwrap();
        assert!(t.take_authorization_request().is_none());
        assert_eq!(t.authentication_step(), AuthProgress::NotYet);

        assert!(request.evaluate());
        assert!(t.finish_authorization(true));
        assert!(t.is_authenticated());
        assert_eq!(t.authentication_step(), AuthProgress::Authenticated);
    }

    #[test]
    fn client_checks_server_guid() {
        let advertised = Guid::generate();
        let mut t = Transport::new(
            Box::new(ScriptedAuth::authenticated(Credentials::new()).with_server_guid(advertised)),
            Box::new(FrameLoader::new()),
            None,
            None,
            TransportLimits::default(),
        );
        t.send_credentials_pending = false;
        t.set_expected_guid(Some(Guid::generate()));
        assert_eq!(t.authentication_step(), AuthProgress::Refused);

        t.set_expected_guid(Some(advertised));
        assert_eq!(t.authentication_step(), AuthProgress::Authenticated);
        assert_eq!(t.server_id(), Some(advertised));
    }

    #[test]
    fn unauthenticated_transport_reports_nothing() {
        let t = server_with(uid_creds(own_uid()));
        assert!(t.is_anonymous());
        assert_eq!(t.unix_user(), None);
        assert_eq!(t.credentials(), None);
    }

    #[test]
    fn unused_bytes_land_in_loader() {
        let mut auth = ScriptedAuth::authenticated(uid_creds(own_uid()));
        auth.unused = b"leftover".to_vec();
        let mut t = Transport::new(
            Box::new(auth),
            Box::new(FrameLoader::new()),
            Some(Guid::generate()),
            None,
            TransportLimits::default(),
        );
        t.recover_unused_bytes().unwrap();
        assert!(t.unused_bytes_recovered());
        assert_eq!(t.loader.get_buffer().data.as_slice(), b"leftover");
    }

    fn arb_auth_state() -> impl Strategy<Value = AuthState> {
        prop_oneof![
            Just(AuthState::WaitingForInput),
            Just(AuthState::WaitingForMemory),
            Just(AuthState::HaveBytesToSend),
            Just(AuthState::NeedDisconnect),
            Just(AuthState::Authenticated),
        ]
    }

    prop_compose! {
        fn arb_inputs()(
            disconnected in any::<bool>(),
            authenticated in any::<bool>(),
            send_credentials_pending in any::<bool>(),
            receive_credentials_pending in any::<bool>(),
            auth_state in arb_auth_state(),
            below_live_limits in any::<bool>(),
            has_messages_to_send in any::<bool>(),
        ) -> InterestInputs {
            InterestInputs {
                disconnected,
                authenticated,
                send_credentials_pending,
                receive_credentials_pending,
                auth_state,
                below_live_limits,
                has_messages_to_send,
            }
        }
    }

    proptest! {
        #[test]
        fn disconnected_wants_nothing(i in arb_inputs()) {
            let i = InterestInputs { disconnected: true, ..i };
            prop_assert!(!read_interest(&i));
            prop_assert!(!write_interest(&i));
        }

        #[test]
        fn authenticated_interest_tracks_queues(i in arb_inputs()) {
            let i = InterestInputs { disconnected: false, authenticated: true, ..i };
            prop_assert_eq!(read_interest(&i), i.below_live_limits);
            prop_assert_eq!(write_interest(&i), i.has_messages_to_send);
        }

        #[test]
        fn handshake_interest_tracks_auth(i in arb_inputs()) {
            let i = InterestInputs { disconnected: false, authenticated: false, ..i };
            let wants_read = i.receive_credentials_pending
                || matches!(i.auth_state, AuthState::WaitingForInput | AuthState::WaitingForMemory);
            let wants_write = i.send_credentials_pending || i.auth_state == AuthState::HaveBytesToSend;
            prop_assert_eq!(read_interest(&i), wants_read);
            prop_assert_eq!(write_interest(&i), wants_write);
        }
    }
}
