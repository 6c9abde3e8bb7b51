// SASL-style handshake: CRLF-terminated command lines, EXTERNAL and ANONYMOUS mechanisms
use crate::traits::{AuthConversation, AuthState};
use busline_core::{CredentialKind, Credentials, Guid, OutOfMemory, UserId};
use tracing::{debug, trace};

/// Rejections tolerated before the server gives up on a peer.
pub const MAX_AUTH_FAILURES: u32 = 6;
/// Unterminated input or unsent output beyond this disconnects.
pub const MAX_AUTH_BUFFER: usize = 16 * 1024;

/// Room reserved for one reply line before a command is consumed, so an
/// allocation failure never loses a half-processed command.
const REPLY_RESERVE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    External,
    Anonymous,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::External => "EXTERNAL",
            Mechanism::Anonymous => "ANONYMOUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "EXTERNAL" => Some(Mechanism::External),
            "ANONYMOUS" => Some(Mechanism::Anonymous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ClientStart,
    ClientWaitingForOk(Mechanism),
    ClientWaitingForAgreeUnixFd,
    ServerWaitingForAuth,
    ServerWaitingForData(Mechanism),
    ServerWaitingForBegin,
    Authenticated,
    NeedDisconnect,
}

/// Line-protocol authentication for one side of a connection.
pub struct SaslAuth {
    state: State,
    server: bool,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    mechanisms: Vec<Mechanism>,
    /// Client: index of the mechanism currently being tried.
    mech_cursor: usize,
    /// Server: what the socket told us about the peer.
    credentials: Credentials,
    /// Client: who we claim to be.
    own_identity: Credentials,
    authorized_identity: Credentials,
    guid: Option<Guid>,
    unix_fd_possible: bool,
    unix_fd_negotiated: bool,
    failures: u32,
}

impl SaslAuth {
    pub fn client() -> Self {
        Self::client_with_identity(Credentials::from_current_process())
    }

    pub fn client_with_identity(identity: Credentials) -> Self {
        SaslAuth {
            state: State::ClientStart,
            own_identity: identity,
            ..Self::blank()
        }
    }

    pub fn server(guid: Guid) -> Self {
        SaslAuth {
            state: State::ServerWaitingForAuth,
            server: true,
            guid: Some(guid),
            ..Self::blank()
        }
    }

    fn blank() -> Self {
        SaslAuth {
            state: State::NeedDisconnect,
            server: false,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            mechanisms: vec![Mechanism::External, Mechanism::Anonymous],
            mech_cursor: 0,
            credentials: Credentials::new(),
            own_identity: Credentials::new(),
            authorized_identity: Credentials::new(),
            guid: None,
            unix_fd_possible: false,
            unix_fd_negotiated: false,
            failures: 0,
        }
    }

    /// Restricts the mechanisms offered (client) or accepted (server), in order of preference.
    pub fn set_mechanisms(&mut self, mechanisms: &[Mechanism]) {
        self.mechanisms = mechanisms.to_vec();
        self.mech_cursor = 0;
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    fn side(&self) -> &'static str {
        if self.is_server() {
            "server"
        } else {
            "client"
        }
    }

    fn in_end_state(&self) -> bool {
        matches!(self.state, State::Authenticated | State::NeedDisconnect)
    }

    fn queue_line(&mut self, line: &str) {
        trace!(side = self.side(), line, "auth send");
        self.outgoing.extend_from_slice(line.as_bytes());
        self.outgoing.extend_from_slice(b"\r\n");
    }

    fn need_disconnect(&mut self, reason: &str) {
        debug!(side = self.side(), reason, "auth conversation needs disconnect");
        self.state = State::NeedDisconnect;
    }

    /// Handles one complete line if there is one. `Ok(false)` means no progress possible.
    fn process_command(&mut self) -> Result<bool, OutOfMemory> {
        if self.state == State::ClientStart {
            self.outgoing.try_reserve(REPLY_RESERVE)?;
            self.client_try_next_mechanism(None);
            return Ok(true);
        }

        let Some(end) = self.incoming.windows(2).position(|w| w == b"\r\n") else {
            return Ok(false);
        };
        self.outgoing.try_reserve(REPLY_RESERVE)?;

        let raw: Vec<u8> = self.incoming.drain(..end + 2).take(end).collect();
        let line = match std::str::from_utf8(&raw) {
            Ok(line) if line.is_ascii() => line.to_string(),
            _ => {
                self.queue_line("ERROR \"Command contained non-ASCII\"");
                return Ok(true);
            }
        };
        trace!(side = self.side(), line = %line, "auth recv");

        let (command, args) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line.as_str(), ""),
        };

        match self.state {
            State::ClientWaitingForOk(mech) => self.client_waiting_for_ok(mech, command, args),
            State::ClientWaitingForAgreeUnixFd => self.client_waiting_for_agree(command),
            State::ServerWaitingForAuth => self.server_waiting_for_auth(command, args),
            State::ServerWaitingForData(mech) => self.server_waiting_for_data(mech, command, args),
            State::ServerWaitingForBegin => self.server_waiting_for_begin(command),
            State::ClientStart | State::Authenticated | State::NeedDisconnect => {}
        }
        Ok(true)
    }

    fn initial_response(&self, mech: Mechanism) -> Option<String> {
        match mech {
            Mechanism::External => self
                .own_identity
                .unix_uid()
                .map(|uid| hex::encode(uid.0.to_string())),
            Mechanism::Anonymous => Some(hex::encode("busline")),
        }
    }

    /// Client: starts the next acceptable mechanism, or gives up.
    fn client_try_next_mechanism(&mut self, server_offers: Option<&[&str]>) {
        while self.mech_cursor < self.mechanisms.len() {
            let mech = self.mechanisms[self.mech_cursor];
            self.mech_cursor += 1;

            if let Some(offers) = server_offers {
                if !offers.is_empty() && !offers.contains(&mech.name()) {
                    continue;
                }
            }
            let Some(response) = self.initial_response(mech) else {
                continue;
            };
            self.queue_line(&format!("AUTH {} {}", mech.name(), response));
            self.state = State::ClientWaitingForOk(mech);
            return;
        }
        self.need_disconnect("no mechanisms left to try");
    }

    fn client_waiting_for_ok(&mut self, mech: Mechanism, command: &str, args: &str) {
        match command {
            "OK" => match args.parse::<Guid>() {
                Ok(guid) => {
                    self.guid = Some(guid);
                    if self.unix_fd_possible {
                        self.queue_line("NEGOTIATE_UNIX_FD");
                        self.state = State::ClientWaitingForAgreeUnixFd;
                    } else {
                        self.queue_line("BEGIN");
                        self.state = State::Authenticated;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "server sent an unparseable guid");
                    self.need_disconnect("bad guid from server");
                }
            },
            "REJECTED" => {
                let offers: Vec<&str> = args.split_whitespace().collect();
                self.client_try_next_mechanism(Some(&offers));
            }
            "DATA" => match self.initial_response(mech) {
                Some(response) => self.queue_line(&format!("DATA {response}")),
                None => self.queue_line("CANCEL"),
            },
            "ERROR" => self.queue_line("CANCEL"),
            _ => self.queue_line("ERROR \"Unknown command\""),
        }
    }

    fn client_waiting_for_agree(&mut self, command: &str) {
        match command {
            "AGREE_UNIX_FD" => {
                self.unix_fd_negotiated = true;
                self.queue_line("BEGIN");
                self.state = State::Authenticated;
            }
            "ERROR" => {
                self.unix_fd_negotiated = false;
                self.queue_line("BEGIN");
                self.state = State::Authenticated;
            }
            _ => self.need_disconnect("unexpected reply to NEGOTIATE_UNIX_FD"),
        }
    }

    fn send_rejected(&mut self) {
        let offers: Vec<&str> = self.mechanisms.iter().map(|m| m.name()).collect();
        let line = format!("REJECTED {}", offers.join(" "));
        self.queue_line(line.trim_end());
        self.authorized_identity.clear();
        self.failures += 1;
        if self.failures >= MAX_AUTH_FAILURES {
            self.need_disconnect("too many authentication failures");
        } else {
            self.state = State::ServerWaitingForAuth;
        }
    }

    fn send_ok(&mut self) {
        let guid = self.guid.map(|g| g.to_hex()).unwrap_or_default();
        self.queue_line(&format!("OK {guid}"));
        self.state = State::ServerWaitingForBegin;
    }

    fn server_waiting_for_auth(&mut self, command: &str, args: &str) {
        match command {
            "AUTH" => {
                let (name, response) = match args.split_once(' ') {
                    Some((n, r)) => (n, Some(r.trim())),
                    None if args.is_empty() => {
                        self.send_rejected();
                        return;
                    }
                    None => (args, None),
                };
                let mech = match Mechanism::from_name(name) {
                    Some(m) if self.mechanisms.contains(&m) => m,
                    _ => {
                        debug!(mechanism = name, "peer asked for an unsupported mechanism");
                        self.send_rejected();
                        return;
                    }
                };
                match response {
                    Some(response) => self.server_handle_data(mech, response),
                    None => {
                        self.queue_line("DATA");
                        self.state = State::ServerWaitingForData(mech);
                    }
                }
            }
            "BEGIN" => self.need_disconnect("BEGIN before authentication"),
            "CANCEL" | "ERROR" => self.send_rejected(),
            _ => self.queue_line("ERROR \"Unknown command\""),
        }
    }

    fn server_waiting_for_data(&mut self, mech: Mechanism, command: &str, args: &str) {
        match command {
            "DATA" => self.server_handle_data(mech, args),
            "BEGIN" => self.need_disconnect("BEGIN before authentication"),
            "CANCEL" | "ERROR" => self.send_rejected(),
            _ => self.queue_line("ERROR \"Unknown command\""),
        }
    }

    fn server_waiting_for_begin(&mut self, command: &str) {
        match command {
            "BEGIN" => {
                debug!(identity = %self.authorized_identity, "peer authenticated");
                self.state = State::Authenticated;
            }
            "NEGOTIATE_UNIX_FD" => {
                if self.unix_fd_possible {
                    self.unix_fd_negotiated = true;
                    self.queue_line("AGREE_UNIX_FD");
                } else {
                    self.queue_line("ERROR \"Unix fd passing not supported on this transport\"");
                }
            }
            "CANCEL" | "ERROR" => self.send_rejected(),
            _ => self.queue_line("ERROR \"Unknown command\""),
        }
    }

    fn server_handle_data(&mut self, mech: Mechanism, response_hex: &str) {
        let Ok(response) = hex::decode(response_hex) else {
            debug!(mechanism = mech.name(), "response is not valid hex");
            self.send_rejected();
            return;
        };

        match mech {
            Mechanism::External => {
                let Some(socket_uid) = self.credentials.unix_uid() else {
                    debug!("EXTERNAL without socket credentials");
                    self.send_rejected();
                    return;
                };
                if !response.is_empty() {
                    let claimed = std::str::from_utf8(&response)
                        .ok()
                        .and_then(|s| s.parse::<u32>().ok())
                        .map(UserId);
                    if claimed != Some(socket_uid) {
                        debug!(claimed = ?claimed, actual = %socket_uid, "EXTERNAL identity mismatch");
                        self.send_rejected();
                        return;
                    }
                }
                self.authorized_identity = self.credentials.clone();
                self.send_ok();
            }
            Mechanism::Anonymous => {
                if std::str::from_utf8(&response).is_err() {
                    self.send_rejected();
                    return;
                }
                let mut identity = Credentials::new();
                identity.add_credential(CredentialKind::ProcessId, &self.credentials);
                self.authorized_identity = identity;
                self.send_ok();
            }
        }
    }
}

impl AuthConversation for SaslAuth {
    fn do_work(&mut self) -> AuthState {
        loop {
            if self.in_end_state() {
                break;
            }
            if self.incoming.len() > MAX_AUTH_BUFFER || self.outgoing.len() > MAX_AUTH_BUFFER {
                self.need_disconnect("auth buffer limit exceeded");
                break;
            }
            match self.process_command() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(OutOfMemory) => return AuthState::WaitingForMemory,
            }
        }

        if self.state == State::NeedDisconnect {
            AuthState::NeedDisconnect
        } else if !self.outgoing.is_empty() {
            AuthState::HaveBytesToSend
        } else if self.state == State::Authenticated {
            AuthState::Authenticated
        } else {
            AuthState::WaitingForInput
        }
    }

    fn bytes_to_send(&self) -> &[u8] {
        &self.outgoing
    }

    fn bytes_sent(&mut self, n: usize) {
        let n = n.min(self.outgoing.len());
        self.outgoing.drain(..n);
    }

    fn get_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.incoming
    }

    fn return_buffer(&mut self) {}

    fn needs_encoding(&self) -> bool {
        false
    }

    fn needs_decoding(&self) -> bool {
        false
    }

    fn encode_data(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), OutOfMemory> {
        out.try_reserve(plain.len())?;
        out.extend_from_slice(plain);
        Ok(())
    }

    fn decode_data(&mut self, encoded: &[u8], out: &mut Vec<u8>) -> Result<(), OutOfMemory> {
        out.try_reserve(encoded.len())?;
        out.extend_from_slice(encoded);
        Ok(())
    }

    fn identity(&self) -> Credentials {
        if self.state == State::Authenticated {
            self.authorized_identity.clone()
        } else {
            Credentials::new()
        }
    }

    fn guid_from_server(&self) -> Option<Guid> {
        self.guid
    }

    fn set_credentials(&mut self, credentials: &Credentials) -> Result<(), OutOfMemory> {
        self.credentials = credentials.clone();
        Ok(())
    }

    fn set_unix_fd_possible(&mut self, possible: bool) {
        self.unix_fd_possible = possible;
    }

    fn unix_fd_negotiated(&self) -> bool {
        self.unix_fd_negotiated
    }

    fn take_unused_bytes(&mut self) -> Vec<u8> {
        if self.state == State::Authenticated {
            std::mem::take(&mut self.incoming)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_core::ProcessId;

    fn socket_creds(uid: u32) -> Credentials {
        let mut creds = Credentials::new();
        creds.add_pid(ProcessId(4242));
        creds.add_unix_uid(UserId(uid));
        creds
    }

    fn client_as(uid: u32) -> SaslAuth {
        let mut identity = Credentials::new();
        identity.add_unix_uid(UserId(uid));
        SaslAuth::client_with_identity(identity)
    }

    /// Shuttles bytes both ways until neither side makes progress.
    fn converse(client: &mut SaslAuth, server: &mut SaslAuth) -> (AuthState, AuthState) {
        for _ in 0..32 {
            let c = client.do_work();
            let bytes = client.bytes_to_send().to_vec();
            client.bytes_sent(bytes.len());
            server.get_buffer().extend_from_slice(&bytes);

            let s = server.do_work();
            let bytes = server.bytes_to_send().to_vec();
            server.bytes_sent(bytes.len());
            client.get_buffer().extend_from_slice(&bytes);

            let c2 = client.do_work();
            let s2 = server.do_work();
            let idle = c2 != AuthState::HaveBytesToSend && s2 != AuthState::HaveBytesToSend;
            if idle && c == c2 && s == s2 {
                return (c2, s2);
            }
        }
        (client.do_work(), server.do_work())
    }

    #[test]
    fn external_succeeds_for_matching_uid() {
        let guid = Guid::generate();
        let mut server = SaslAuth::server(guid);
        server.set_credentials(&socket_creds(1000)).unwrap();
        let mut client = client_as(1000);

        let (c, s) = converse(&mut client, &mut server);
        assert_eq!(c, AuthState::Authenticated);
        assert_eq!(s, AuthState::Authenticated);
        assert_eq!(client.guid_from_server(), Some(guid));
        assert_eq!(server.identity().unix_uid(), Some(UserId(1000)));
        assert_eq!(server.identity().pid(), Some(ProcessId(4242)));
    }

    #[test]
    fn mismatched_uid_falls_back_to_anonymous() {
        let mut server = SaslAuth::server(Guid::generate());
        server.set_credentials(&socket_creds(1000)).unwrap();
        let mut client = client_as(2000);

        let (c, s) = converse(&mut client, &mut server);
        assert_eq!(c, AuthState::Authenticated);
        assert_eq!(s, AuthState::Authenticated);
        let identity = server.identity();
        assert!(identity.is_anonymous());
        assert_eq!(identity.pid(), Some(ProcessId(4242)));
    }

    #[test]
    fn client_gives_up_when_all_mechanisms_rejected() {
        let mut server = SaslAuth::server(Guid::generate());
        server.set_mechanisms(&[Mechanism::External]);
        server.set_credentials(&socket_creds(1000)).unwrap();
        let mut client = client_as(2000);

        let (c, _) = converse(&mut client, &mut server);
        assert_eq!(c, AuthState::NeedDisconnect);
    }

    #[test]
    fn server_disconnects_after_failure_budget() {
        let mut server = SaslAuth::server(Guid::generate());
        server.set_credentials(&socket_creds(1000)).unwrap();
        for _ in 0..MAX_AUTH_FAILURES {
            server.get_buffer().extend_from_slice(b"AUTH BOGUS\r\n");
        }
        assert_eq!(server.do_work(), AuthState::NeedDisconnect);
    }

    #[test]
    fn begin_before_ok_disconnects() {
        let mut server = SaslAuth::server(Guid::generate());
        server.get_buffer().extend_from_slice(b"BEGIN\r\n");
        assert_eq!(server.do_work(), AuthState::NeedDisconnect);
    }

    #[test]
    fn oversized_input_disconnects() {
        let mut server = SaslAuth::server(Guid::generate());
        server.get_buffer().resize(MAX_AUTH_BUFFER + 1, b'A');
        assert_eq!(server.do_work(), AuthState::NeedDisconnect);
    }

    #[test]
    fn external_without_initial_response_asks_for_data() {
        let mut server = SaslAuth::server(Guid::generate());
        server.set_credentials(&socket_creds(7)).unwrap();
        server.get_buffer().extend_from_slice(b"AUTH EXTERNAL\r\n");
        assert_eq!(server.do_work(), AuthState::HaveBytesToSend);
        assert_eq!(server.bytes_to_send(), b"DATA\r\n");
        let n = server.bytes_to_send().len();
        server.bytes_sent(n);

        server.get_buffer().extend_from_slice(b"DATA\r\n");
        server.do_work();
        assert!(server.bytes_to_send().starts_with(b"OK "));
    }

    #[test]
    fn unix_fd_negotiation_and_unused_bytes() {
        let mut server = SaslAuth::server(Guid::generate());
        server.set_credentials(&socket_creds(1000)).unwrap();
        server.set_unix_fd_possible(true);
        let mut client = client_as(1000);
        client.set_unix_fd_possible(true);

        let (c, s) = converse(&mut client, &mut server);
        assert_eq!((c, s), (AuthState::Authenticated, AuthState::Authenticated));
        assert!(client.unix_fd_negotiated());
        assert!(server.unix_fd_negotiated());

        // Message bytes right behind BEGIN belong to the stream, not the handshake.
        let mut server = SaslAuth::server(Guid::generate());
        server.set_credentials(&socket_creds(1000)).unwrap();
        server
            .get_buffer()
            .extend_from_slice(b"AUTH EXTERNAL 31303030\r\nBEGIN\r\nl\x04\x00\x01");
        assert_eq!(server.do_work(), AuthState::HaveBytesToSend);
        let n = server.bytes_to_send().len();
        server.bytes_sent(n);
        assert_eq!(server.do_work(), AuthState::Authenticated);
        assert_eq!(server.take_unused_bytes(), b"l\x04\x00\x01".to_vec());
    }

    #[test]
    fn fd_negotiation_refused_still_begins() {
        let mut server = SaslAuth::server(Guid::generate());
        server.set_credentials(&socket_creds(1000)).unwrap();
        let mut client = client_as(1000);
        client.set_unix_fd_possible(true);

        let (c, s) = converse(&mut client, &mut server);
        assert_eq!((c, s), (AuthState::Authenticated, AuthState::Authenticated));
        assert!(!client.unix_fd_negotiated());
    }
}
