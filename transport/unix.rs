// Unix socket transport: credentials over SO_PEERCRED, fd passing with SCM_RIGHTS
use crate::limits::TransportLimits;
use crate::socket_transport::SocketTransport;
use crate::stream::{read_appending, recv_appending, send_two};
use crate::traits::{Socket, TransportListener};
use crate::TransportError;
use busline_core::{escape_value, Credentials, Guid, SocketTarget};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct UnixSocket {
    stream: UnixStream,
}

impl UnixSocket {
    /// Wraps a connected stream, switching it to non-blocking mode.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(UnixSocket { stream })
    }

    pub fn connect(target: &SocketTarget) -> Result<Self, TransportError> {
        let stream = match target {
            SocketTarget::UnixPath(path) => UnixStream::connect(path)?,
            SocketTarget::UnixAbstract(name) => connect_abstract(name)?,
            _ => return Err(TransportError::Unsupported("non-unix target on a unix socket")),
        };
        Ok(UnixSocket::new(stream)?)
    }

    /// A connected pair, for in-process peers and tests.
    pub fn pair() -> io::Result<(UnixSocket, UnixSocket)> {
        let (a, b) = UnixStream::pair()?;
        Ok((UnixSocket::new(a)?, UnixSocket::new(b)?))
    }

    pub fn peer_credentials(&self) -> io::Result<Credentials> {
        let mut creds = peer_cred_impl(&self.stream)?;
        if let Some(label) = peer_security_label(self.stream.as_raw_fd()) {
            creds.add_linux_security_label(label);
        }
        Ok(creds)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixStream::connect_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets are Linux-only",
    ))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_cred_impl(stream: &UnixStream) -> io::Result<Credentials> {
    use busline_core::{ProcessId, UserId};
    use nix::sys::socket::{getsockopt, sockopt};

    let ucred = getsockopt(stream, sockopt::PeerCredentials).map_err(io::Error::from)?;
    let mut creds = Credentials::new();
    if ucred.pid() > 0 {
        creds.add_pid(ProcessId(ucred.pid() as u32));
    }
    creds.add_unix_uid(UserId(ucred.uid()));
    Ok(creds)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_cred_impl(stream: &UnixStream) -> io::Result<Credentials> {
    use busline_core::UserId;

    let (uid, _gid) = nix::unistd::getpeereid(stream).map_err(io::Error::from)?;
    let mut creds = Credentials::new();
    creds.add_unix_uid(UserId(uid.as_raw()));
    Ok(creds)
}

/// The peer's LSM label, when the kernel has one for it.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_security_label(fd: RawFd) -> Option<String> {
    let mut buf = vec![0u8; 256];
    loop {
        let mut len = buf.len() as libc::socklen_t;
        // SAFETY: `buf` is writable for `len` bytes and `len` is updated by the kernel.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERSEC,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret == 0 {
            buf.truncate(len as usize);
            while buf.last() == Some(&0) {
                buf.pop();
            }
            return if buf.is_empty() {
                None
            } else {
                String::from_utf8(buf).ok()
            };
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ERANGE) && (len as usize) > buf.len() && buf.len() < 65536 {
            buf.resize(len as usize, 0);
            continue;
        }
        // ENOPROTOOPT: no LSM, which is the common case
        return None;
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_security_label(_fd: RawFd) -> Option<String> {
    None
}

impl Socket for UnixSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read(&mut self, buf: &mut Vec<u8>, max: usize) -> io::Result<usize> {
        read_appending(self.stream.as_raw_fd(), buf, max)
    }

    fn write_two(&mut self, first: &[u8], second: &[u8]) -> io::Result<usize> {
        send_two(self.stream.as_raw_fd(), first, second, &[])
    }

    fn read_with_unix_fds(
        &mut self,
        buf: &mut Vec<u8>,
        max: usize,
        max_fds: usize,
    ) -> io::Result<(usize, Vec<OwnedFd>)> {
        recv_appending(self.stream.as_raw_fd(), buf, max, max_fds)
    }

    fn write_with_unix_fds(&mut self, first: &[u8], second: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        send_two(self.stream.as_raw_fd(), first, second, fds)
    }

    fn send_credentials(&mut self) -> io::Result<()> {
        match self.write(&[0])? {
            1 => Ok(()),
            _ => Err(io::ErrorKind::WriteZero.into()),
        }
    }

    fn read_credentials(&mut self) -> io::Result<Credentials> {
        let mut byte = [0u8; 1];
        let n = loop {
            match (&self.stream).read(&mut byte) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "first byte from peer was not the credentials byte",
            ));
        }
        match self.peer_credentials() {
            Ok(creds) => Ok(creds),
            Err(e) => {
                warn!(error = %e, "could not read peer credentials, treating peer as anonymous");
                Ok(Credentials::new())
            }
        }
    }

    fn can_pass_unix_fds(&self) -> bool {
        true
    }
}

/// Listening unix socket handing out server-side transports.
pub struct UnixListener {
    listener: StdUnixListener,
    guid: Guid,
    address: String,
    /// Filesystem socket to unlink when the listener goes away.
    path: Option<PathBuf>,
    limits: TransportLimits,
}

impl UnixListener {
    pub fn bind(target: &SocketTarget, guid: Guid, limits: TransportLimits) -> Result<Self, TransportError> {
        let (listener, address, path) = match target {
            SocketTarget::UnixPath(path) => {
                let listener = StdUnixListener::bind(path)?;
                let address = format!(
                    "unix:path={},guid={}",
                    escape_value(&path.to_string_lossy()),
                    guid
                );
                (listener, address, Some(path.clone()))
            }
            SocketTarget::UnixAbstract(name) => {
                let listener = bind_abstract(name)?;
                (listener, format!("unix:abstract={},guid={}", escape_value(name), guid), None)
            }
            _ => return Err(TransportError::Unsupported("non-unix target on a unix listener")),
        };
        listener.set_nonblocking(true)?;
        debug!(address = %address, "listening");
        Ok(UnixListener {
            listener,
            guid,
            address,
            path,
            limits,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> io::Result<StdUnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    StdUnixListener::bind_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(_name: &str) -> io::Result<StdUnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets are Linux-only",
    ))
}

impl TransportListener for UnixListener {
    type Backend = SocketTransport;

    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn guid(&self) -> Guid {
        self.guid
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn accept(&mut self) -> io::Result<Option<SocketTransport>> {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        let socket = UnixSocket::new(stream)?;
        debug!(fd = socket.as_raw_fd(), "accepted unix connection");
        Ok(Some(SocketTransport::server(
            Box::new(socket),
            self.guid,
            Some(self.address.clone()),
            self.limits,
        )))
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "could not unlink socket");
            }
        }
    }
}
