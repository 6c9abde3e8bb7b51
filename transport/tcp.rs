// TCP transport, with the nonce-file variant for local-only authentication
use crate::limits::TransportLimits;
use crate::socket_transport::SocketTransport;
use crate::stream::{read_appending, send_two};
use crate::traits::{Socket, TransportListener};
use crate::TransportError;
use busline_core::{escape_value, Credentials, Guid, SocketTarget, TcpFamily};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const NONCE_LEN: usize = 16;
const NONCE_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TcpSocket {
    stream: TcpStream,
}

fn family_matches(addr: &SocketAddr, family: Option<TcpFamily>) -> bool {
    match family {
        None => true,
        Some(TcpFamily::Ipv4) => addr.is_ipv4(),
        Some(TcpFamily::Ipv6) => addr.is_ipv6(),
    }
}

fn resolve(host: &str, port: u16, family: Option<TcpFamily>) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()?
        .filter(|a| family_matches(a, family))
        .collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}:{port} did not resolve to a usable address"),
        ));
    }
    Ok(addrs)
}

fn family_name(addr: &SocketAddr) -> &'static str {
    if addr.is_ipv4() {
        "ipv4"
    } else {
        "ipv6"
    }
}

pub fn read_nonce_file(path: &Path) -> Result<[u8; NONCE_LEN], TransportError> {
    let bytes = std::fs::read(path).map_err(|e| TransportError::Nonce {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    bytes
        .get(..NONCE_LEN)
        .and_then(|b| <[u8; NONCE_LEN]>::try_from(b).ok())
        .ok_or_else(|| TransportError::Nonce {
            path: path.display().to_string(),
            reason: format!("expected {NONCE_LEN} bytes, found {}", bytes.len()),
        })
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(TcpSocket { stream })
    }

    /// Connects to `tcp:` or `nonce-tcp:` targets, trying each resolved address in turn.
    pub fn connect(target: &SocketTarget) -> Result<Self, TransportError> {
        let (host, port, family, noncefile) = match target {
            SocketTarget::Tcp { host, port, family } => (host, *port, *family, None),
            SocketTarget::NonceTcp {
                host,
                port,
                family,
                noncefile,
            } => {
                let path = noncefile.as_ref().ok_or_else(|| TransportError::Nonce {
                    path: String::new(),
                    reason: "nonce-tcp address without a noncefile".into(),
                })?;
                (host, *port, *family, Some(read_nonce_file(path)?))
            }
            _ => return Err(TransportError::Unsupported("non-tcp target on a tcp socket")),
        };

        let mut last_err = None;
        for addr in resolve(host, port, family)? {
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    if let Some(nonce) = noncefile {
                        stream.write_all(&nonce)?;
                    }
                    return Ok(TcpSocket::new(stream)?);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "tcp connect failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(TransportError::Io)
            .unwrap_or_else(|| TransportError::NoUsableAddress(format!("{host}:{port}"))))
    }
}

impl Socket for TcpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read(&mut self, buf: &mut Vec<u8>, max: usize) -> io::Result<usize> {
        read_appending(self.stream.as_raw_fd(), buf, max)
    }

    fn write_two(&mut self, first: &[u8], second: &[u8]) -> io::Result<usize> {
        send_two(self.stream.as_raw_fd(), first, second, &[])
    }

    fn send_credentials(&mut self) -> io::Result<()> {
        match self.write(&[0])? {
            1 => Ok(()),
            _ => Err(io::ErrorKind::WriteZero.into()),
        }
    }

    /// TCP carries no kernel credentials: the peer is anonymous unless auth says otherwise.
    fn read_credentials(&mut self) -> io::Result<Credentials> {
        let mut byte = [0u8; 1];
        let n = loop {
            match (&self.stream).read(&mut byte) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        match (n, byte[0]) {
            (0, _) => Err(io::ErrorKind::UnexpectedEof.into()),
            (_, 0) => Ok(Credentials::new()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "first byte from peer was not the credentials byte",
            )),
        }
    }
}

/// A nonce file created by a listener and removed with it.
struct NonceFile {
    path: PathBuf,
    nonce: [u8; NONCE_LEN],
}

impl NonceFile {
    fn create(path: Option<PathBuf>) -> Result<Self, TransportError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let path = path.unwrap_or_else(|| {
            let tag: [u8; 8] = rand::random();
            std::env::temp_dir().join(format!("busline-nonce-{}", hex::encode(tag)))
        });
        std::fs::write(&path, nonce).map_err(|e| TransportError::Nonce {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(NonceFile { path, nonce })
    }
}

impl Drop for NonceFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct TcpListener {
    listener: StdTcpListener,
    guid: Guid,
    address: String,
    nonce: Option<NonceFile>,
    limits: TransportLimits,
}

impl TcpListener {
    /// Binds the first resolved address; port 0 picks a free port, reported by [`address`].
    ///
    /// [`address`]: TransportListener::address
    pub fn bind(target: &SocketTarget, guid: Guid, limits: TransportLimits) -> Result<Self, TransportError> {
        let (host, port, family, method, noncefile) = match target {
            SocketTarget::Tcp { host, port, family } => (host, *port, *family, "tcp", None),
            SocketTarget::NonceTcp {
                host,
                port,
                family,
                noncefile,
            } => (host, *port, *family, "nonce-tcp", Some(noncefile.clone())),
            _ => return Err(TransportError::Unsupported("non-tcp target on a tcp listener")),
        };

        let mut last_err = None;
        let mut bound = None;
        for addr in resolve(host, port, family)? {
            match StdTcpListener::bind(addr) {
                Ok(l) => {
                    bound = Some(l);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let listener = match (bound, last_err) {
            (Some(l), _) => l,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => return Err(TransportError::NoUsableAddress(format!("{host}:{port}"))),
        };
        listener.set_nonblocking(true)?;

        let local = listener.local_addr()?;
        let nonce = noncefile.map(NonceFile::create).transpose()?;
        let mut address = format!(
            "{method}:host={},port={},family={}",
            escape_value(host),
            local.port(),
            family_name(&local)
        );
        if let Some(nonce) = &nonce {
            address.push_str(&format!(",noncefile={}", escape_value(&nonce.path.to_string_lossy())));
        }
        address.push_str(&format!(",guid={guid}"));
        debug!(address = %address, "listening");

        Ok(TcpListener {
            listener,
            guid,
            address,
            nonce,
            limits,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn check_nonce(&self, stream: &mut TcpStream) -> io::Result<()> {
        let Some(expected) = &self.nonce else {
            return Ok(());
        };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(NONCE_READ_TIMEOUT))?;
        let mut got = [0u8; NONCE_LEN];
        stream.read_exact(&mut got)?;
        stream.set_read_timeout(None)?;
        if got != expected.nonce {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                TransportError::NonceMismatch,
            ));
        }
        Ok(())
    }
}

impl TransportListener for TcpListener {
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
        let (mut stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Err(e) = self.check_nonce(&mut stream) {
            warn!(%peer, error = %e, "dropping tcp connection that failed the nonce check");
            return Err(e);
        }
        let socket = TcpSocket::new(stream)?;
        debug!(%peer, "accepted tcp connection");
        Ok(Some(SocketTransport::server(
            Box::new(socket),
            self.guid,
            Some(self.address.clone()),
            self.limits,
        )))
    }
}
