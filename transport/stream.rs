// Non-blocking stream primitives shared by the unix and tcp sockets
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Grows `buf` by up to `max` zeroed bytes, reporting allocation failure as
/// `ErrorKind::OutOfMemory`. Returns the old length.
fn grow(buf: &mut Vec<u8>, max: usize) -> io::Result<usize> {
    let start = buf.len();
    buf.try_reserve(max)
        .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    buf.resize(start + max, 0);
    Ok(start)
}

/// Writes two buffers with one syscall, passing `fds` along with the first byte.
pub(crate) fn send_two(fd: RawFd, first: &[u8], second: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(first), IoSlice::new(second)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
    loop {
        match sendmsg::<()>(fd, &iov, cmsgs, send_flags(), None) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Appends up to `max` bytes to `buf`, and collects up to `max_fds` descriptors.
pub(crate) fn recv_appending(
    fd: RawFd,
    buf: &mut Vec<u8>,
    max: usize,
    max_fds: usize,
) -> io::Result<(usize, Vec<OwnedFd>)> {
    let start = grow(buf, max)?;
    let result = recv_into(fd, &mut buf[start..], max_fds);
    let n = result.as_ref().map(|(n, _)| *n).unwrap_or(0);
    buf.truncate(start + n);
    result
}

fn recv_into(fd: RawFd, dest: &mut [u8], max_fds: usize) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_buf = if max_fds > 0 {
        let payload = (max_fds * std::mem::size_of::<RawFd>()) as libc::c_uint;
        // SAFETY: CMSG_SPACE only does arithmetic on its argument.
        let space = unsafe { libc::CMSG_SPACE(payload) } as usize;
        Some(Vec::with_capacity(space))
    } else {
        None
    };

    loop {
        let mut iov = [IoSliceMut::new(dest)];
        let msg = match recvmsg::<()>(fd, &mut iov, cmsg_buf.as_mut(), recv_flags()) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        };

        let mut fds = Vec::new();
        if max_fds > 0 {
            // ENOBUFS here means the peer sent more descriptors than we allow.
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // SAFETY: the kernel just installed these descriptors for us.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
        }
        return Ok((msg.bytes, fds));
    }
}

/// Plain read appending to `buf`.
pub(crate) fn read_appending(fd: RawFd, buf: &mut Vec<u8>, max: usize) -> io::Result<usize> {
    recv_appending(fd, buf, max, 0).map(|(n, _)| n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn read_appends_and_restores_length_on_error() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut buf = b"prefix".to_vec();

        let err = read_appending(b.as_raw_fd(), &mut buf, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buf, b"prefix");

        a.write_all(b"-data").unwrap();
        let n = read_appending(b.as_raw_fd(), &mut buf, 64).unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf, b"prefix-data");
    }

    #[test]
    fn descriptors_travel_with_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let (r, _w) = nix::unistd::pipe().unwrap();
        let sent = send_two(a.as_raw_fd(), b"he", b"llo", &[r.as_raw_fd()]).unwrap();
        assert_eq!(sent, 5);

        let mut buf = Vec::new();
        let (n, fds) = recv_appending(b.as_raw_fd(), &mut buf, 16, 4).unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf, b"hello");
        assert_eq!(fds.len(), 1);
    }
}
