// poll(2) wrapper shared by the transport iteration and the reactor
use busline_core::WatchFlags;
use nix::errno::Errno;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// One descriptor to wait on, with what came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    pub fd: RawFd,
    pub interest: WatchFlags,
    pub revents: WatchFlags,
}

impl PollEntry {
    pub fn new(fd: RawFd, interest: WatchFlags) -> Self {
        PollEntry {
            fd,
            interest,
            revents: WatchFlags::NONE,
        }
    }
}

/// A single-descriptor wait, produced by a transport that wants to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    pub fd: RawFd,
    pub interest: WatchFlags,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

pub fn to_poll_events(flags: WatchFlags) -> libc::c_short {
    let mut events = 0;
    if flags.contains(WatchFlags::READABLE) {
        events |= libc::POLLIN;
    }
    if flags.contains(WatchFlags::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

pub fn from_poll_revents(revents: libc::c_short) -> WatchFlags {
    let mut flags = WatchFlags::NONE;
    if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
        flags |= WatchFlags::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        flags |= WatchFlags::WRITABLE;
    }
    if revents & libc::POLLERR != 0 {
        flags |= WatchFlags::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        flags |= WatchFlags::HANGUP;
    }
    if revents & libc::POLLNVAL != 0 {
        flags |= WatchFlags::INVALID;
    }
    flags
}

/// Milliseconds for poll(2), rounding partial milliseconds up.
pub fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Waits until an entry is ready or the timeout expires. Returns how many
/// entries have non-empty `revents`. `EINTR` comes back as an error of kind
/// `Interrupted`.
pub fn poll(entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize> {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|e| libc::pollfd {
            fd: e.fd,
            events: to_poll_events(e.interest),
            revents: 0,
        })
        .collect();

    // SAFETY: `fds` is a live, correctly sized array of pollfd for the whole call.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_millis(timeout)) };
    let ready = Errno::result(ret).map_err(io::Error::from)?;

    for (entry, pfd) in entries.iter_mut().zip(fds.iter()) {
        entry.revents = from_poll_revents(pfd.revents);
    }
    Ok(ready as usize)
}

/// Polls a single descriptor, retrying on `EINTR`. A timeout yields empty flags.
pub fn poll_one(request: &PollRequest) -> io::Result<WatchFlags> {
    let mut entry = [PollEntry::new(request.fd, request.interest)];
    loop {
        match poll(&mut entry, request.timeout) {
            Ok(_) => return Ok(entry[0].revents),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
