// Live-message accounting: bytes and fds received but not yet processed
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub type NotifyFn = Arc<dyn Fn(&LiveCounter) + Send + Sync>;

/// Shared byte/fd counter with a ceiling per dimension.
///
/// The read path charges a message when it hands it to the connection, the
/// consumer releases the charge when it is done with it. Whenever either value
/// crosses its ceiling, in either direction, the notify callback runs on the
/// thread that caused the crossing, before the adjusting call returns.
pub struct LiveCounter {
    size: AtomicI64,
    unix_fds: AtomicI64,
    size_limit: AtomicI64,
    unix_fd_limit: AtomicI64,
    notify: Mutex<Option<NotifyFn>>,
}

fn crossed(old: i64, new: i64, limit: i64) -> bool {
    (old < limit && new >= limit) || (old >= limit && new < limit)
}

impl LiveCounter {
    pub fn new(size_limit: i64, unix_fd_limit: i64) -> Arc<Self> {
        Arc::new(LiveCounter {
            size: AtomicI64::new(0),
            unix_fds: AtomicI64::new(0),
            size_limit: AtomicI64::new(size_limit),
            unix_fd_limit: AtomicI64::new(unix_fd_limit),
            notify: Mutex::new(None),
        })
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn unix_fds(&self) -> i64 {
        self.unix_fds.load(Ordering::Acquire)
    }

    pub fn size_limit(&self) -> i64 {
        self.size_limit.load(Ordering::Acquire)
    }

    pub fn unix_fd_limit(&self) -> i64 {
        self.unix_fd_limit.load(Ordering::Acquire)
    }

    /// Moving a ceiling does not fire the callback; the owner re-checks itself.
    pub fn set_size_limit(&self, limit: i64) {
        self.size_limit.store(limit, Ordering::Release);
    }

    pub fn set_unix_fd_limit(&self, limit: i64) {
        self.unix_fd_limit.store(limit, Ordering::Release);
    }

    /// True while both values are under their ceilings.
    pub fn below_limits(&self) -> bool {
        self.size() < self.size_limit() && self.unix_fds() < self.unix_fd_limit()
    }

    pub fn set_notify(&self, notify: Option<NotifyFn>) {
        *self.notify.lock() = notify;
    }

    pub fn adjust_size(&self, delta: i64) {
        self.adjust(delta, 0);
    }

    pub fn adjust_unix_fds(&self, delta: i64) {
        self.adjust(0, delta);
    }

    /// Applies both deltas, then notifies once if either value crossed its ceiling.
    pub fn adjust(&self, size_delta: i64, fd_delta: i64) {
        let mut crossing = false;

        if size_delta != 0 {
            let old = self.size.fetch_add(size_delta, Ordering::AcqRel);
            crossing |= crossed(old, old + size_delta, self.size_limit());
        }
        if fd_delta != 0 {
            let old = self.unix_fds.fetch_add(fd_delta, Ordering::AcqRel);
            crossing |= crossed(old, old + fd_delta, self.unix_fd_limit());
        }

        if crossing {
            let notify = self.notify.lock().clone();
            if let Some(notify) = notify {
                tracing::trace!(
                    size = self.size(),
                    unix_fds = self.unix_fds(),
                    "live message counter crossed a limit"
                );
                notify(self);
            }
        }
    }

    /// Adds a message's weight; the returned charge gives it back when dropped.
    pub fn charge(self: &Arc<Self>, size: usize, unix_fds: usize) -> LiveCharge {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let unix_fds = i64::try_from(unix_fds).unwrap_or(i64::MAX);
        self.adjust(size, unix_fds);
        LiveCharge {
            counter: Arc::clone(self),
            size,
            unix_fds,
        }
    }
}

impl fmt::Debug for LiveCounter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LiveCounter")
            .field("size", &self.size())
            .field("size_limit", &self.size_limit())
            .field("unix_fds", &self.unix_fds())
            .field("unix_fd_limit", &self.unix_fd_limit())
            .finish()
    }
}

/// One message's share of a [`LiveCounter`].
#[must_use = "dropping the charge releases it immediately"]
pub struct LiveCharge {
    counter: Arc<LiveCounter>,
    size: i64,
    unix_fds: i64,
}

impl LiveCharge {
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn unix_fds(&self) -> i64 {
        self.unix_fds
    }
}

impl Drop for LiveCharge {
    fn drop(&mut self) {
        self.counter.adjust(-self.size, -self.unix_fds);
    }
}

impl fmt::Debug for LiveCharge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LiveCharge")
            .field("size", &self.size)
            .field("unix_fds", &self.unix_fds)
            .finish()
    }
}
