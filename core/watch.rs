// Watch: "tell me when this descriptor is readable/writable"
use crate::error::OutOfMemory;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness conditions. `ERROR` and `HANGUP` are always reported, never requested.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WatchFlags(u8);

impl WatchFlags {
    pub const NONE: WatchFlags = WatchFlags(0);
    pub const READABLE: WatchFlags = WatchFlags(1 << 0);
    pub const WRITABLE: WatchFlags = WatchFlags(1 << 1);
    pub const ERROR: WatchFlags = WatchFlags(1 << 2);
    pub const HANGUP: WatchFlags = WatchFlags(1 << 3);
    /// The descriptor is not open; only ever produced by the reactor.
    pub const INVALID: WatchFlags = WatchFlags(1 << 4);

    pub fn contains(self, other: WatchFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: WatchFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for WatchFlags {
    type Output = WatchFlags;

    fn bitor(self, rhs: WatchFlags) -> WatchFlags {
        WatchFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for WatchFlags {
    fn bitor_assign(&mut self, rhs: WatchFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for WatchFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (WatchFlags::READABLE, "READABLE"),
            (WatchFlags::WRITABLE, "WRITABLE"),
            (WatchFlags::ERROR, "ERROR"),
            (WatchFlags::HANGUP, "HANGUP"),
            (WatchFlags::INVALID, "INVALID"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

pub type WatchHandler = Box<dyn FnMut(&Watch, WatchFlags) -> Result<(), OutOfMemory> + Send>;
pub type ToggleHook = Arc<dyn Fn(&Watch) + Send + Sync>;

struct WatchInner {
    fd: RawFd,
    flags: WatchFlags,
    enabled: AtomicBool,
    oom_last_time: AtomicBool,
    valid: AtomicBool,
    handler: Mutex<Option<WatchHandler>>,
    toggled: Mutex<Option<ToggleHook>>,
}

/// Shared handle to one watch. Clones refer to the same watch; equality is identity.
#[derive(Clone)]
pub struct Watch {
    inner: Arc<WatchInner>,
}

impl Watch {
    pub fn new(fd: RawFd, flags: WatchFlags, enabled: bool) -> Self {
        Watch {
            inner: Arc::new(WatchInner {
                fd,
                flags,
                enabled: AtomicBool::new(enabled),
                oom_last_time: AtomicBool::new(false),
                valid: AtomicBool::new(true),
                handler: Mutex::new(None),
                toggled: Mutex::new(None),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// The conditions this watch asks for (readable and/or writable).
    pub fn flags(&self) -> WatchFlags {
        self.inner.flags
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Changes the enabled state and tells whoever is polling for us, if anyone.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.inner.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            self.notify_toggled();
        }
    }

    pub fn oom_last_time(&self) -> bool {
        self.inner.oom_last_time.load(Ordering::Acquire)
    }

    pub fn set_oom_last_time(&self, oom: bool) {
        self.inner.oom_last_time.store(oom, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Drops the handler and marks the watch dead; the descriptor may be
    /// closed and reused by the OS after this.
    pub fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
        self.inner.enabled.store(false, Ordering::Release);
        self.inner.handler.lock().take();
    }

    pub fn set_handler(&self, handler: WatchHandler) {
        *self.inner.handler.lock() = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.inner.handler.lock().is_some()
    }

    /// Runs the handler. A watch without a handler, or one invalidated
    /// meanwhile, is treated as handled.
    ///
    /// The handler is taken out for the duration of the call so it may touch
    /// this watch (toggle, invalidate, even replace the handler) re-entrantly.
    pub fn handle(&self, condition: WatchFlags) -> Result<(), OutOfMemory> {
        if !self.is_valid() {
            return Ok(());
        }
        let taken = self.inner.handler.lock().take();
        let Some(mut handler) = taken else {
            return Ok(());
        };
        let result = handler(self, condition);

        let mut slot = self.inner.handler.lock();
        if slot.is_none() && self.is_valid() {
            *slot = Some(handler);
        }
        result
    }

    pub fn set_toggle_hook(&self, hook: ToggleHook) {
        *self.inner.toggled.lock() = Some(hook);
    }

    pub fn clear_toggle_hook(&self) {
        self.inner.toggled.lock().take();
    }

    fn notify_toggled(&self) {
        let hook = self.inner.toggled.lock().clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    pub fn ptr_eq(&self, other: &Watch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Watch {
    fn eq(&self, other: &Watch) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Watch {}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Watch")
            .field("fd", &self.fd())
            .field("flags", &self.flags())
            .field("enabled", &self.is_enabled())
            .field("oom_last_time", &self.oom_last_time())
            .field("valid", &self.is_valid())
            .finish()
    }
}
