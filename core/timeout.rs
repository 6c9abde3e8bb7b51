// Timeout: "call me every N milliseconds while enabled"
use crate::error::OutOfMemory;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type TimeoutHandler = Box<dyn FnMut(&Timeout) -> Result<(), OutOfMemory> + Send>;

struct TimeoutInner {
    interval_ms: AtomicU64,
    enabled: AtomicBool,
    needs_restart: AtomicBool,
    handler: Mutex<Option<TimeoutHandler>>,
}

/// Shared handle to one timer. The reactor owns the "last fired" bookkeeping;
/// this object only carries what the owner controls.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

impl Timeout {
    pub fn new(interval: Duration, enabled: bool) -> Self {
        Timeout {
            inner: Arc::new(TimeoutInner {
                interval_ms: AtomicU64::new(interval.as_millis() as u64),
                enabled: AtomicBool::new(enabled),
                needs_restart: AtomicBool::new(false),
                handler: Mutex::new(None),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms())
    }

    pub fn interval_ms(&self) -> u64 {
        self.inner.interval_ms.load(Ordering::Acquire)
    }

    /// Changes the interval and restarts the countdown from now.
    pub fn restart(&self, interval: Duration) {
        self.inner
            .interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
        self.inner.needs_restart.store(true, Ordering::Release);
    }

    /// Returns and clears the restart request.
    pub fn take_restart(&self) -> bool {
        self.inner.needs_restart.swap(false, Ordering::AcqRel)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn set_handler(&self, handler: TimeoutHandler) {
        *self.inner.handler.lock() = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.inner.handler.lock().take();
    }

    /// Runs the handler; it is taken out during the call so it may re-enter.
    pub fn handle(&self) -> Result<(), OutOfMemory> {
        let taken = self.inner.handler.lock().take();
        let Some(mut handler) = taken else {
            return Ok(());
        };
        let result = handler(self);

        let mut slot = self.inner.handler.lock();
        if slot.is_none() {
            *slot = Some(handler);
        }
        result
    }

    pub fn ptr_eq(&self, other: &Timeout) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Timeout {
    fn eq(&self, other: &Timeout) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Timeout {}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("interval_ms", &self.interval_ms())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
