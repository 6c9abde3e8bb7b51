// Reactor: one poll(2) loop multiplexing watches, timeouts and connection dispatch
use crate::config::SETTINGS;
use crate::connection::Connection;
use busline_core::{OutOfMemory, Timeout, Watch, WatchFlags};
use busline_transport::poll::{poll, PollEntry};
use busline_transport::DispatchStatus;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Source of monotonic time for timeout bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorConfig {
    /// How long a watch that ran out of memory stays out of the poll set,
    /// and how long dispatch sleeps before retrying a connection that needs memory.
    pub oom_wait: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            oom_wait: SETTINGS.oom_wait,
        }
    }
}

struct TimeoutEntry {
    timeout: Timeout,
    last_fired: Instant,
}

impl TimeoutEntry {
    /// Time left until due. A clock that went backwards restarts the countdown.
    fn remaining(&mut self, now: Instant) -> Duration {
        let interval = self.timeout.interval();
        match now.checked_duration_since(self.last_fired) {
            Some(elapsed) => interval.saturating_sub(elapsed),
            None => {
                debug!(interval_ms = self.timeout.interval_ms(), "clock went backwards, restarting timeout");
                self.last_fired = now;
                interval
            }
        }
    }
}

#[derive(Default)]
struct State {
    watches: HashMap<RawFd, Vec<Watch>>,
    // What each descriptor is polled for; absent means left out of the poll set
    interest: HashMap<RawFd, WatchFlags>,
    suspended: bool,
    timeouts: Vec<TimeoutEntry>,
    need_dispatch: VecDeque<Connection>,
    depth: u32,
    callbacks_serial: u64,
    oom_until: Option<Instant>,
}

impl State {
    fn contains_watch(&self, watch: &Watch) -> bool {
        self.watches
            .get(&watch.fd())
            .is_some_and(|bucket| bucket.iter().any(|w| w.ptr_eq(watch)))
    }

    fn refresh_interest(&mut self, fd: RawFd) {
        let mut flags = WatchFlags::NONE;
        if let Some(bucket) = self.watches.get(&fd) {
            for watch in bucket {
                if watch.is_enabled() && !watch.oom_last_time() {
                    flags |= watch.flags();
                }
            }
        }
        if flags.is_empty() {
            self.interest.remove(&fd);
        } else {
            self.interest.insert(fd, flags);
        }
    }

    fn refresh_all(&mut self) {
        let fds: Vec<RawFd> = self.watches.keys().copied().collect();
        for fd in fds {
            self.refresh_interest(fd);
        }
    }

    fn clear_oom_throttles(&mut self) {
        for bucket in self.watches.values() {
            for watch in bucket {
                watch.set_oom_last_time(false);
            }
        }
        self.oom_until = None;
        self.refresh_all();
    }
}

struct ReactorShared {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    config: ReactorConfig,
}

/// Cheaply clonable handle to one event loop. Callbacks run with no reactor
/// lock held, so they may add, remove, toggle or quit re-entrantly.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: ReactorConfig, clock: Arc<dyn Clock>) -> Self {
        Reactor {
            shared: Arc::new(ReactorShared {
                state: Mutex::new(State::default()),
                clock,
                config,
            }),
        }
    }

    pub fn config(&self) -> ReactorConfig {
        self.shared.config
    }

    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.lock();
        state.watches.is_empty() && state.timeouts.is_empty()
    }

    /// How many `run()` calls are currently active.
    pub fn depth(&self) -> u32 {
        self.shared.state.lock().depth
    }

    pub fn ptr_eq(&self, other: &Reactor) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn add_watch(&self, watch: &Watch) -> Result<(), OutOfMemory> {
        let fd = watch.fd();
        {
            let mut state = self.shared.state.lock();
            if state.contains_watch(watch) {
                error!(fd, "watch added to the reactor twice");
                debug_assert!(false, "watch added to the reactor twice");
                return Ok(());
            }
            state.watches.try_reserve(1)?;
            state.interest.try_reserve(1)?;
            let bucket = state.watches.entry(fd).or_default();
            if let Err(e) = bucket.try_reserve(1) {
                if bucket.is_empty() {
                    state.watches.remove(&fd);
                }
                return Err(e.into());
            }
            bucket.push(watch.clone());
            state.refresh_interest(fd);
            state.callbacks_serial += 1;
        }

        let weak: Weak<ReactorShared> = Arc::downgrade(&self.shared);
        watch.set_toggle_hook(Arc::new(move |w: &Watch| {
            if let Some(shared) = weak.upgrade() {
                Reactor { shared }.toggle_watch(w);
            }
        }));
        trace!(fd, flags = ?watch.flags(), "watch added");
        Ok(())
    }

    pub fn remove_watch(&self, watch: &Watch) {
        let fd = watch.fd();
        {
            let mut state = self.shared.state.lock();
            let position = state
                .watches
                .get(&fd)
                .and_then(|bucket| bucket.iter().position(|w| w.ptr_eq(watch)));
            match position {
                Some(pos) => {
                    let now_empty = match state.watches.get_mut(&fd) {
                        Some(bucket) => {
                            bucket.remove(pos);
                            bucket.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        state.watches.remove(&fd);
                    }
                    state.refresh_interest(fd);
                    state.callbacks_serial += 1;
                }
                // Purged after the descriptor went bad; nothing left to undo
                None if !watch.is_valid() => {
                    trace!(fd, "invalidated watch already gone");
                    return;
                }
                None => {
                    error!(fd, "removing a watch that was never added");
                    debug_assert!(false, "removing a watch that was never added");
                    return;
                }
            }
        }
        watch.clear_toggle_hook();
        trace!(fd, "watch removed");
    }

    /// Recomputes what the watch's descriptor is polled for.
    pub fn toggle_watch(&self, watch: &Watch) {
        let mut state = self.shared.state.lock();
        if state.watches.contains_key(&watch.fd()) {
            state.refresh_interest(watch.fd());
        }
    }

    /// With `false`, every descriptor leaves the poll set until re-enabled;
    /// timeouts keep running.
    pub fn toggle_all(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        state.suspended = !enabled;
        state.refresh_all();
    }

    pub fn add_timeout(&self, timeout: &Timeout) -> Result<(), OutOfMemory> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        if state.timeouts.iter().any(|e| e.timeout.ptr_eq(timeout)) {
            error!(interval_ms = timeout.interval_ms(), "timeout added to the reactor twice");
            debug_assert!(false, "timeout added to the reactor twice");
            return Ok(());
        }
        state.timeouts.try_reserve(1)?;
        timeout.take_restart();
        state.timeouts.push(TimeoutEntry {
            timeout: timeout.clone(),
            last_fired: now,
        });
        state.callbacks_serial += 1;
        Ok(())
    }

    pub fn remove_timeout(&self, timeout: &Timeout) {
        let mut state = self.shared.state.lock();
        match state.timeouts.iter().position(|e| e.timeout.ptr_eq(timeout)) {
            Some(pos) => {
                state.timeouts.remove(pos);
                state.callbacks_serial += 1;
            }
            None => {
                error!(interval_ms = timeout.interval_ms(), "removing a timeout that was never added");
                debug_assert!(false, "removing a timeout that was never added");
            }
        }
    }

    /// Schedules a connection for the next `dispatch()`; queueing one that is
    /// already waiting is a no-op.
    pub fn queue_dispatch(&self, connection: &Connection) -> Result<(), OutOfMemory> {
        let mut state = self.shared.state.lock();
        if state.need_dispatch.iter().any(|c| c.ptr_eq(connection)) {
            return Ok(());
        }
        state.need_dispatch.try_reserve(1)?;
        state.need_dispatch.push_back(connection.clone());
        Ok(())
    }

    /// Drains every queued connection to `Complete`, one after another.
    /// Returns whether there was anything to dispatch.
    pub fn dispatch(&self) -> bool {
        let mut any = false;
        loop {
            let next = self.shared.state.lock().need_dispatch.pop_front();
            let Some(connection) = next else {
                break;
            };
            any = true;
            loop {
                match connection.dispatch() {
                    DispatchStatus::Complete => break,
                    DispatchStatus::DataRemains => {}
                    DispatchStatus::NeedMemory => self.wait_for_memory(),
                }
            }
        }
        any
    }

    fn wait_for_memory(&self) {
        let wait = self.shared.config.oom_wait;
        debug!(wait_ms = wait.as_millis() as u64, "waiting for memory before retrying dispatch");
        std::thread::sleep(wait);
    }

    /// One pass: a single poll(2), then expired timeouts, ready watches and
    /// pending dispatch. Returns whether anything fired or was dispatched.
    pub fn iterate(&self, block: bool) -> bool {
        let mut fired = false;
        let now = self.shared.clock.now();

        let (mut entries, timeout, depth) = {
            let mut state = self.shared.state.lock();
            if state.watches.is_empty() && state.timeouts.is_empty() {
                drop(state);
                return self.dispatch();
            }

            if state.oom_until.is_some_and(|until| now >= until) {
                trace!("memory retry window elapsed, polling throttled watches again");
                state.clear_oom_throttles();
            }

            let mut timeout: Option<Duration> = None;
            for entry in state.timeouts.iter_mut() {
                if !entry.timeout.is_enabled() {
                    continue;
                }
                if entry.timeout.take_restart() {
                    entry.last_fired = now;
                }
                let remaining = entry.remaining(now);
                timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
            }

            if !block || !state.need_dispatch.is_empty() {
                timeout = Some(Duration::ZERO);
            }

            if let Some(until) = state.oom_until {
                let left = until.saturating_duration_since(now);
                timeout = Some(timeout.map_or(left, |t| t.min(left)));
            }

            let entries: Vec<PollEntry> = if state.suspended {
                Vec::new()
            } else {
                state
                    .interest
                    .iter()
                    .map(|(&fd, &flags)| PollEntry::new(fd, flags))
                    .collect()
            };
            (entries, timeout, state.depth)
        };

        match poll(&mut entries, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("poll interrupted");
                entries.iter_mut().for_each(|e| e.revents = WatchFlags::NONE);
            }
            Err(e) => {
                warn!(error = %e, "poll failed");
                entries.iter_mut().for_each(|e| e.revents = WatchFlags::NONE);
            }
        }

        let now = self.shared.clock.now();
        let (timeouts_fired, keep_going) = self.fire_timeouts(now, depth);
        fired |= timeouts_fired;

        if keep_going {
            fired |= self.fire_watches(&entries, now, depth);
        }

        if self.dispatch() {
            fired = true;
        }
        fired
    }

    /// Returns (anything fired, whether the watch pass may still run).
    /// A handler that changes the timeout list restarts the pass over the new
    /// list; each timeout fires at most once per pass.
    fn fire_timeouts(&self, now: Instant, depth: u32) -> (bool, bool) {
        let mut handled: Vec<Timeout> = Vec::new();
        let mut fired = false;
        'pass: loop {
            let (timeouts, serial) = {
                let state = self.shared.state.lock();
                if state.depth != depth {
                    return (fired, false);
                }
                let timeouts: Vec<Timeout> = state.timeouts.iter().map(|e| e.timeout.clone()).collect();
                (timeouts, state.callbacks_serial)
            };

            for timeout in timeouts {
                if handled.iter().any(|t| t.ptr_eq(&timeout)) {
                    continue;
                }
                let due = {
                    let mut state = self.shared.state.lock();
                    if state.depth != depth {
                        return (fired, false);
                    }
                    if state.callbacks_serial != serial {
                        trace!("timeout list changed, restarting the pass");
                        continue 'pass;
                    }
                    if !timeout.is_enabled() {
                        continue;
                    }
                    let due = match state.timeouts.iter_mut().find(|e| e.timeout.ptr_eq(&timeout)) {
                        Some(entry) => {
                            let expired = entry.remaining(now).is_zero();
                            if expired {
                                entry.last_fired = now;
                            }
                            expired
                        }
                        None => false,
                    };
                    due
                };
                if due {
                    fired = true;
                    handled.push(timeout.clone());
                    if timeout.handle().is_err() {
                        debug!(interval_ms = timeout.interval_ms(), "timeout handler ran out of memory");
                    }
                }
            }
            break;
        }
        (fired, self.depth() == depth)
    }

    fn fire_watches(&self, entries: &[PollEntry], now: Instant, depth: u32) -> bool {
        let mut fired = false;
        for entry in entries.iter().filter(|e| !e.revents.is_empty()) {
            if entry.revents.contains(WatchFlags::INVALID) {
                self.purge_descriptor(entry.fd);
                fired = true;
                continue;
            }

            let bucket: Vec<Watch> = match self.shared.state.lock().watches.get(&entry.fd) {
                Some(bucket) => bucket.clone(),
                None => continue,
            };

            for watch in bucket {
                {
                    let state = self.shared.state.lock();
                    if state.depth != depth {
                        return fired;
                    }
                    if !state.contains_watch(&watch) {
                        continue;
                    }
                }
                if !watch.is_enabled() || watch.oom_last_time() {
                    continue;
                }
                let condition = reported_condition(entry.revents, watch.flags());
                if condition.is_empty() {
                    continue;
                }

                fired = true;
                if watch.handle(condition).is_err() {
                    debug!(fd = entry.fd, "watch handler ran out of memory, throttling it");
                    watch.set_oom_last_time(true);
                    let mut state = self.shared.state.lock();
                    if state.oom_until.is_none() {
                        state.oom_until = Some(now + self.shared.config.oom_wait);
                    }
                    state.refresh_interest(entry.fd);
                }
            }
        }
        fired
    }

    fn purge_descriptor(&self, fd: RawFd) {
        let purged = {
            let mut state = self.shared.state.lock();
            state.interest.remove(&fd);
            let purged = state.watches.remove(&fd).unwrap_or_default();
            state.callbacks_serial += 1;
            purged
        };
        warn!(fd, watches = purged.len(), "descriptor is not open, dropping its watches");
        for watch in purged {
            watch.clear_toggle_hook();
            watch.invalidate();
        }
    }

    /// Iterates until `quit()` brings the depth back below this call's level.
    pub fn run(&self) {
        let exit_depth = {
            let mut state = self.shared.state.lock();
            let depth = state.depth;
            state.depth += 1;
            depth
        };
        debug!(depth = exit_depth + 1, "reactor running");
        while self.depth() > exit_depth {
            self.iterate(true);
        }
        debug!(depth = exit_depth, "reactor left run");
    }

    pub fn quit(&self) {
        let mut state = self.shared.state.lock();
        if state.depth == 0 {
            error!("quit called on a reactor that is not running");
            debug_assert!(false, "quit called on a reactor that is not running");
            return;
        }
        state.depth -= 1;
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Reactor")
            .field("descriptors", &state.watches.len())
            .field("polled", &state.interest.len())
            .field("timeouts", &state.timeouts.len())
            .field("need_dispatch", &state.need_dispatch.len())
            .field("depth", &state.depth)
            .finish()
    }
}

/// Hands a watch only the directions it asked for, plus error and hangup.
fn reported_condition(revents: WatchFlags, wanted: WatchFlags) -> WatchFlags {
    let mut condition = WatchFlags::NONE;
    for flag in [WatchFlags::READABLE, WatchFlags::WRITABLE] {
        if wanted.contains(flag) && revents.contains(flag) {
            condition |= flag;
        }
    }
    for flag in [WatchFlags::ERROR, WatchFlags::HANGUP] {
        if revents.contains(flag) {
            condition |= flag;
        }
    }
    condition
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use proptest::prelude::*;
    use std::io::Read;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A clock the test moves by hand.
    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(ManualClock {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }

        fn rewind(&self, by: Duration) {
            let mut now = self.now.lock();
            *now = now.checked_sub(by).unwrap_or(*now);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn reactor_with(clock: Arc<ManualClock>, oom_wait: Duration) -> Reactor {
        Reactor::with_clock(ReactorConfig { oom_wait }, clock)
    }

    fn counting_timeout(interval: Duration, hits: &Arc<AtomicUsize>) -> Timeout {
        let timeout = Timeout::new(interval, true);
        let hits = Arc::clone(hits);
        timeout.set_handler(Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        timeout
    }

    fn readable_pipe() -> (OwnedFd, OwnedFd) {
        let (r, w) = pipe().unwrap();
        write(&w, b"x").unwrap();
        (r, w)
    }

    #[test]
    fn timeout_fires_only_once_due() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(10));
        let hits = Arc::new(AtomicUsize::new(0));
        let timeout = counting_timeout(Duration::from_millis(100), &hits);
        reactor.add_timeout(&timeout).unwrap();

        assert!(!reactor.iterate(false));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(99));
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(1));
        assert!(reactor.iterate(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Countdown restarted from the firing time
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_and_restarted_timeouts() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(10));
        let hits = Arc::new(AtomicUsize::new(0));
        let timeout = counting_timeout(Duration::from_millis(50), &hits);
        reactor.add_timeout(&timeout).unwrap();

        timeout.set_enabled(false);
        clock.advance(Duration::from_millis(60));
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        timeout.set_enabled(true);
        timeout.restart(Duration::from_millis(50));
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(50));
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clock_going_backwards_restarts_countdown() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(10));
        let hits = Arc::new(AtomicUsize::new(0));
        let timeout = counting_timeout(Duration::from_millis(100), &hits);
        reactor.add_timeout(&timeout).unwrap();

        clock.rewind(Duration::from_secs(5));
        reactor.iterate(false);
        clock.advance(Duration::from_millis(99));
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        clock.advance(Duration::from_millis(1));
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_removed_by_an_earlier_handler_does_not_fire() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(10));
        let hits = Arc::new(AtomicUsize::new(0));

        let first = Timeout::new(Duration::ZERO, true);
        let second = counting_timeout(Duration::ZERO, &hits);
        {
            let reactor = reactor.clone();
            let second = second.clone();
            first.set_handler(Box::new(move |_| {
                reactor.remove_timeout(&second);
                Ok(())
            }));
        }
        reactor.add_timeout(&first).unwrap();
        reactor.add_timeout(&second).unwrap();

        assert!(reactor.iterate(false));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn adding_a_timeout_mid_pass_still_fires_the_rest() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(10));
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let first = Timeout::new(Duration::from_millis(50), true);
        let second = counting_timeout(Duration::from_millis(50), &second_hits);
        let extra = Timeout::new(Duration::from_secs(3600), true);
        extra.set_handler(Box::new(|_| Ok(())));
        {
            let reactor = reactor.clone();
            let hits = Arc::clone(&first_hits);
            first.set_handler(Box::new(move |_| {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    reactor.add_timeout(&extra).unwrap();
                }
                Ok(())
            }));
        }
        reactor.add_timeout(&first).unwrap();
        reactor.add_timeout(&second).unwrap();

        clock.advance(Duration::from_millis(50));
        assert!(reactor.iterate(false));
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ready_watch_is_invoked_with_its_condition() {
        let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
        let (r, _w) = readable_pipe();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let watch = Watch::new(r.as_raw_fd(), WatchFlags::READABLE, true);
        let sink = Arc::clone(&seen);
        watch.set_handler(Box::new(move |_, condition| {
            sink.lock().push(condition);
            Ok(())
        }));
        reactor.add_watch(&watch).unwrap();

        assert!(reactor.iterate(false));
        assert_eq!(*seen.lock(), vec![WatchFlags::READABLE]);

        watch.set_enabled(false);
        assert!(!reactor.iterate(false));
        assert_eq!(seen.lock().len(), 1);

        watch.set_enabled(true);
        reactor.iterate(false);
        assert_eq!(seen.lock().len(), 2);

        reactor.remove_watch(&watch);
        assert!(reactor.is_empty());
    }

    #[test]
    fn toggle_all_suspends_polling() {
        let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
        let (r, _w) = readable_pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let watch = Watch::new(r.as_raw_fd(), WatchFlags::READABLE, true);
        let counter = Arc::clone(&hits);
        watch.set_handler(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        reactor.add_watch(&watch).unwrap();

        reactor.toggle_all(false);
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        reactor.toggle_all(true);
        reactor.iterate(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_memory_watch_does_not_livelock() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(200));
        let (r, _w) = readable_pipe();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let watch = Watch::new(r.as_raw_fd(), WatchFlags::READABLE, true);
        watch.set_handler(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OutOfMemory)
        }));
        reactor.add_watch(&watch).unwrap();

        reactor.iterate(false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(watch.oom_last_time());

        // Within the retry window the watch is not polled, however many passes run
        for _ in 0..5 {
            reactor.iterate(false);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(200));
        reactor.iterate(false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn throttled_watch_leaves_others_running() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(200));
        let (starved_r, _starved_w) = readable_pipe();
        let (ready_r, _ready_w) = readable_pipe();

        let starved_calls = Arc::new(AtomicUsize::new(0));
        let starved = Watch::new(starved_r.as_raw_fd(), WatchFlags::READABLE, true);
        let counter = Arc::clone(&starved_calls);
        starved.set_handler(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OutOfMemory)
        }));

        let ready_calls = Arc::new(AtomicUsize::new(0));
        let ready = Watch::new(ready_r.as_raw_fd(), WatchFlags::READABLE, true);
        let counter = Arc::clone(&ready_calls);
        ready.set_handler(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let ticks = Arc::new(AtomicUsize::new(0));
        let tick = counting_timeout(Duration::ZERO, &ticks);

        reactor.add_watch(&starved).unwrap();
        reactor.add_watch(&ready).unwrap();
        reactor.add_timeout(&tick).unwrap();

        for round in 1..=5 {
            assert!(reactor.iterate(false));
            assert_eq!(ready_calls.load(Ordering::SeqCst), round);
            assert_eq!(ticks.load(Ordering::SeqCst), round);
            assert_eq!(starved_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn elapsed_memory_window_alone_is_not_activity() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(100));
        let (r, w) = readable_pipe();

        let watch = Watch::new(r.as_raw_fd(), WatchFlags::READABLE, true);
        watch.set_handler(Box::new(|_, _| Err(OutOfMemory)));
        reactor.add_watch(&watch).unwrap();
        assert!(reactor.iterate(false));

        // Drain the pipe so nothing is ready once the watch is polled again
        let mut byte = [0u8; 1];
        std::fs::File::from(r.try_clone().unwrap()).read_exact(&mut byte).unwrap();
        clock.advance(Duration::from_millis(100));
        assert!(!reactor.iterate(false));
        assert!(!watch.oom_last_time());
        drop(w);
    }

    #[test]
    fn invalid_descriptor_purges_its_watches() {
        let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
        // Far above anything this process has open
        let fd: RawFd = 999_999;
        let watch = Watch::new(fd, WatchFlags::READABLE, true);
        watch.set_handler(Box::new(|_, _| Ok(())));
        reactor.add_watch(&watch).unwrap();

        reactor.iterate(false);

        assert!(reactor.is_empty());
        assert!(!watch.is_valid());
        // Late removal by the owner is quietly accepted
        reactor.remove_watch(&watch);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "never added")]
    fn removing_unknown_watch_is_diagnosed() {
        let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
        let watch = Watch::new(0, WatchFlags::READABLE, true);
        reactor.remove_watch(&watch);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "never added")]
    fn removing_unknown_timeout_is_diagnosed() {
        let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
        reactor.remove_timeout(&Timeout::new(Duration::from_millis(5), true));
    }

    #[test]
    fn interest_is_union_of_enabled_watches() {
        let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
        let (r, _w) = pipe().unwrap();
        let fd = r.as_raw_fd();
        let reader = Watch::new(fd, WatchFlags::READABLE, true);
        let writer = Watch::new(fd, WatchFlags::WRITABLE, false);
        reactor.add_watch(&reader).unwrap();
        reactor.add_watch(&writer).unwrap();

        let interest = |reactor: &Reactor| reactor.shared.state.lock().interest.get(&fd).copied();
        assert_eq!(interest(&reactor), Some(WatchFlags::READABLE));

        writer.set_enabled(true);
        assert_eq!(interest(&reactor), Some(WatchFlags::READABLE | WatchFlags::WRITABLE));

        reader.set_enabled(false);
        writer.set_enabled(false);
        assert_eq!(interest(&reactor), None);

        reactor.remove_watch(&reader);
        reactor.remove_watch(&writer);
        assert!(reactor.shared.state.lock().watches.is_empty());
    }

    proptest! {
        #[test]
        fn polled_interest_matches_enabled_watches(
            setup in proptest::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 1..6)
        ) {
            let reactor = reactor_with(ManualClock::new(), Duration::from_millis(10));
            let (r, _w) = pipe().unwrap();
            let fd = r.as_raw_fd();
            let mut expected = WatchFlags::NONE;
            let mut watches = Vec::new();
            for (readable, enabled, throttled) in setup {
                let flags = if readable { WatchFlags::READABLE } else { WatchFlags::WRITABLE };
                let watch = Watch::new(fd, flags, enabled);
                watch.set_oom_last_time(throttled);
                if enabled && !throttled {
                    expected |= flags;
                }
                reactor.add_watch(&watch).unwrap();
                watches.push(watch);
            }

            let polled = reactor.shared.state.lock().interest.get(&fd).copied().unwrap_or_default();
            prop_assert_eq!(polled, expected);

            for watch in &watches {
                reactor.remove_watch(watch);
            }
            prop_assert!(reactor.is_empty());
        }
    }

    #[test]
    fn nested_run_unwinds_one_level_per_quit() {
        let clock = ManualClock::new();
        let reactor = reactor_with(Arc::clone(&clock), Duration::from_millis(10));
        let depths = Arc::new(Mutex::new(Vec::new()));

        let outer = Timeout::new(Duration::ZERO, true);
        let inner = Timeout::new(Duration::ZERO, false);
        {
            let reactor = reactor.clone();
            let depths = Arc::clone(&depths);
            inner.set_handler(Box::new(move |t| {
                t.set_enabled(false);
                depths.lock().push(reactor.depth());
                reactor.quit();
                Ok(())
            }));
        }
        {
            let reactor = reactor.clone();
            let depths = Arc::clone(&depths);
            let inner = inner.clone();
            outer.set_handler(Box::new(move |t| {
                t.set_enabled(false);
                depths.lock().push(reactor.depth());
                inner.set_enabled(true);
                reactor.run();
                depths.lock().push(reactor.depth());
                reactor.quit();
                Ok(())
            }));
        }
        reactor.add_timeout(&outer).unwrap();
        reactor.add_timeout(&inner).unwrap();

        reactor.run();
        assert_eq!(reactor.depth(), 0);
        assert_eq!(*depths.lock(), vec![1, 2, 1]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not running")]
    fn quit_without_run_is_diagnosed() {
        Reactor::with_config(ReactorConfig {
            oom_wait: Duration::from_millis(1),
        })
        .quit();
    }

    #[test]
    fn condition_is_filtered_to_requested_directions() {
        let all = WatchFlags::READABLE | WatchFlags::WRITABLE | WatchFlags::HANGUP;
        assert_eq!(
            reported_condition(all, WatchFlags::READABLE),
            WatchFlags::READABLE | WatchFlags::HANGUP
        );
        assert_eq!(reported_condition(WatchFlags::READABLE, WatchFlags::WRITABLE), WatchFlags::NONE);
    }
}
