//! The loop: clock, timers, idles, pending dispatch, multiplexing and
//! posted-task drain.
//!
//! One loop per thread. Everything mutates on the loop thread; other
//! threads reach in through `LoopHandle` only. Event dispatch runs in
//! priority order, highest stack first and newest-first inside a stack.
//! Storage marked destroy during a pass is freed only after its own
//! dispatch, never midway.

use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oneloop_core::error::{LoopError, Result};
use oneloop_core::{ldebug, lerror, lprint, priority, REPEAT_UNLIMITED};

use crate::clock::Clock;
use crate::cron::CronSchedule;
use crate::handle::{Inbox, IoToken, LoopHandle};
use crate::io::{IoArena, LOOP_READ_BUFSIZE};
use crate::pending::{Pending, PendingQueue};
use crate::poller::{new_poller, Interest, Poller, PollerKind, ReadyEvent};
use crate::sock;
use crate::timers::{TimerId, Timers};

/// Upper bound on one blocking wait.
const MAX_BLOCK_TIME_MS: i64 = 100;
/// Nap length while paused.
const PAUSE_SLEEP_MS: u64 = 10;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Stopped = 3,
}

impl LoopStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => LoopStatus::Running,
            2 => LoopStatus::Paused,
            3 => LoopStatus::Stopped,
            _ => LoopStatus::Idle,
        }
    }
}

/// Loop construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopOptions {
    pub backend: PollerKind,
    /// Run a single iteration and return.
    pub run_once: bool,
    /// Return from `run` once only internal events remain active.
    pub quit_when_idle: bool,
}

pub(crate) type IdleCb = Box<dyn FnMut(&mut EventLoop, u64)>;

pub(crate) struct Idle {
    pub repeat: u32,
    pub priority: i8,
    pub active: bool,
    pub pending: bool,
    pub destroy: bool,
    pub cb: Option<IdleCb>,
}

pub struct EventLoop {
    pub(crate) clock: Clock,
    status: Arc<AtomicU8>,
    options: LoopOptions,

    pub(crate) timers: Timers,
    pub(crate) idles: std::collections::HashMap<u64, Idle>,
    pub(crate) idle_order: Vec<u64>,
    pub(crate) pendings: PendingQueue,

    pub(crate) ios: IoArena,
    /// Fds with at least one registered interest.
    pub(crate) nios: usize,
    pub(crate) poller: Box<dyn Poller>,
    poll_events: Vec<ReadyEvent>,

    /// Active events overall; the loop idles out when this falls back to
    /// the internal baseline.
    pub(crate) nactives: usize,
    pub(crate) intern_nevents: usize,

    pub(crate) inbox: Arc<Inbox>,
    pub(crate) wakeup_read_fd: RawFd,
    wakeup_write_fd: RawFd,

    loop_count: u64,
    start_hrtime_us: u64,
    end_hrtime_us: u64,

    pub(crate) scratch: Option<Vec<u8>>,

    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new(options: LoopOptions) -> Result<Self> {
        lprint::init();
        sock::ignore_sigpipe();
        let poller =
            new_poller(options.backend).map_err(|e| LoopError::Os(e.raw_os_error().unwrap_or(0)))?;
        let mut lp = Self {
            clock: Clock::new(),
            status: Arc::new(AtomicU8::new(LoopStatus::Idle as u8)),
            options,
            timers: Timers::new(),
            idles: std::collections::HashMap::new(),
            idle_order: Vec::new(),
            pendings: PendingQueue::new(),
            ios: IoArena::new(),
            nios: 0,
            poller,
            poll_events: Vec::new(),
            nactives: 0,
            intern_nevents: 0,
            inbox: Arc::new(Inbox::new()),
            wakeup_read_fd: -1,
            wakeup_write_fd: -1,
            loop_count: 0,
            start_hrtime_us: 0,
            end_hrtime_us: 0,
            scratch: Some(vec![0u8; LOOP_READ_BUFSIZE]),
            _not_send: PhantomData,
        };
        lp.clock.update();
        lp.install_wakeup()?;
        Ok(lp)
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(LoopOptions::default())
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inbox: self.inbox.clone(),
            status: self.status.clone(),
        }
    }

    #[inline]
    pub fn status(&self) -> LoopStatus {
        LoopStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, s: LoopStatus) {
        self.status.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    #[inline]
    pub fn active_events(&self) -> usize {
        self.nactives
    }

    /// Monotonic microseconds as of the last clock refresh.
    #[inline]
    pub fn now_hrtime_us(&self) -> u64 {
        self.clock.hrtime_us()
    }

    /// Wall-clock seconds since the epoch.
    #[inline]
    pub fn now(&self) -> i64 {
        self.clock.realtime_secs()
    }

    /// Wall-clock milliseconds since the epoch.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.realtime_us() / 1_000
    }

    /// Wall-clock microseconds since the epoch.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.clock.realtime_us()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drive the loop until stopped or idled out. A stop recorded before
    /// entry stands: the loop only enters Running from Idle.
    pub fn run(&mut self) {
        if self
            .status
            .compare_exchange(
                LoopStatus::Idle as u8,
                LoopStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.clock.update();
        self.start_hrtime_us = self.clock.hrtime_us();
        loop {
            match self.status() {
                LoopStatus::Stopped => break,
                LoopStatus::Paused => {
                    std::thread::sleep(Duration::from_millis(PAUSE_SLEEP_MS));
                    self.clock.update();
                    continue;
                }
                _ => {}
            }
            self.loop_count += 1;
            if self.options.quit_when_idle && self.nactives <= self.intern_nevents {
                break;
            }
            self.iterate();
            if self.options.run_once {
                break;
            }
        }
        self.set_status(LoopStatus::Stopped);
        self.clock.update();
        self.end_hrtime_us = self.clock.hrtime_us();
    }

    /// Stop from the loop thread. Takes effect after this iteration.
    pub fn stop(&mut self) {
        self.set_status(LoopStatus::Stopped);
    }

    pub fn pause(&mut self) {
        if self.status() == LoopStatus::Running {
            self.set_status(LoopStatus::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.status() == LoopStatus::Paused {
            self.set_status(LoopStatus::Running);
        }
    }

    /// One pass: wait, expire timers, idles when nothing pends, dispatch.
    fn iterate(&mut self) {
        let mut block_ms = MAX_BLOCK_TIME_MS;
        let mut timer_due = false;
        if self.timers.len() > 0 {
            self.clock.update();
            let mut block_us = block_ms * 1000;
            if let Some(d) = self.timers.next_monotonic_deadline() {
                block_us = block_us.min(d as i64 - self.clock.hrtime_us() as i64);
            }
            if let Some(d) = self.timers.next_realtime_deadline() {
                block_us = block_us.min(d as i64 - self.clock.realtime_us() as i64);
            }
            if block_us <= 0 {
                timer_due = true;
            } else {
                block_ms = (block_us / 1000 + 1).min(MAX_BLOCK_TIME_MS);
            }
        }

        if !timer_due {
            if self.nios > 0 {
                self.poll_ios(block_ms as i32);
            } else {
                std::thread::sleep(Duration::from_millis(block_ms as u64));
            }
            self.clock.update();
            // A stop posted while we slept wins over this pass.
            if self.status() == LoopStatus::Stopped {
                return;
            }
        }

        if self.timers.len() > 0 {
            self.process_timers();
        }
        if self.pendings.is_empty() {
            self.process_idles();
        }
        self.process_pendings();
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Interval timer at the highest dispatch priority.
    pub fn add_timer<F>(&mut self, interval_ms: u64, repeat: u32, cb: F) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) + 'static,
    {
        self.clock.update();
        let repeat = repeat.max(1);
        let tid = self.timers.add_interval(
            self.clock.hrtime_us(),
            interval_ms,
            repeat,
            priority::HIGHEST,
            Box::new(cb),
        );
        self.nactives += 1;
        tid
    }

    /// Calendar timer on wall time.
    pub fn add_period<F>(&mut self, sched: CronSchedule, repeat: u32, cb: F) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) + 'static,
    {
        let repeat = repeat.max(1);
        let tid = self.timers.add_calendar(
            self.clock.realtime_secs(),
            sched,
            repeat,
            priority::HIGH,
            Box::new(cb),
        );
        self.nactives += 1;
        tid
    }

    /// Reschedule an interval timer, optionally with a new interval.
    pub fn reset_timer(&mut self, tid: TimerId, new_interval_ms: Option<u64>) -> bool {
        self.clock.update();
        self.timers.reset(tid, self.clock.hrtime_us(), new_interval_ms)
    }

    pub fn cancel_timer(&mut self, tid: TimerId) {
        if let Some((was_active, pending)) = self.timers.cancel(tid) {
            if was_active {
                self.nactives -= 1;
            }
            if !pending {
                self.timers.remove(tid);
            }
        }
    }

    fn process_timers(&mut self) -> usize {
        self.clock.update();
        let due = self
            .timers
            .pop_due(self.clock.hrtime_us(), self.clock.realtime_us());
        let n = due.len();
        for (tid, pri) in due {
            if let Some(e) = self.timers.entries.get_mut(&tid) {
                if !e.pending {
                    e.pending = true;
                    self.pendings.push(pri, Pending::Timer(tid));
                }
            }
        }
        n
    }

    fn dispatch_timer(&mut self, tid: TimerId) -> usize {
        let Some(entry) = self.timers.entries.get_mut(&tid) else {
            return 0;
        };
        entry.pending = false;
        let mut ncbs = 0;
        if entry.active {
            if let Some(mut cb) = entry.cb.take() {
                cb(self, tid);
                ncbs = 1;
                if let Some(e) = self.timers.entries.get_mut(&tid) {
                    if e.cb.is_none() {
                        e.cb = Some(cb);
                    }
                }
            }
        }
        // Deferred free for entries destroy-marked before or during the
        // callback, unless the callback revived or re-marked them.
        if let Some(e) = self.timers.entries.get(&tid) {
            if e.destroy && !e.pending {
                let was_active = e.active;
                self.timers.remove(tid);
                if was_active {
                    self.nactives -= 1;
                }
            }
        }
        ncbs
    }

    // ------------------------------------------------------------------
    // Idles
    // ------------------------------------------------------------------

    /// Run when an iteration has nothing pending. Lowest priority.
    pub fn add_idle<F>(&mut self, repeat: u32, cb: F) -> u64
    where
        F: FnMut(&mut EventLoop, u64) + 'static,
    {
        let id = oneloop_core::id::next_event_id();
        self.idles.insert(
            id,
            Idle {
                repeat: repeat.max(1),
                priority: priority::LOWEST,
                active: true,
                pending: false,
                destroy: false,
                cb: Some(Box::new(cb)),
            },
        );
        self.idle_order.push(id);
        self.nactives += 1;
        id
    }

    pub fn cancel_idle(&mut self, id: u64) {
        let Some(idle) = self.idles.get_mut(&id) else {
            return;
        };
        if idle.active {
            idle.active = false;
            self.nactives -= 1;
        }
        idle.destroy = true;
        if !idle.pending {
            self.idles.remove(&id);
            self.idle_order.retain(|x| *x != id);
        }
    }

    fn process_idles(&mut self) -> usize {
        let ids = self.idle_order.clone();
        let mut n = 0;
        for id in ids {
            let Some(idle) = self.idles.get_mut(&id) else {
                continue;
            };
            if !idle.active || idle.pending || idle.destroy {
                continue;
            }
            if idle.repeat != REPEAT_UNLIMITED {
                idle.repeat -= 1;
            }
            if idle.repeat == 0 {
                idle.destroy = true;
            }
            idle.pending = true;
            let pri = idle.priority;
            self.pendings.push(pri, Pending::Idle(id));
            n += 1;
        }
        n
    }

    fn dispatch_idle(&mut self, id: u64) -> usize {
        let Some(idle) = self.idles.get_mut(&id) else {
            return 0;
        };
        idle.pending = false;
        let mut ncbs = 0;
        if idle.active {
            if let Some(mut cb) = idle.cb.take() {
                cb(self, id);
                ncbs = 1;
                if let Some(i) = self.idles.get_mut(&id) {
                    if i.cb.is_none() {
                        i.cb = Some(cb);
                    }
                }
            }
        }
        if let Some(i) = self.idles.get(&id) {
            if i.destroy && !i.pending {
                let was_active = i.active;
                self.idles.remove(&id);
                self.idle_order.retain(|x| *x != id);
                if was_active {
                    self.nactives -= 1;
                }
            }
        }
        ncbs
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn process_pendings(&mut self) -> usize {
        let mut ncbs = 0;
        while let Some(p) = self.pendings.pop() {
            ncbs += match p {
                Pending::Timer(tid) => self.dispatch_timer(tid),
                Pending::Idle(id) => self.dispatch_idle(id),
                Pending::Io { fd, id } => self.dispatch_io(fd, id),
            };
        }
        ncbs
    }

    // ------------------------------------------------------------------
    // Multiplexing
    // ------------------------------------------------------------------

    fn poll_ios(&mut self, timeout_ms: i32) {
        let mut events = std::mem::take(&mut self.poll_events);
        events.clear();
        let mut bad = Vec::new();
        if let Err(e) = self.poller.poll(timeout_ms, &mut events, &mut bad) {
            lerror!("poller failed: {}", e);
        }
        for (fd, ready) in events.drain(..) {
            self.mark_io_ready(fd, ready);
        }
        self.poll_events = events;
        for fd in bad {
            self.fault_bad_fd(fd);
        }
    }

    pub(crate) fn mark_io_ready(&mut self, fd: RawFd, ready: Interest) {
        let Some(slot) = self.ios.get_mut(fd) else {
            return;
        };
        slot.revents.insert(ready);
        if !slot.pending {
            slot.pending = true;
            let (pri, id) = (slot.priority, slot.id);
            self.pendings.push(pri, Pending::Io { fd, id });
        }
    }

    /// Register additional readiness interest for an fd.
    pub(crate) fn io_add_interest(&mut self, fd: RawFd, ev: Interest) -> Result<()> {
        let (prev, new) = {
            let slot = self.ios.get_mut(fd).ok_or(LoopError::NoSuchIo(fd))?;
            let prev = slot.interest;
            let new = prev.union(ev);
            if new == prev {
                return Ok(());
            }
            (prev, new)
        };
        self.poller
            .set(fd, prev, new)
            .map_err(|e| LoopError::Os(e.raw_os_error().unwrap_or(0)))?;
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.interest = new;
            if prev.is_empty() {
                slot.active = true;
                self.nactives += 1;
                self.nios += 1;
            }
        }
        Ok(())
    }

    /// Drop readiness interest; deregisters when none remains.
    pub(crate) fn io_del_interest(&mut self, fd: RawFd, ev: Interest) {
        let (prev, new) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return;
            };
            let prev = slot.interest;
            let mut new = prev;
            new.remove(ev);
            if new == prev {
                return;
            }
            (prev, new)
        };
        // Teardown may race fd closure; a failed deregister is moot then.
        if let Err(e) = self.poller.set(fd, prev, new) {
            ldebug!("poller deregister fd={} failed: {}", fd, e);
        }
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.interest = new;
            if new.is_empty() {
                slot.active = false;
                self.nactives -= 1;
                self.nios -= 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Posted tasks
    // ------------------------------------------------------------------

    fn install_wakeup(&mut self) -> Result<()> {
        let (rfd, wfd) = wakeup_fds()?;
        self.wakeup_read_fd = rfd;
        self.wakeup_write_fd = wfd;
        self.inbox.wakeup_fd.store(wfd, Ordering::Release);
        let slot = self.ios.get_or_ready(rfd, sock::SockKind::Other);
        slot.is_wakeup = true;
        slot.priority = priority::HIGH;
        slot.reading = true;
        self.io_add_interest(rfd, Interest::READ)?;
        self.intern_nevents = self.nactives;
        Ok(())
    }

    /// Drain the wakeup fd and run every queued task.
    pub(crate) fn drain_inbox(&mut self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.wakeup_read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
        while let Some(task) = self.inbox.queue.pop() {
            task(self);
        }
    }

    // ------------------------------------------------------------------
    // Io tokens
    // ------------------------------------------------------------------

    /// Token for cross-thread write/close against this incarnation.
    pub fn io_token(&self, fd: RawFd) -> Option<IoToken> {
        self.ios.get(fd).map(|s| IoToken { fd, id: s.id })
    }

    pub(crate) fn io_matches(&self, token: IoToken) -> bool {
        self.ios
            .get(token.fd)
            .map(|s| s.id == token.id && !s.closed)
            .unwrap_or(false)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn wakeup_fds() -> Result<(RawFd, RawFd)> {
            let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if efd < 0 {
                return Err(LoopError::Os(sock::errno()));
            }
            Ok((efd, efd))
        }
    } else {
        fn wakeup_fds() -> Result<(RawFd, RawFd)> {
            let mut fds = [0; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                return Err(LoopError::Os(sock::errno()));
            }
            sock::set_nonblocking(fds[0])?;
            sock::set_nonblocking(fds[1])?;
            sock::set_cloexec(fds[0]);
            sock::set_cloexec(fds[1]);
            Ok((fds[0], fds[1]))
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Park the handle side first so nobody writes a dead fd.
        self.inbox.wakeup_fd.store(-1, Ordering::Release);
        self.set_status(LoopStatus::Stopped);
        for fd in self.ios.ready_fds() {
            unsafe {
                libc::close(fd);
            }
        }
        if self.wakeup_write_fd >= 0 && self.wakeup_write_fd != self.wakeup_read_fd {
            unsafe {
                libc::close(self.wakeup_write_fd);
            }
        }
    }
}
