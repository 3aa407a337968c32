//! Socket io objects and the fd-indexed arena.
//!
//! One slot per fd, created on first use and kept for fd reuse. The slot
//! carries everything the readiness handlers need: state flags, buffers,
//! callbacks, per-purpose timer ids and the recorded fault. A fresh
//! incarnation id is assigned each time a slot goes ready, so dispatch
//! entries and posted tasks referencing a recycled fd are skipped.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use oneloop_core::buffer::{FifoBuffer, WriteChunk};
use oneloop_core::{id, priority, FrameDecoder, IoFault};

use crate::event_loop::EventLoop;
use crate::poller::Interest;
use crate::sock::SockKind;

/// Shared scratch read size for sockets without their own buffer.
pub const LOOP_READ_BUFSIZE: usize = 8 * 1024;
/// Queued-write level that logs a warning.
pub const WRITE_BUFSIZE_HIGH_WATER: usize = 8 << 20;
/// Queued-write level that faults the connection.
pub const MAX_WRITE_BUFSIZE: usize = 16 << 20;
/// Own read buffer hard cap.
pub const MAX_READ_BUFSIZE: usize = 16 << 20;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 75_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Accepts per readiness pass on a listener.
pub(crate) const ACCEPT_BURST: usize = 3;

pub type AcceptCb = dyn Fn(&mut EventLoop, RawFd);
pub type ConnectCb = dyn Fn(&mut EventLoop, RawFd);
pub type ReadCb = dyn Fn(&mut EventLoop, RawFd, &[u8]);
pub type WriteCb = dyn Fn(&mut EventLoop, RawFd, usize);
pub type CloseCb = dyn Fn(&mut EventLoop, RawFd, Option<IoFault>);
pub type HeartbeatFn = dyn Fn(&mut EventLoop, RawFd);

/// Read-until condition for buffered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadUntil {
    None,
    Length(usize),
    Delim(u8),
}

pub(crate) struct IoSlot {
    pub fd: RawFd,
    pub id: u64,
    pub kind: SockKind,
    pub ready: bool,

    pub interest: Interest,
    pub revents: Interest,
    pub active: bool,
    pub pending: bool,
    pub priority: i8,

    pub accepting: bool,
    pub connecting: bool,
    pub connected: bool,
    pub closing: bool,
    pub closed: bool,
    pub is_wakeup: bool,

    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,

    pub reading: bool,
    pub read_once: bool,
    pub read_until: ReadUntil,
    pub readbuf: Option<FifoBuffer>,
    /// Caller-supplied plain-read buffer; `None` uses the loop scratch.
    pub read_scratch: Option<Vec<u8>>,
    pub max_read_bufsize: usize,
    pub last_read_us: u64,

    pub write_queue: VecDeque<WriteChunk>,
    pub write_bufsize: usize,
    pub max_write_bufsize: usize,
    pub last_write_us: u64,

    pub decoder: Option<Rc<FrameDecoder>>,
    pub upstream: Option<(RawFd, u64)>,
    pub fault: Option<IoFault>,

    pub accept_cb: Option<Rc<AcceptCb>>,
    pub connect_cb: Option<Rc<ConnectCb>>,
    pub read_cb: Option<Rc<ReadCb>>,
    pub write_cb: Option<Rc<WriteCb>>,
    pub close_cb: Option<Rc<CloseCb>>,
    pub heartbeat_fn: Option<Rc<HeartbeatFn>>,

    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub keepalive_timeout_ms: u64,

    pub connect_timer: Option<u64>,
    pub close_timer: Option<u64>,
    pub read_timer: Option<u64>,
    pub write_timer: Option<u64>,
    pub keepalive_timer: Option<u64>,
    pub heartbeat_timer: Option<u64>,
}

impl IoSlot {
    fn blank(fd: RawFd) -> Self {
        Self {
            fd,
            id: 0,
            kind: SockKind::Other,
            ready: false,
            interest: Interest::NONE,
            revents: Interest::NONE,
            active: false,
            pending: false,
            priority: priority::NORMAL,
            accepting: false,
            connecting: false,
            connected: false,
            closing: false,
            closed: false,
            is_wakeup: false,
            local_addr: None,
            peer_addr: None,
            reading: false,
            read_once: false,
            read_until: ReadUntil::None,
            readbuf: None,
            read_scratch: None,
            max_read_bufsize: MAX_READ_BUFSIZE,
            last_read_us: 0,
            write_queue: VecDeque::new(),
            write_bufsize: 0,
            max_write_bufsize: MAX_WRITE_BUFSIZE,
            last_write_us: 0,
            decoder: None,
            upstream: None,
            fault: None,
            accept_cb: None,
            connect_cb: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            heartbeat_fn: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            keepalive_timeout_ms: 0,
            connect_timer: None,
            close_timer: None,
            read_timer: None,
            write_timer: None,
            keepalive_timer: None,
            heartbeat_timer: None,
        }
    }

    /// Start a fresh incarnation on this fd.
    pub fn ready(&mut self, kind: SockKind) {
        let fd = self.fd;
        *self = Self::blank(fd);
        self.ready = true;
        self.id = id::next_event_id();
        self.kind = kind;
    }

    pub fn timer_ids(&self) -> [Option<u64>; 6] {
        [
            self.connect_timer,
            self.close_timer,
            self.read_timer,
            self.write_timer,
            self.keepalive_timer,
            self.heartbeat_timer,
        ]
    }

    /// True when buffered (framed or read-until) delivery is in effect.
    pub fn wants_own_readbuf(&self) -> bool {
        self.decoder.is_some() || self.read_until != ReadUntil::None
    }
}

/// Fd-indexed slot storage, grown to the next power of two.
pub(crate) struct IoArena {
    slots: Vec<Option<Box<IoSlot>>>,
}

fn ceil2e(mut n: usize) -> usize {
    let mut cap = 64;
    n = n.max(1);
    while cap < n {
        cap <<= 1;
    }
    cap
}

impl IoArena {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn get(&self, fd: RawFd) -> Option<&IoSlot> {
        if fd < 0 {
            return None;
        }
        self.slots
            .get(fd as usize)
            .and_then(|s| s.as_deref())
            .filter(|s| s.ready)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut IoSlot> {
        if fd < 0 {
            return None;
        }
        self.slots
            .get_mut(fd as usize)
            .and_then(|s| s.as_deref_mut())
            .filter(|s| s.ready)
    }

    /// Slot for `fd`, creating or recycling as needed. A slot left behind
    /// by a closed incarnation is re-readied with a new id.
    pub fn get_or_ready(&mut self, fd: RawFd, kind: SockKind) -> &mut IoSlot {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(ceil2e(idx + 1), || None);
        }
        let slot = self.slots[idx].get_or_insert_with(|| Box::new(IoSlot::blank(fd)));
        if !slot.ready {
            slot.ready(kind);
        }
        slot
    }

    /// Remove the slot entirely (detach path).
    pub fn take(&mut self, fd: RawFd) -> Option<Box<IoSlot>> {
        self.slots.get_mut(fd as usize).and_then(|s| s.take())
    }

    /// Every ready fd, for teardown.
    pub fn ready_fds(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter_map(|s| s.as_deref())
            .filter(|s| s.ready)
            .map(|s| s.fd)
            .collect()
    }
}

/// A socket pulled out of one loop for transfer to another.
///
/// Only plain data travels: callbacks and the frame decoder stay behind
/// and must be re-installed after `attach`.
#[derive(Debug)]
pub struct DetachedIo {
    pub(crate) fd: RawFd,
    pub(crate) kind: SockKind,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) connected: bool,
    pub(crate) readbuf: Vec<u8>,
}

impl DetachedIo {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil2e() {
        assert_eq!(ceil2e(1), 64);
        assert_eq!(ceil2e(64), 64);
        assert_eq!(ceil2e(65), 128);
        assert_eq!(ceil2e(1000), 1024);
    }

    #[test]
    fn test_arena_ready_and_reuse() {
        let mut arena = IoArena::new();
        let id1 = {
            let slot = arena.get_or_ready(5, SockKind::Stream);
            assert!(slot.ready);
            slot.id
        };
        // Same fd while ready: same incarnation.
        assert_eq!(arena.get_or_ready(5, SockKind::Stream).id, id1);
        // Closed and recycled: new incarnation.
        arena.get_mut(5).unwrap().ready = false;
        assert!(arena.get(5).is_none());
        let id2 = arena.get_or_ready(5, SockKind::Stream).id;
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_arena_grows_for_large_fd() {
        let mut arena = IoArena::new();
        let slot = arena.get_or_ready(700, SockKind::Dgram);
        assert_eq!(slot.fd, 700);
        assert!(arena.slots.len() >= 701);
        assert!(arena.slots.len().is_power_of_two());
    }

    #[test]
    fn test_take_removes_slot() {
        let mut arena = IoArena::new();
        arena.get_or_ready(3, SockKind::Stream);
        assert!(arena.take(3).is_some());
        assert!(arena.get(3).is_none());
    }
}
