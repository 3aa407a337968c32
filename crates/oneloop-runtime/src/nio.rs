//! Non-blocking socket operations on the loop.
//!
//! Everything here is `impl EventLoop`: constructors, the readiness
//! handlers behind `dispatch_io`, the read/write paths, deferred close,
//! per-purpose timeouts and upstream relay. State lives in the `IoSlot`
//! arena; callbacks are cloned out of the slot before they run so a
//! callback may freely mutate the loop, including closing its own fd.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use oneloop_core::buffer::{FifoBuffer, WriteChunk};
use oneloop_core::error::{LoopError, Result, TimeoutKind};
use oneloop_core::{ldebug, lwarn, FrameDecoder, IoFault, REPEAT_UNLIMITED};

use crate::event_loop::EventLoop;
use crate::io::{
    DetachedIo, IoSlot, ReadUntil, ACCEPT_BURST, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_KEEPALIVE_TIMEOUT_MS, LOOP_READ_BUFSIZE, WRITE_BUFSIZE_HIGH_WATER,
};
use crate::poller::Interest;
use crate::sock::{self, SockKind};

const LISTEN_BACKLOG: i32 = 128;

#[inline]
fn is_transient(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK || err == libc::EINTR
}

impl EventLoop {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Listening TCP socket. Accepted connections inherit the accept
    /// callback and frame decoder configured on the listener.
    pub fn tcp_server<F>(&mut self, host: &str, port: u16, on_accept: F) -> Result<RawFd>
    where
        F: Fn(&mut EventLoop, RawFd) + 'static,
    {
        let addr = sock::resolve(host, port)?;
        let fd = sock::socket(&addr, libc::SOCK_STREAM)?;
        let setup = (|| {
            sock::set_reuseaddr(fd)?;
            sock::bind(fd, &addr)?;
            sock::listen(fd, LISTEN_BACKLOG)?;
            sock::set_nonblocking(fd)
        })();
        if let Err(e) = setup {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let slot = self.ios.get_or_ready(fd, SockKind::Stream);
        slot.accepting = true;
        slot.accept_cb = Some(Rc::new(on_accept));
        slot.local_addr = sock::local_addr(fd);
        self.io_add_interest(fd, Interest::READ)?;
        Ok(fd)
    }

    /// Non-blocking TCP connect. The connect callback fires after the
    /// completion is verified; failures surface through the close
    /// callback with the recorded fault.
    pub fn tcp_client<F>(&mut self, host: &str, port: u16, on_connect: F) -> Result<RawFd>
    where
        F: Fn(&mut EventLoop, RawFd) + 'static,
    {
        let addr = sock::resolve(host, port)?;
        let fd = sock::socket(&addr, libc::SOCK_STREAM)?;
        if let Err(e) = sock::set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let rc = sock::connect(fd, &addr);
        if rc < 0 {
            let err = sock::errno();
            if err != libc::EINPROGRESS {
                unsafe { libc::close(fd) };
                return Err(LoopError::Os(err));
            }
        }
        let slot = self.ios.get_or_ready(fd, SockKind::Stream);
        slot.connecting = true;
        slot.connect_cb = Some(Rc::new(on_connect));
        slot.peer_addr = Some(addr);
        self.io_add_interest(fd, Interest::WRITE)?;
        if rc == 0 {
            // Already connected (loopback, mostly). Completion still goes
            // through the writability path so callback order is uniform.
            self.mark_io_ready(fd, Interest::WRITE);
        }
        self.arm_connect_timer(fd);
        Ok(fd)
    }

    /// Bound UDP socket. Dgram sockets stay blocking and queue-free.
    pub fn udp_server(&mut self, host: &str, port: u16) -> Result<RawFd> {
        let addr = sock::resolve(host, port)?;
        let fd = sock::socket(&addr, libc::SOCK_DGRAM)?;
        let setup = (|| {
            sock::set_reuseaddr(fd)?;
            sock::bind(fd, &addr)
        })();
        if let Err(e) = setup {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let slot = self.ios.get_or_ready(fd, SockKind::Dgram);
        slot.local_addr = sock::local_addr(fd);
        Ok(fd)
    }

    /// Connected UDP socket.
    pub fn udp_client(&mut self, host: &str, port: u16) -> Result<RawFd> {
        let addr = sock::resolve(host, port)?;
        let fd = sock::socket(&addr, libc::SOCK_DGRAM)?;
        if sock::connect(fd, &addr) < 0 {
            let err = sock::errno();
            unsafe { libc::close(fd) };
            return Err(LoopError::Os(err));
        }
        let slot = self.ios.get_or_ready(fd, SockKind::Dgram);
        slot.connected = true;
        slot.peer_addr = Some(addr);
        slot.local_addr = sock::local_addr(fd);
        Ok(fd)
    }

    /// Adopt a descriptor created outside the loop. The kind comes from
    /// an SO_TYPE probe (non-sockets register as Other); everything but
    /// dgram sockets is switched to non-blocking. An fd the loop already
    /// tracks is returned as-is.
    pub fn adopt_fd(&mut self, fd: RawFd) -> Result<RawFd> {
        if fd < 0 {
            return Err(LoopError::NoSuchIo(fd));
        }
        if self.ios.get(fd).is_some() {
            return Ok(fd);
        }
        let kind = sock::socket_kind(fd);
        if kind != SockKind::Dgram {
            sock::set_nonblocking(fd)?;
        }
        let slot = self.ios.get_or_ready(fd, kind);
        slot.local_addr = sock::local_addr(fd);
        slot.peer_addr = sock::peer_addr(fd);
        slot.connected = slot.peer_addr.is_some();
        Ok(fd)
    }

    /// Pull a socket out of this loop for transfer to another thread.
    /// Callbacks and the frame decoder stay behind.
    pub fn detach(&mut self, fd: RawFd) -> Result<DetachedIo> {
        {
            let slot = self.ios.get(fd).ok_or(LoopError::NoSuchIo(fd))?;
            if slot.is_wakeup {
                return Err(LoopError::NoSuchIo(fd));
            }
        }
        self.cancel_io_timers(fd);
        self.io_del_interest(fd, Interest::RDWR);
        let mut slot = match self.ios.take(fd) {
            Some(s) => s,
            None => return Err(LoopError::NoSuchIo(fd)),
        };
        Ok(DetachedIo {
            fd,
            kind: slot.kind,
            local_addr: slot.local_addr,
            peer_addr: slot.peer_addr,
            connected: slot.connected,
            readbuf: slot
                .readbuf
                .as_mut()
                .map(|b| b.take_bytes())
                .unwrap_or_default(),
        })
    }

    /// Install a detached socket in this loop. Reading starts when the
    /// caller asks for it.
    pub fn attach(&mut self, detached: DetachedIo) -> Result<RawFd> {
        let fd = detached.fd;
        let slot = self.ios.get_or_ready(fd, detached.kind);
        slot.local_addr = detached.local_addr;
        slot.peer_addr = detached.peer_addr;
        slot.connected = detached.connected;
        if !detached.readbuf.is_empty() {
            slot.readbuf
                .get_or_insert_with(FifoBuffer::new)
                .extend(&detached.readbuf);
        }
        Ok(fd)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_read_cb<F>(&mut self, fd: RawFd, cb: F) -> Result<()>
    where
        F: Fn(&mut EventLoop, RawFd, &[u8]) + 'static,
    {
        self.slot_mut(fd)?.read_cb = Some(Rc::new(cb));
        Ok(())
    }

    pub fn set_write_cb<F>(&mut self, fd: RawFd, cb: F) -> Result<()>
    where
        F: Fn(&mut EventLoop, RawFd, usize) + 'static,
    {
        self.slot_mut(fd)?.write_cb = Some(Rc::new(cb));
        Ok(())
    }

    pub fn set_close_cb<F>(&mut self, fd: RawFd, cb: F) -> Result<()>
    where
        F: Fn(&mut EventLoop, RawFd, Option<IoFault>) + 'static,
    {
        self.slot_mut(fd)?.close_cb = Some(Rc::new(cb));
        Ok(())
    }

    /// Frame-at-a-time delivery. On a listener the decoder is inherited
    /// by accepted connections.
    pub fn set_frame_decoder(&mut self, fd: RawFd, decoder: FrameDecoder) -> Result<()> {
        let slot = self.slot_mut(fd)?;
        slot.decoder = Some(Rc::new(decoder));
        slot.readbuf.get_or_insert_with(FifoBuffer::new);
        Ok(())
    }

    pub fn set_priority(&mut self, fd: RawFd, pri: i8) -> Result<()> {
        self.slot_mut(fd)?.priority = oneloop_core::priority::clamp(pri);
        Ok(())
    }

    pub fn set_max_write_bufsize(&mut self, fd: RawFd, max: usize) -> Result<()> {
        self.slot_mut(fd)?.max_write_bufsize = max;
        Ok(())
    }

    pub fn set_max_read_bufsize(&mut self, fd: RawFd, max: usize) -> Result<()> {
        self.slot_mut(fd)?.max_read_bufsize = max;
        Ok(())
    }

    /// Caller-supplied buffer for plain reads on this io; its length caps
    /// how much one readiness pass reads. `None` or an empty buffer
    /// reverts to the loop's shared scratch.
    pub fn set_read_buffer(&mut self, fd: RawFd, buf: Option<Vec<u8>>) -> Result<()> {
        self.slot_mut(fd)?.read_scratch = buf.filter(|b| !b.is_empty());
        Ok(())
    }

    pub fn set_connect_timeout(&mut self, fd: RawFd, ms: u64) -> Result<()> {
        self.slot_mut(fd)?.connect_timeout_ms = ms;
        Ok(())
    }

    pub fn set_close_timeout(&mut self, fd: RawFd, ms: u64) -> Result<()> {
        self.slot_mut(fd)?.close_timeout_ms = ms;
        Ok(())
    }

    /// Fault the connection after `ms` without a completed read. 0
    /// disables.
    pub fn set_read_timeout(&mut self, fd: RawFd, ms: u64) -> Result<()> {
        let now = self.clock.hrtime_us();
        let (id, old) = {
            let slot = self.slot_mut(fd)?;
            slot.read_timeout_ms = ms;
            slot.last_read_us = now;
            (slot.id, slot.read_timer.take())
        };
        if let Some(tid) = old {
            self.cancel_timer(tid);
        }
        if ms > 0 {
            let tid = self.add_timer(ms, 1, move |lp, _| {
                lp.on_io_timeout(fd, id, TimeoutKind::Read);
            });
            if let Some(slot) = self.ios.get_mut(fd) {
                slot.read_timer = Some(tid);
            }
        }
        Ok(())
    }

    pub fn set_write_timeout(&mut self, fd: RawFd, ms: u64) -> Result<()> {
        let now = self.clock.hrtime_us();
        let (id, old) = {
            let slot = self.slot_mut(fd)?;
            slot.write_timeout_ms = ms;
            slot.last_write_us = now;
            (slot.id, slot.write_timer.take())
        };
        if let Some(tid) = old {
            self.cancel_timer(tid);
        }
        if ms > 0 {
            let tid = self.add_timer(ms, 1, move |lp, _| {
                lp.on_io_timeout(fd, id, TimeoutKind::Write);
            });
            if let Some(slot) = self.ios.get_mut(fd) {
                slot.write_timer = Some(tid);
            }
        }
        Ok(())
    }

    /// Fault the connection after `ms` with no traffic either way.
    pub fn set_keepalive_timeout(&mut self, fd: RawFd, ms: u64) -> Result<()> {
        let now = self.clock.hrtime_us();
        let (id, old) = {
            let slot = self.slot_mut(fd)?;
            slot.keepalive_timeout_ms = if ms == 0 { DEFAULT_KEEPALIVE_TIMEOUT_MS } else { ms };
            slot.last_read_us = now;
            slot.last_write_us = now;
            (slot.id, slot.keepalive_timer.take())
        };
        if let Some(tid) = old {
            self.cancel_timer(tid);
        }
        let ms = self
            .ios
            .get(fd)
            .map(|s| s.keepalive_timeout_ms)
            .unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT_MS);
        let tid = self.add_timer(ms, 1, move |lp, _| {
            lp.on_io_timeout(fd, id, TimeoutKind::Keepalive);
        });
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.keepalive_timer = Some(tid);
        }
        Ok(())
    }

    /// Repeating heartbeat. `send` runs every `interval_ms` while the
    /// socket is connected; 0 picks the default interval.
    pub fn set_heartbeat<F>(&mut self, fd: RawFd, interval_ms: u64, send: F) -> Result<()>
    where
        F: Fn(&mut EventLoop, RawFd) + 'static,
    {
        let interval = if interval_ms == 0 {
            DEFAULT_HEARTBEAT_INTERVAL_MS
        } else {
            interval_ms
        };
        let (id, old) = {
            let slot = self.slot_mut(fd)?;
            slot.heartbeat_fn = Some(Rc::new(send));
            (slot.id, slot.heartbeat_timer.take())
        };
        if let Some(tid) = old {
            self.cancel_timer(tid);
        }
        let tid = self.add_timer(interval, REPEAT_UNLIMITED, move |lp, _| {
            let send = match lp.ios.get(fd) {
                Some(s) if s.id == id && s.connected => s.heartbeat_fn.clone(),
                _ => None,
            };
            if let Some(send) = send {
                send(lp, fd);
            }
        });
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.heartbeat_timer = Some(tid);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    pub fn read_start(&mut self, fd: RawFd) -> Result<()> {
        {
            let slot = self.slot_mut(fd)?;
            slot.reading = true;
            if slot.wants_own_readbuf() {
                slot.readbuf.get_or_insert_with(FifoBuffer::new);
            }
        }
        self.io_add_interest(fd, Interest::READ)
    }

    pub fn read_stop(&mut self, fd: RawFd) {
        let Some(slot) = self.ios.get_mut(fd) else {
            return;
        };
        if slot.is_wakeup {
            return;
        }
        slot.reading = false;
        self.io_del_interest(fd, Interest::READ);
    }

    /// Deliver one read callback, then stop.
    pub fn read_once(&mut self, fd: RawFd) -> Result<()> {
        self.slot_mut(fd)?.read_once = true;
        self.read_start(fd)
    }

    /// Deliver exactly `n` buffered bytes, then stop. Satisfied from
    /// already-buffered bytes immediately when possible.
    pub fn read_until_length(&mut self, fd: RawFd, n: usize) -> Result<()> {
        {
            let slot = self.slot_mut(fd)?;
            slot.read_until = ReadUntil::Length(n);
            slot.readbuf.get_or_insert_with(FifoBuffer::new);
        }
        if self.extract_buffered(fd) {
            return Ok(());
        }
        self.read_start(fd)
    }

    /// Deliver bytes through the next `delim`, then stop.
    pub fn read_until_delim(&mut self, fd: RawFd, delim: u8) -> Result<()> {
        {
            let slot = self.slot_mut(fd)?;
            slot.read_until = ReadUntil::Delim(delim);
            slot.readbuf.get_or_insert_with(FifoBuffer::new);
        }
        if self.extract_buffered(fd) {
            return Ok(());
        }
        self.read_start(fd)
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Write or queue `buf`. Returns the bytes sent synchronously; the
    /// write callback reports completion with the full call length.
    pub fn write(&mut self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        let (kind, queue_empty, in_flight) = {
            let slot = self.slot_mut(fd)?;
            if slot.closed || slot.closing {
                return Err(LoopError::Closed);
            }
            (
                slot.kind,
                slot.write_queue.is_empty(),
                slot.connecting && !slot.connected,
            )
        };
        if buf.is_empty() {
            return Ok(0);
        }
        if kind == SockKind::Dgram {
            return self.sendto_dgram(fd, buf);
        }
        let mut nwritten = 0usize;
        if queue_empty && !in_flight {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n < 0 {
                let err = sock::errno();
                if !is_transient(err) {
                    self.fault_close(fd, IoFault::Reset(err));
                    return Err(LoopError::Os(err));
                }
            } else {
                nwritten = n as usize;
            }
            if nwritten == buf.len() {
                let now = self.clock.hrtime_us();
                if let Some(slot) = self.ios.get_mut(fd) {
                    slot.last_write_us = now;
                }
                self.emit_write(fd, buf.len());
                return Ok(nwritten);
            }
        }
        self.enqueue_write(fd, &buf[nwritten..], buf.len())?;
        Ok(nwritten)
    }

    fn sendto_dgram(&mut self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        let peer = self.ios.get(fd).and_then(|s| s.peer_addr);
        let n = match peer {
            Some(addr) => {
                let (ss, len) = sock::sockaddr_from(&addr);
                unsafe {
                    libc::sendto(
                        fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        0,
                        &ss as *const _ as *const libc::sockaddr,
                        len,
                    )
                }
            }
            None => unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) },
        };
        if n < 0 {
            return Err(LoopError::Os(sock::errno()));
        }
        self.emit_write(fd, n as usize);
        Ok(n as usize)
    }

    fn enqueue_write(&mut self, fd: RawFd, remainder: &[u8], total: usize) -> Result<()> {
        let (queued, max) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return Err(LoopError::NoSuchIo(fd));
            };
            slot.write_queue
                .push_back(WriteChunk::new(remainder.to_vec(), total));
            slot.write_bufsize += remainder.len();
            (slot.write_bufsize, slot.max_write_bufsize)
        };
        if queued > max {
            self.fault_close(fd, IoFault::WriteOverflow { queued, max });
            return Err(LoopError::Closed);
        }
        if queued > WRITE_BUFSIZE_HIGH_WATER {
            lwarn!("fd={} write backlog {} bytes past high water", fd, queued);
        }
        self.io_add_interest(fd, Interest::WRITE)
    }

    fn drain_write_queue(&mut self, fd: RawFd) {
        loop {
            let n = {
                let Some(slot) = self.ios.get_mut(fd) else {
                    return;
                };
                let Some(chunk) = slot.write_queue.front() else {
                    break;
                };
                let data = chunk.remaining();
                unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) }
            };
            if n < 0 {
                let err = sock::errno();
                if is_transient(err) {
                    return;
                }
                self.fault_close(fd, IoFault::Reset(err));
                return;
            }
            let n = n as usize;
            let now = self.clock.hrtime_us();
            let completed = {
                let Some(slot) = self.ios.get_mut(fd) else {
                    return;
                };
                slot.write_bufsize -= n;
                slot.last_write_us = now;
                let chunk = match slot.write_queue.front_mut() {
                    Some(c) => c,
                    None => return,
                };
                if chunk.advance(n) {
                    let total = chunk.total_len();
                    slot.write_queue.pop_front();
                    Some(total)
                } else {
                    None
                }
            };
            match completed {
                Some(total) => self.emit_write(fd, total),
                None => return,
            }
        }
        // Queue drained.
        let (connecting, closing, partner) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return;
            };
            (slot.connecting, slot.closing, slot.upstream)
        };
        // WRITE stays armed while a connect completion is owed.
        if !connecting {
            self.io_del_interest(fd, Interest::WRITE);
        }
        if closing {
            self.close_now(fd);
            return;
        }
        // Backpressure release: the peer that was paused while our queue
        // backed up may read again.
        if let Some((pfd, pid)) = partner {
            if self.ios.get(pfd).map(|s| s.id == pid).unwrap_or(false) {
                let _ = self.read_start(pfd);
            }
        }
    }

    fn emit_write(&mut self, fd: RawFd, total: usize) {
        let cb = self.ios.get(fd).and_then(|s| s.write_cb.clone());
        if let Some(cb) = cb {
            cb(self, fd, total);
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Close, flushing queued writes first. Idempotent. The close
    /// callback fires exactly once with the recorded fault.
    pub fn close(&mut self, fd: RawFd) -> Result<()> {
        let defer = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return Ok(());
            };
            if slot.closed {
                return Ok(());
            }
            if slot.closing {
                return Ok(());
            }
            if !slot.write_queue.is_empty() && slot.fault.is_none() {
                slot.closing = true;
                true
            } else {
                false
            }
        };
        if defer {
            self.arm_close_timer(fd);
        } else {
            self.close_now(fd);
        }
        Ok(())
    }

    pub(crate) fn close_now(&mut self, fd: RawFd) {
        let (timers, is_wakeup, partner, close_cb, fault) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return;
            };
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.closing = false;
            slot.connecting = false;
            slot.connected = false;
            slot.reading = false;
            (
                slot.timer_ids(),
                slot.is_wakeup,
                slot.upstream.take(),
                slot.close_cb.take(),
                slot.fault.take(),
            )
        };
        self.io_del_interest(fd, Interest::RDWR);
        for tid in timers.into_iter().flatten() {
            self.cancel_timer(tid);
        }
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.write_queue.clear();
            slot.write_bufsize = 0;
            if let Some(buf) = slot.readbuf.as_mut() {
                buf.clear();
            }
            slot.ready = false;
        }
        if !is_wakeup {
            unsafe { libc::close(fd) };
        }
        if let Some(cb) = close_cb {
            cb(self, fd, fault);
        }
        // A tunnel has no meaning one-sided.
        if let Some((pfd, pid)) = partner {
            if self.ios.get(pfd).map(|s| s.id == pid).unwrap_or(false) {
                if let Some(p) = self.ios.get_mut(pfd) {
                    p.upstream = None;
                }
                let _ = self.close(pfd);
            }
        }
    }

    fn fault_close(&mut self, fd: RawFd, fault: IoFault) {
        if let Some(slot) = self.ios.get_mut(fd) {
            if slot.fault.is_none() {
                slot.fault = Some(fault);
            }
        }
        self.close_now(fd);
    }

    /// A multiplexer reported this fd dead (closed behind our back).
    pub(crate) fn fault_bad_fd(&mut self, fd: RawFd) {
        ldebug!("fd={} invalid in poll set, forcing close", fd);
        self.fault_close(fd, IoFault::Reset(libc::EBADF));
    }

    fn cancel_io_timers(&mut self, fd: RawFd) {
        let timers = match self.ios.get_mut(fd) {
            Some(slot) => {
                let t = slot.timer_ids();
                slot.connect_timer = None;
                slot.close_timer = None;
                slot.read_timer = None;
                slot.write_timer = None;
                slot.keepalive_timer = None;
                slot.heartbeat_timer = None;
                t
            }
            None => return,
        };
        for tid in timers.into_iter().flatten() {
            self.cancel_timer(tid);
        }
    }

    // ------------------------------------------------------------------
    // Upstream tunneling
    // ------------------------------------------------------------------

    /// Link two sockets as a tunnel. Bytes read on either side go to the
    /// partner's write path instead of the read callback; a backed-up
    /// partner pauses the origin until its queue drains. Closing one
    /// side closes the other.
    pub fn pair_upstream(&mut self, a: RawFd, b: RawFd) -> Result<()> {
        let a_id = self.ios.get(a).ok_or(LoopError::NoSuchIo(a))?.id;
        let b_id = self.ios.get(b).ok_or(LoopError::NoSuchIo(b))?.id;
        if let Some(slot) = self.ios.get_mut(a) {
            slot.upstream = Some((b, b_id));
        }
        if let Some(slot) = self.ios.get_mut(b) {
            slot.upstream = Some((a, a_id));
        }
        Ok(())
    }

    /// The live partner fd of a tunneled socket, if any.
    pub fn upstream_partner(&self, fd: RawFd) -> Option<RawFd> {
        let (pfd, pid) = self.ios.get(fd)?.upstream?;
        self.ios.get(pfd).filter(|s| s.id == pid).map(|s| s.fd)
    }

    pub fn unpair_upstream(&mut self, fd: RawFd) {
        let partner = match self.ios.get_mut(fd) {
            Some(slot) => slot.upstream.take(),
            None => return,
        };
        if let Some((pfd, pid)) = partner {
            if let Some(p) = self.ios.get_mut(pfd) {
                if p.id == pid {
                    p.upstream = None;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Readiness dispatch
    // ------------------------------------------------------------------

    pub(crate) fn dispatch_io(&mut self, fd: RawFd, id: u64) -> usize {
        let (revents, is_wakeup, accepting) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return 0;
            };
            if slot.id != id {
                return 0;
            }
            slot.pending = false;
            let r = slot.revents;
            slot.revents = Interest::NONE;
            (r, slot.is_wakeup, slot.accepting)
        };
        if revents.is_empty() {
            return 0;
        }
        let mut ncbs = 0;
        if revents.is_readable() {
            if is_wakeup {
                self.drain_inbox();
            } else if accepting {
                self.handle_accept(fd);
            } else {
                self.do_read(fd);
            }
            ncbs += 1;
        }
        if revents.is_writable() {
            // The read half may have closed this incarnation.
            let connecting = match self.ios.get(fd) {
                Some(s) if s.id == id && !s.closed => s.connecting,
                _ => return ncbs,
            };
            if connecting {
                self.handle_connect_done(fd);
            } else {
                self.drain_write_queue(fd);
            }
            ncbs += 1;
        }
        ncbs
    }

    fn handle_accept(&mut self, listen_fd: RawFd) {
        for _ in 0..ACCEPT_BURST {
            let conn = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if conn < 0 {
                let err = sock::errno();
                if err == libc::EINTR {
                    continue;
                }
                if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                    break;
                }
                self.fault_close(listen_fd, IoFault::Reset(err));
                break;
            }
            sock::set_cloexec(conn);
            if let Err(e) = sock::set_nonblocking(conn) {
                ldebug!("fd={} accept setup failed: {}", conn, e);
                unsafe { libc::close(conn) };
                continue;
            }
            let (accept_cb, decoder) = match self.ios.get(listen_fd) {
                Some(s) => (s.accept_cb.clone(), s.decoder.clone()),
                None => return,
            };
            {
                let slot = self.ios.get_or_ready(conn, SockKind::Stream);
                slot.connected = true;
                slot.local_addr = sock::local_addr(conn);
                slot.peer_addr = sock::peer_addr(conn);
                slot.accept_cb = accept_cb.clone();
                slot.decoder = decoder;
                if slot.decoder.is_some() {
                    slot.readbuf.get_or_insert_with(FifoBuffer::new);
                }
            }
            if let Some(cb) = accept_cb {
                cb(self, conn);
            }
        }
    }

    fn handle_connect_done(&mut self, fd: RawFd) {
        let (id, connect_timer) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return;
            };
            slot.connecting = false;
            (slot.id, slot.connect_timer.take())
        };
        if let Some(tid) = connect_timer {
            self.cancel_timer(tid);
        }
        match sock::peer_addr(fd) {
            Some(peer) => {
                let (cb, queue_empty) = {
                    let Some(slot) = self.ios.get_mut(fd) else {
                        return;
                    };
                    slot.connected = true;
                    slot.peer_addr = Some(peer);
                    slot.local_addr = sock::local_addr(fd);
                    (slot.connect_cb.clone(), slot.write_queue.is_empty())
                };
                if queue_empty {
                    self.io_del_interest(fd, Interest::WRITE);
                }
                if let Some(cb) = cb {
                    cb(self, fd);
                }
                // Flush anything written while the connect was in flight.
                let has_backlog = self
                    .ios
                    .get(fd)
                    .map(|s| s.id == id && !s.closed && !s.write_queue.is_empty())
                    .unwrap_or(false);
                if has_backlog {
                    self.drain_write_queue(fd);
                }
            }
            None => {
                let err = sock::take_socket_error(fd);
                self.fault_close(fd, IoFault::Reset(err));
            }
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    fn do_read(&mut self, fd: RawFd) {
        let (kind, own_buf) = match self.ios.get(fd) {
            Some(s) => (s.kind, s.wants_own_readbuf()),
            None => return,
        };
        if own_buf {
            self.read_into_own_buf(fd);
            return;
        }
        // A per-io buffer wins over the loop scratch; reentrant reads
        // fall back to a throwaway buffer.
        let own = self.ios.get_mut(fd).and_then(|s| s.read_scratch.take());
        let from_slot = own.is_some();
        let mut scratch = match own {
            Some(b) => b,
            None => self
                .scratch
                .take()
                .unwrap_or_else(|| vec![0u8; LOOP_READ_BUFSIZE]),
        };
        let n = match kind {
            SockKind::Dgram => self.recvfrom_dgram(fd, &mut scratch),
            _ => unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) },
        };
        if n > 0 {
            let now = self.clock.hrtime_us();
            if let Some(slot) = self.ios.get_mut(fd) {
                slot.last_read_us = now;
            }
            let n = n as usize;
            self.finish_plain_read(fd, &scratch[..n]);
        } else {
            self.read_error(fd, kind, n);
        }
        if from_slot {
            if let Some(slot) = self.ios.get_mut(fd) {
                if slot.read_scratch.is_none() {
                    slot.read_scratch = Some(scratch);
                }
            }
        } else if self.scratch.is_none() {
            self.scratch = Some(scratch);
        }
    }

    fn recvfrom_dgram(&mut self, fd: RawFd, buf: &mut [u8]) -> isize {
        let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n >= 0 {
            if let Some(peer) = sock::sockaddr_to(&ss) {
                if let Some(slot) = self.ios.get_mut(fd) {
                    slot.peer_addr = Some(peer);
                }
            }
        }
        n
    }

    fn read_error(&mut self, fd: RawFd, kind: SockKind, n: isize) {
        if n == 0 {
            if kind != SockKind::Dgram {
                self.fault_close(fd, IoFault::PeerClosed);
            }
            return;
        }
        let err = sock::errno();
        if is_transient(err) {
            return;
        }
        if kind == SockKind::Dgram {
            // A dgram errno (e.g. ICMP-reflected ECONNREFUSED) is not
            // connection-fatal.
            ldebug!("fd={} dgram recv error {}", fd, err);
            return;
        }
        self.fault_close(fd, IoFault::Reset(err));
    }

    fn finish_plain_read(&mut self, fd: RawFd, data: &[u8]) {
        self.deliver_read(fd, data);
        let once = self
            .ios
            .get(fd)
            .map(|s| s.read_once && !s.closed)
            .unwrap_or(false);
        if once {
            if let Some(slot) = self.ios.get_mut(fd) {
                slot.read_once = false;
            }
            self.read_stop(fd);
        }
    }

    fn read_into_own_buf(&mut self, fd: RawFd) {
        let (kind, n) = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return;
            };
            let kind = slot.kind;
            let max = slot.max_read_bufsize;
            let buf = slot.readbuf.get_or_insert_with(FifoBuffer::new);
            if buf.len() >= max {
                // No room; frame extraction decides whether this is an
                // oversize fault or just a stalled consumer.
                self.extract_buffered(fd);
                return;
            }
            buf.reserve_tail(LOOP_READ_BUFSIZE.min(max - buf.len()));
            let spare = buf.spare();
            let n =
                unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) };
            if n > 0 {
                buf.advance_tail(n as usize);
            }
            (kind, n)
        };
        if n > 0 {
            let now = self.clock.hrtime_us();
            if let Some(slot) = self.ios.get_mut(fd) {
                slot.last_read_us = now;
            }
            self.extract_buffered(fd);
        } else {
            self.read_error(fd, kind, n);
        }
    }

    /// Pull complete frames or the satisfied read-until window out of the
    /// own buffer and deliver them. Returns true when a read-until was
    /// satisfied (and reading stopped).
    fn extract_buffered(&mut self, fd: RawFd) -> bool {
        loop {
            enum Step {
                Deliver(Vec<u8>, bool),
                Fault(oneloop_core::FrameError),
                Done,
            }
            let step = {
                let Some(slot) = self.ios.get_mut(fd) else {
                    return false;
                };
                if slot.closed {
                    return false;
                }
                let until = slot.read_until;
                let decoder = slot.decoder.clone();
                let Some(buf) = slot.readbuf.as_mut() else {
                    return false;
                };
                match until {
                    ReadUntil::Length(n) => {
                        if buf.len() >= n {
                            let out = buf.slice()[..n].to_vec();
                            buf.consume(n);
                            slot.read_until = ReadUntil::None;
                            Step::Deliver(out, true)
                        } else {
                            Step::Done
                        }
                    }
                    ReadUntil::Delim(d) => match buf.slice().iter().position(|&b| b == d) {
                        Some(pos) => {
                            let out = buf.slice()[..=pos].to_vec();
                            buf.consume(pos + 1);
                            slot.read_until = ReadUntil::None;
                            Step::Deliver(out, true)
                        }
                        None => Step::Done,
                    },
                    ReadUntil::None => match decoder {
                        Some(dec) => match dec.frame_len(buf.slice()) {
                            Ok(Some(len)) if buf.len() >= len => {
                                let out = buf.slice()[..len].to_vec();
                                buf.consume(len);
                                Step::Deliver(out, false)
                            }
                            Ok(_) => Step::Done,
                            Err(fe) => Step::Fault(fe),
                        },
                        None => {
                            // Raw buffered delivery (e.g. after attach).
                            if buf.is_empty() {
                                Step::Done
                            } else {
                                Step::Deliver(buf.take_bytes(), false)
                            }
                        }
                    },
                }
            };
            match step {
                Step::Deliver(bytes, satisfied) => {
                    if satisfied {
                        self.read_stop(fd);
                    }
                    self.deliver_read(fd, &bytes);
                    if satisfied {
                        return true;
                    }
                }
                Step::Fault(fe) => {
                    self.fault_close(fd, IoFault::Frame(fe));
                    return false;
                }
                Step::Done => return false,
            }
        }
    }

    fn deliver_read(&mut self, fd: RawFd, data: &[u8]) {
        let partner = self.ios.get(fd).and_then(|s| s.upstream);
        if let Some((pfd, pid)) = partner {
            if self.ios.get(pfd).map(|s| s.id == pid).unwrap_or(false) {
                let _ = self.write(pfd, data);
                let backlog = self
                    .ios
                    .get(pfd)
                    .map(|s| !s.write_queue.is_empty())
                    .unwrap_or(false);
                if backlog {
                    self.read_stop(fd);
                }
                return;
            }
            if let Some(slot) = self.ios.get_mut(fd) {
                slot.upstream = None;
            }
        }
        let cb = self.ios.get(fd).and_then(|s| s.read_cb.clone());
        if let Some(cb) = cb {
            cb(self, fd, data);
        }
    }

    // ------------------------------------------------------------------
    // Io timers
    // ------------------------------------------------------------------

    fn arm_connect_timer(&mut self, fd: RawFd) {
        let (id, ms) = match self.ios.get(fd) {
            Some(s) => (s.id, s.connect_timeout_ms),
            None => return,
        };
        if ms == 0 {
            return;
        }
        let tid = self.add_timer(ms, 1, move |lp, _| {
            lp.on_io_timeout(fd, id, TimeoutKind::Connect);
        });
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.connect_timer = Some(tid);
        }
    }

    fn arm_close_timer(&mut self, fd: RawFd) {
        let (id, ms) = match self.ios.get(fd) {
            Some(s) => (s.id, s.close_timeout_ms),
            None => return,
        };
        if ms == 0 {
            return;
        }
        let tid = self.add_timer(ms, 1, move |lp, _| {
            lp.on_io_timeout(fd, id, TimeoutKind::Close);
        });
        if let Some(slot) = self.ios.get_mut(fd) {
            slot.close_timer = Some(tid);
        }
    }

    fn on_io_timeout(&mut self, fd: RawFd, id: u64, kind: TimeoutKind) {
        let now = self.clock.hrtime_us();
        let decision = {
            let Some(slot) = self.ios.get_mut(fd) else {
                return;
            };
            if slot.id != id || slot.closed {
                return;
            }
            let (last_us, timeout_ms) = match kind {
                TimeoutKind::Connect | TimeoutKind::Close => {
                    slot.fault = Some(IoFault::Timeout(kind));
                    (0, 0)
                }
                TimeoutKind::Read => (slot.last_read_us, slot.read_timeout_ms),
                TimeoutKind::Write => (slot.last_write_us, slot.write_timeout_ms),
                TimeoutKind::Keepalive => (
                    slot.last_read_us.max(slot.last_write_us),
                    slot.keepalive_timeout_ms,
                ),
            };
            if timeout_ms == 0 {
                None
            } else {
                let inactive_ms = now.saturating_sub(last_us) / 1000;
                // Recent traffic re-arms the timer for the remainder.
                if inactive_ms + 100 < timeout_ms {
                    Some(timeout_ms - inactive_ms)
                } else {
                    slot.fault = Some(IoFault::Timeout(kind));
                    None
                }
            }
        };
        match decision {
            Some(remaining_ms) => {
                let tid = self.add_timer(remaining_ms, 1, move |lp, _| {
                    lp.on_io_timeout(fd, id, kind);
                });
                if let Some(slot) = self.ios.get_mut(fd) {
                    match kind {
                        TimeoutKind::Read => slot.read_timer = Some(tid),
                        TimeoutKind::Write => slot.write_timer = Some(tid),
                        TimeoutKind::Keepalive => slot.keepalive_timer = Some(tid),
                        _ => {}
                    }
                }
            }
            None => self.close_now(fd),
        }
    }

    // ------------------------------------------------------------------

    pub fn local_addr(&self, fd: RawFd) -> Option<std::net::SocketAddr> {
        self.ios.get(fd).and_then(|s| s.local_addr)
    }

    pub fn peer_addr(&self, fd: RawFd) -> Option<std::net::SocketAddr> {
        self.ios.get(fd).and_then(|s| s.peer_addr)
    }

    pub fn is_connected(&self, fd: RawFd) -> bool {
        self.ios.get(fd).map(|s| s.connected).unwrap_or(false)
    }

    fn slot_mut(&mut self, fd: RawFd) -> Result<&mut IoSlot> {
        self.ios.get_mut(fd).ok_or(LoopError::NoSuchIo(fd))
    }
}
