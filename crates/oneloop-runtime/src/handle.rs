//! Cross-thread access to a running loop.
//!
//! The loop itself is single-threaded and `!Send`. `LoopHandle` is the
//! only surface other threads touch: it pushes boxed tasks onto a lock
//! free queue and kicks the loop's wakeup eventfd. Stop flips the shared
//! status before the kick. Write and close are id-guarded posts so a
//! recycled fd is never acted on by mistake.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use oneloop_core::error::{LoopError, Result};

use crate::event_loop::{EventLoop, LoopStatus};

pub(crate) type PostedTask = Box<dyn FnOnce(&mut EventLoop) + Send>;

pub(crate) struct Inbox {
    pub queue: SegQueue<PostedTask>,
    pub wakeup_fd: AtomicI32,
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            wakeup_fd: AtomicI32::new(-1),
        }
    }

    pub fn wake(&self) {
        let fd = self.wakeup_fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let one: u64 = 1;
        // EAGAIN means the counter is saturated; a wakeup is already due.
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

/// Stable reference to one io incarnation, safe to hold across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoToken {
    pub(crate) fd: RawFd,
    pub(crate) id: u64,
}

impl IoToken {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Cloneable cross-thread handle to a loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) status: Arc<AtomicU8>,
}

impl LoopHandle {
    /// Run a closure on the loop thread during the next iteration.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        if LoopStatus::from_u8(self.status.load(Ordering::Acquire)) == LoopStatus::Stopped {
            return Err(LoopError::LoopStopped);
        }
        self.inbox.queue.push(Box::new(f));
        self.inbox.wake();
        Ok(())
    }

    /// Ask the loop to stop after the current iteration.
    pub fn stop(&self) {
        self.status
            .store(LoopStatus::Stopped as u8, Ordering::Release);
        self.inbox.wake();
    }

    /// Queue bytes on an io from another thread.
    pub fn write(&self, token: IoToken, data: Vec<u8>) -> Result<()> {
        self.post(move |lp| {
            if lp.io_matches(token) {
                let _ = lp.write(token.fd, &data);
            }
        })
    }

    /// Close an io from another thread.
    pub fn close(&self, token: IoToken) -> Result<()> {
        self.post(move |lp| {
            if lp.io_matches(token) {
                let _ = lp.close(token.fd);
            }
        })
    }
}
