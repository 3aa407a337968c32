//! Readiness multiplexer backends.
//!
//! One trait, three implementations: `select` (portable, fd < 1024),
//! `poll` (dense array), `epoll` (linux, the default there). The loop
//! talks to a boxed trait object and never sees backend details.

use std::io;
use std::os::unix::io::RawFd;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll_backend;
    }
}
pub mod poll_backend;
pub mod select_backend;

/// Readiness interest bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const RDWR: Interest = Interest(0b11);

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.intersects(Self::READ)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }
}

/// One delivered readiness event.
pub type ReadyEvent = (RawFd, Interest);

/// A pluggable multiplexer.
///
/// `set` moves an fd from interest `prev` to interest `new`; an empty
/// `new` deregisters it. `poll` blocks up to `timeout_ms` (0 returns
/// immediately) and appends merged per-fd readiness to `events`. Backends
/// that can detect a stale registration (select on EBADF) report those
/// fds through `bad` instead of failing the whole call; EINTR is an
/// empty success.
pub trait Poller {
    fn set(&mut self, fd: RawFd, prev: Interest, new: Interest) -> io::Result<()>;

    fn poll(
        &mut self,
        timeout_ms: i32,
        events: &mut Vec<ReadyEvent>,
        bad: &mut Vec<RawFd>,
    ) -> io::Result<usize>;
}

/// Backend selector for loop construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    Select,
    Poll,
    #[cfg(target_os = "linux")]
    Epoll,
}

impl Default for PollerKind {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                PollerKind::Epoll
            } else {
                PollerKind::Poll
            }
        }
    }
}

pub(crate) fn new_poller(kind: PollerKind) -> io::Result<Box<dyn Poller>> {
    match kind {
        PollerKind::Select => Ok(Box::new(select_backend::SelectPoller::new())),
        PollerKind::Poll => Ok(Box::new(poll_backend::PollPoller::new())),
        #[cfg(target_os = "linux")]
        PollerKind::Epoll => Ok(Box::new(epoll_backend::EpollPoller::new()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bit_ops() {
        let mut i = Interest::NONE;
        assert!(i.is_empty());
        i.insert(Interest::READ);
        assert!(i.is_readable());
        assert!(!i.is_writable());
        i.insert(Interest::WRITE);
        assert_eq!(i, Interest::RDWR);
        i.remove(Interest::READ);
        assert_eq!(i, Interest::WRITE);
        assert!(Interest::RDWR.contains(Interest::READ));
        assert!(!Interest::READ.contains(Interest::RDWR));
    }
}
