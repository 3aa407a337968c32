//! `select(2)` backend.
//!
//! Portable fallback, fd values below FD_SETSIZE only. The fd_sets are
//! rebuilt per call since select mutates them in place. A closed fd left
//! registered makes select fail with EBADF; the backend then probes every
//! registered fd and reports the dead ones so the loop can fault them.

use std::collections::BTreeSet;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use super::{Interest, Poller, ReadyEvent};

pub struct SelectPoller {
    read_fds: BTreeSet<RawFd>,
    write_fds: BTreeSet<RawFd>,
}

impl SelectPoller {
    pub fn new() -> Self {
        Self {
            read_fds: BTreeSet::new(),
            write_fds: BTreeSet::new(),
        }
    }

    fn fd_alive(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
    }

    /// Drop every registration whose fd no longer exists.
    fn sweep_bad_fds(&mut self, bad: &mut Vec<RawFd>) {
        let all: Vec<RawFd> = self.read_fds.union(&self.write_fds).copied().collect();
        for fd in all {
            if !Self::fd_alive(fd) {
                self.read_fds.remove(&fd);
                self.write_fds.remove(&fd);
                bad.push(fd);
            }
        }
    }
}

impl Poller for SelectPoller {
    fn set(&mut self, fd: RawFd, _prev: Interest, new: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if new.is_readable() {
            self.read_fds.insert(fd);
        } else {
            self.read_fds.remove(&fd);
        }
        if new.is_writable() {
            self.write_fds.insert(fd);
        } else {
            self.write_fds.remove(&fd);
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout_ms: i32,
        events: &mut Vec<ReadyEvent>,
        bad: &mut Vec<RawFd>,
    ) -> io::Result<usize> {
        let mut readset: libc::fd_set = unsafe { mem::zeroed() };
        let mut writeset: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readset);
            libc::FD_ZERO(&mut writeset);
        }
        let mut max_fd: RawFd = -1;
        for &fd in &self.read_fds {
            unsafe { libc::FD_SET(fd, &mut readset) };
            max_fd = max_fd.max(fd);
        }
        for &fd in &self.write_fds {
            unsafe { libc::FD_SET(fd, &mut writeset) };
            max_fd = max_fd.max(fd);
        }

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut readset,
                &mut writeset,
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => return Ok(0),
                Some(libc::EBADF) => {
                    self.sweep_bad_fds(bad);
                    return Ok(0);
                }
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Ok(0);
        }
        let mut delivered = 0;
        for &fd in self.read_fds.union(&self.write_fds) {
            let mut ready = Interest::NONE;
            if unsafe { libc::FD_ISSET(fd, &readset) } {
                ready.insert(Interest::READ);
            }
            if unsafe { libc::FD_ISSET(fd, &writeset) } {
                ready.insert(Interest::WRITE);
            }
            if !ready.is_empty() {
                events.push((fd, ready));
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_read_and_write_readiness() {
        let mut p = SelectPoller::new();
        let (r, w) = pipe();
        p.set(r, Interest::NONE, Interest::READ).unwrap();
        p.set(w, Interest::NONE, Interest::WRITE).unwrap();

        let mut events = Vec::new();
        let mut bad = Vec::new();
        // Empty pipe: only the write side is ready.
        assert_eq!(p.poll(100, &mut events, &mut bad).unwrap(), 1);
        assert_eq!(events[0], (w, Interest::WRITE));

        events.clear();
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        assert_eq!(p.poll(100, &mut events, &mut bad).unwrap(), 2);
        assert!(events.contains(&(r, Interest::READ)));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_bad_fd_is_swept() {
        let mut p = SelectPoller::new();
        let (r, w) = pipe();
        p.set(r, Interest::NONE, Interest::READ).unwrap();
        unsafe {
            libc::close(r);
        }
        let mut events = Vec::new();
        let mut bad = Vec::new();
        assert_eq!(p.poll(0, &mut events, &mut bad).unwrap(), 0);
        assert_eq!(bad, vec![r]);
        // Registration is gone; the next poll is clean.
        bad.clear();
        assert_eq!(p.poll(0, &mut events, &mut bad).unwrap(), 0);
        assert!(bad.is_empty());
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn test_rejects_oversized_fd() {
        let mut p = SelectPoller::new();
        assert!(p
            .set(libc::FD_SETSIZE as RawFd, Interest::NONE, Interest::READ)
            .is_err());
    }
}
