//! Linux `epoll` backend.

use std::io;
use std::os::unix::io::RawFd;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use super::{Interest, Poller, ReadyEvent};

pub struct EpollPoller {
    epfd: RawFd,
    events: Vec<epoll_event>,
    nregistered: usize,
}

fn epoll_flags(interest: Interest) -> u32 {
    let mut flags = 0;
    if interest.is_readable() {
        flags |= EPOLLIN;
    }
    if interest.is_writable() {
        flags |= EPOLLOUT;
    }
    flags as u32
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            events: Vec::with_capacity(64),
            nregistered: 0,
        })
    }
}

impl Poller for EpollPoller {
    fn set(&mut self, fd: RawFd, prev: Interest, new: Interest) -> io::Result<()> {
        let op = match (prev.is_empty(), new.is_empty()) {
            (true, true) => return Ok(()),
            (true, false) => EPOLL_CTL_ADD,
            (false, false) => EPOLL_CTL_MOD,
            (false, true) => EPOLL_CTL_DEL,
        };
        let mut ev = epoll_event {
            events: epoll_flags(new),
            u64: fd as u64,
        };
        let rc = unsafe { epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        match op {
            EPOLL_CTL_ADD => self.nregistered += 1,
            EPOLL_CTL_DEL => self.nregistered = self.nregistered.saturating_sub(1),
            _ => {}
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout_ms: i32,
        events: &mut Vec<ReadyEvent>,
        _bad: &mut Vec<RawFd>,
    ) -> io::Result<usize> {
        let want = self.nregistered.max(64);
        if self.events.capacity() < want {
            self.events.reserve(want - self.events.len());
        }
        let n = unsafe {
            epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        unsafe {
            self.events.set_len(n as usize);
        }
        for ev in &self.events {
            let mut ready = Interest::NONE;
            if ev.events & (EPOLLIN | EPOLLHUP | EPOLLERR) as u32 != 0 {
                ready.insert(Interest::READ);
            }
            if ev.events & (EPOLLOUT | EPOLLHUP | EPOLLERR) as u32 != 0 {
                ready.insert(Interest::WRITE);
            }
            if !ready.is_empty() {
                events.push((ev.u64 as RawFd, ready));
            }
        }
        Ok(n as usize)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_read_readiness() {
        let mut p = EpollPoller::new().unwrap();
        let (r, w) = pipe();
        p.set(r, Interest::NONE, Interest::READ).unwrap();

        let mut events = Vec::new();
        let mut bad = Vec::new();
        let n = p.poll(0, &mut events, &mut bad).unwrap();
        assert_eq!(n, 0);

        let rc = unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        assert_eq!(rc, 1);
        let n = p.poll(100, &mut events, &mut bad).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].0, r);
        assert!(events[0].1.is_readable());

        p.set(r, Interest::READ, Interest::NONE).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_mod_to_write_interest() {
        let mut p = EpollPoller::new().unwrap();
        let (r, w) = pipe();
        p.set(w, Interest::NONE, Interest::READ).unwrap();
        p.set(w, Interest::READ, Interest::WRITE).unwrap();

        let mut events = Vec::new();
        let mut bad = Vec::new();
        let n = p.poll(100, &mut events, &mut bad).unwrap();
        assert_eq!(n, 1);
        assert!(events[0].1.is_writable());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
