//! `poll(2)` backend.
//!
//! Registrations live in one dense `pollfd` array. Deletion swap-removes
//! and a fd-to-index map is patched for the entry that moved.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

use super::{Interest, Poller, ReadyEvent};

pub struct PollPoller {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

fn poll_events(interest: Interest) -> i16 {
    let mut ev = 0;
    if interest.is_readable() {
        ev |= POLLIN;
    }
    if interest.is_writable() {
        ev |= POLLOUT;
    }
    ev
}

impl PollPoller {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn remove(&mut self, fd: RawFd) {
        let Some(i) = self.index.remove(&fd) else {
            return;
        };
        self.fds.swap_remove(i);
        if i < self.fds.len() {
            let moved = self.fds[i].fd;
            self.index.insert(moved, i);
        }
    }
}

impl Poller for PollPoller {
    fn set(&mut self, fd: RawFd, _prev: Interest, new: Interest) -> io::Result<()> {
        if new.is_empty() {
            self.remove(fd);
            return Ok(());
        }
        match self.index.get(&fd) {
            Some(&i) => self.fds[i].events = poll_events(new),
            None => {
                self.index.insert(fd, self.fds.len());
                self.fds.push(libc::pollfd {
                    fd,
                    events: poll_events(new),
                    revents: 0,
                });
            }
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout_ms: i32,
        events: &mut Vec<ReadyEvent>,
        _bad: &mut Vec<RawFd>,
    ) -> io::Result<usize> {
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
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
        if n == 0 {
            return Ok(0);
        }
        let mut seen = 0;
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let mut ready = Interest::NONE;
            if pfd.revents & (POLLIN | POLLHUP | POLLERR | POLLNVAL) != 0 {
                ready.insert(Interest::READ);
            }
            if pfd.revents & (POLLOUT | POLLHUP | POLLERR) != 0 {
                ready.insert(Interest::WRITE);
            }
            if !ready.is_empty() {
                events.push((pfd.fd, ready));
            }
            seen += 1;
            if seen == n {
                break;
            }
        }
        Ok(n as usize)
    }
}
