//! Raw socket helpers.
//!
//! Thin libc wrappers shared by the io layer: socket creation, address
//! conversion between `std::net::SocketAddr` and `sockaddr_storage`,
//! option setting and the getsockname/getpeername probes.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::RawFd;

use oneloop_core::error::{LoopError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Dgram,
    /// Pipes, eventfds, anything that is not a socket.
    Other,
}

pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| LoopError::AddrResolve(format!("{}:{}", host, port)))
}

pub(crate) fn socket(addr: &SocketAddr, ty: libc::c_int) -> Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, ty, 0) };
    if fd < 0 {
        return Err(LoopError::Os(errno()));
    }
    set_cloexec(fd);
    Ok(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(LoopError::Os(errno()));
        }
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(LoopError::Os(errno()));
    }
    Ok(())
}

/// SO_TYPE probe; non-sockets come back as `Other`.
pub(crate) fn socket_kind(fd: RawFd) -> SockKind {
    let mut ty: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut ty as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return SockKind::Other;
    }
    match ty {
        libc::SOCK_STREAM => SockKind::Stream,
        libc::SOCK_DGRAM => SockKind::Dgram,
        _ => SockKind::Other,
    }
}

/// Pending socket error, consumed.
pub(crate) fn take_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        errno()
    } else {
        err
    }
}

pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (ss, len as libc::socklen_t)
}

pub(crate) fn sockaddr_to(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (ss, len) = sockaddr_from(addr);
    let rc = unsafe { libc::bind(fd, &ss as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        return Err(LoopError::Os(errno()));
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(LoopError::Os(errno()));
    }
    Ok(())
}

/// Raw nonblocking connect; the caller interprets errno.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> libc::c_int {
    let (ss, len) = sockaddr_from(addr);
    unsafe { libc::connect(fd, &ss as *const _ as *const libc::sockaddr, len) }
}

pub(crate) fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return None;
    }
    sockaddr_to(&ss)
}

pub(crate) fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getpeername(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return None;
    }
    sockaddr_to(&ss)
}

/// SIGPIPE turns broken-pipe writes into EPIPE returns. Once per process.
pub(crate) fn ignore_sigpipe() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    });
}
