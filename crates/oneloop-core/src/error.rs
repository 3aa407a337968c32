//! Error types shared across the workspace.

use std::fmt;

/// Errors raised while constructing or driving a loop.
#[derive(Debug)]
pub enum LoopError {
    /// Syscall failed with errno.
    Os(i32),
    /// Address did not resolve to any usable socket address.
    AddrResolve(String),
    /// Operation targeted an fd with no registered io slot.
    NoSuchIo(i32),
    /// Operation is not valid for this socket kind.
    BadSocketKind,
    /// Write refused because the io is closed or closing.
    Closed,
    /// The loop has already stopped; posted work was not accepted.
    LoopStopped,
    /// Frame decoder configuration rejected.
    BadFrameConfig(&'static str),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::AddrResolve(host) => write!(f, "address resolution failed: {}", host),
            Self::NoSuchIo(fd) => write!(f, "no io registered for fd {}", fd),
            Self::BadSocketKind => write!(f, "operation not valid for this socket kind"),
            Self::Closed => write!(f, "io is closed"),
            Self::LoopStopped => write!(f, "loop is stopped"),
            Self::BadFrameConfig(why) => write!(f, "bad frame config: {}", why),
        }
    }
}

impl std::error::Error for LoopError {}

pub type Result<T> = std::result::Result<T, LoopError>;

/// Frame decoding failures. These terminate the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or accumulated frame length exceeds the configured cap.
    Oversize { len: usize, max: usize },
    /// Length field decodes to a total shorter than its own header.
    Malformed,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize { len, max } => write!(f, "frame length {} exceeds max {}", len, max),
            Self::Malformed => write!(f, "malformed frame length"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Which per-purpose timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Close,
    Read,
    Write,
    Keepalive,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::Keepalive => "keepalive",
        };
        f.write_str(s)
    }
}

/// Why a connection was closed. Delivered to the close callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFault {
    /// Zero-byte read on a stream socket.
    PeerClosed,
    /// Read/write/connect failed with errno.
    Reset(i32),
    /// A per-purpose timer expired.
    Timeout(TimeoutKind),
    /// Write queue crossed the hard cap.
    WriteOverflow { queued: usize, max: usize },
    /// Frame decoding failed.
    Frame(FrameError),
}

impl fmt::Display for IoFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed connection"),
            Self::Reset(e) => write!(f, "connection error: errno {}", e),
            Self::Timeout(k) => write!(f, "{} timeout", k),
            Self::WriteOverflow { queued, max } => {
                write!(f, "write queue overflow: {} > {}", queued, max)
            }
            Self::Frame(e) => write!(f, "frame error: {}", e),
        }
    }
}

impl std::error::Error for IoFault {}

impl From<FrameError> for IoFault {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}
