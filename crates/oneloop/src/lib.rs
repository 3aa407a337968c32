//! # oneloop - Embeddable Event Loop
//!
//! Single-threaded, non-blocking I/O event loop for Rust.
//!
//! ## Features
//!
//! - **One loop per thread**: no shared state, no locks on the hot path;
//!   other threads reach in through a `LoopHandle`
//! - **Pluggable multiplexer**: epoll (linux default), poll, select
//! - **Two timer heaps**: monotonic interval timers and wall-clock
//!   calendar timers (minutely/hourly/daily/weekly/monthly)
//! - **Priority dispatch**: 11 levels, highest first, LIFO within a level
//! - **Socket state machine**: accept burst, async connect with
//!   verification, buffered writes with backpressure, deferred close
//! - **Framing**: fixed-length, delimiter, and length-field (varint /
//!   little-endian / big-endian) frame extraction
//! - **Tunneling**: symmetric upstream pairing with backpressure pause
//!
//! ## Quick Start
//!
//! ```ignore
//! use oneloop::EventLoop;
//!
//! fn main() -> oneloop::Result<()> {
//!     let mut lp = EventLoop::with_defaults()?;
//!
//!     let listen_fd = lp.tcp_server("0.0.0.0", 7000, |lp, conn| {
//!         lp.set_read_cb(conn, |lp, fd, data| {
//!             let data = data.to_vec();
//!             let _ = lp.write(fd, &data);
//!         }).ok();
//!         lp.read_start(conn).ok();
//!     })?;
//!
//!     println!("echo server on {:?}", lp.local_addr(listen_fd));
//!     lp.run();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       User Code                             │
//! │     tcp_server(), write(), add_timer(), LoopHandle::post    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EventLoop                             │
//! │   clock → timers → idles → pending stacks (11 priorities)   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Poller   │      │  IoArena  │      │  Timers   │
//!    │ epoll/... │      │ fd slots  │      │ two heaps │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use oneloop_core::{
    DelayPolicy, FifoBuffer, FrameDecoder, FrameError, FrameMode, IoFault, LengthCoding,
    LoopError, ReconnectPolicy, Result, TimeoutKind, REPEAT_UNLIMITED,
};
pub use oneloop_core::priority;

// Re-export lprint macros for debug logging
pub use oneloop_core::{ldebug, lerror, linfo, ltrace, lwarn};
pub use oneloop_core::lprint::{
    init as init_logging, set_flush_enabled, set_log_level, LogLevel,
};

// Re-export runtime types
pub use oneloop_runtime::{
    CronSchedule, DetachedIo, EventLoop, Interest, IoToken, LoopHandle, LoopOptions, LoopStatus,
    PollerKind, SockKind, TimerId,
};
pub use oneloop_runtime::{
    DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_KEEPALIVE_TIMEOUT_MS, MAX_WRITE_BUFSIZE, WRITE_BUFSIZE_HIGH_WATER,
};
