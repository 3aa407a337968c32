//! # oneloop-runtime
//!
//! The event loop itself: clock, timer heaps, cron scheduling, priority
//! dispatch, the poller backends, socket io objects and the cross-thread
//! handle. `oneloop-core` holds the platform-agnostic pieces this crate
//! drives.
//!
//! ## Modules
//!
//! - `event_loop` - The loop: run/iterate, timers, idles, dispatch
//! - `nio` - Socket operations: accept, connect, read, write, close
//! - `io` - Io slots, the fd arena, detach/attach
//! - `poller` - select / poll / epoll backends behind one trait
//! - `timers` - Interval and calendar timer heaps
//! - `cron` - Calendar schedule arithmetic
//! - `handle` - Cross-thread posting, stop, write, close
//! - `sock` - Raw socket helpers

#![allow(dead_code)]

mod clock;
pub mod cron;
pub mod event_loop;
pub mod handle;
pub mod io;
mod nio;
mod pending;
pub mod poller;
pub mod sock;
pub mod timers;

pub use cron::CronSchedule;
pub use event_loop::{EventLoop, LoopOptions, LoopStatus};
pub use handle::{IoToken, LoopHandle};
pub use io::{
    DetachedIo, DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_KEEPALIVE_TIMEOUT_MS, LOOP_READ_BUFSIZE,
    MAX_READ_BUFSIZE, MAX_WRITE_BUFSIZE, WRITE_BUFSIZE_HIGH_WATER,
};
pub use poller::{Interest, PollerKind};
pub use sock::SockKind;
pub use timers::TimerId;
