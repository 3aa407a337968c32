//! TCP echo server example
//!
//! Echoes every received line back to the sender. Try it with netcat:
//! `nc 127.0.0.1 7000`.
//!
//! # Environment Variables
//!
//! - `ONELOOP_FLUSH_LOG=1` - Flush debug output immediately
//! - `ONELOOP_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use oneloop::{linfo, EventLoop};

// ONELOOP_LOG_LEVEL=info cargo run -p oneloop-echo -- 7000
fn main() -> oneloop::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(7000);

    let mut lp = EventLoop::with_defaults()?;

    let listen_fd = lp.tcp_server("0.0.0.0", port, |lp, conn| {
        linfo!("fd={} connected from {:?}", conn, lp.peer_addr(conn));
        lp.set_read_cb(conn, |lp, fd, data| {
            let data = data.to_vec();
            let _ = lp.write(fd, &data);
        })
        .ok();
        lp.set_close_cb(conn, |_lp, fd, fault| {
            linfo!("fd={} closed ({:?})", fd, fault);
        })
        .ok();
        lp.set_keepalive_timeout(conn, 0).ok();
        lp.read_start(conn).ok();
    })?;

    println!("echo server listening on {:?}", lp.local_addr(listen_fd));
    lp.run();
    Ok(())
}
