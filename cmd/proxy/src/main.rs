//! TCP tunnel example
//!
//! Forwards every accepted connection to a backend address, relaying
//! bytes both ways with backpressure. Usage:
//!
//! `proxy <listen_port> <backend_host> <backend_port>`

use oneloop::{linfo, lwarn, EventLoop};

fn main() -> oneloop::Result<()> {
    let mut args = std::env::args().skip(1);
    let listen_port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(8000);
    let backend_host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let backend_port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(7000);

    let mut lp = EventLoop::with_defaults()?;

    let listen_fd = lp.tcp_server("0.0.0.0", listen_port, move |lp, conn| {
        let up = match lp.tcp_client(&backend_host, backend_port, |lp, up| {
            // Backend connected: relay both directions.
            linfo!("fd={} backend up", up);
            let _ = lp.read_start(up);
            if let Some(origin) = lp.upstream_partner(up) {
                let _ = lp.read_start(origin);
            }
        }) {
            Ok(fd) => fd,
            Err(e) => {
                lwarn!("backend connect failed: {}", e);
                let _ = lp.close(conn);
                return;
            }
        };
        linfo!("fd={} tunneling via backend fd={}", conn, up);
        let _ = lp.pair_upstream(conn, up);
    })?;

    println!(
        "proxy listening on {:?}, backend port {}",
        lp.local_addr(listen_fd),
        backend_port
    );
    lp.run();
    Ok(())
}
