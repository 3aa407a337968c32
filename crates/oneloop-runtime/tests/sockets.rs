//! Socket behavior over real loopback connections, client and server
//! driven by the same loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use oneloop_core::{FrameDecoder, FrameMode, IoFault};
use oneloop_runtime::EventLoop;

/// Stop the loop if a test wedges instead of hanging the suite.
fn failsafe(lp: &mut EventLoop) {
    lp.add_timer(5000, 1, |lp, _| {
        lp.stop();
    });
}

#[test]
fn test_tcp_echo_roundtrip() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let listen = lp
        .tcp_server("127.0.0.1", 0, |lp, conn| {
            lp.set_read_cb(conn, |lp, fd, data| {
                let data = data.to_vec();
                let _ = lp.write(fd, &data);
            })
            .unwrap();
            lp.read_start(conn).unwrap();
        })
        .unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    let cfd = lp
        .tcp_client("127.0.0.1", port, |lp, fd| {
            let _ = lp.write(fd, b"hello oneloop");
            let _ = lp.read_start(fd);
        })
        .unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let r = received.clone();
    lp.set_read_cb(cfd, move |lp, _fd, data| {
        r.borrow_mut().extend_from_slice(data);
        if r.borrow().len() >= 13 {
            lp.stop();
        }
    })
    .unwrap();

    lp.run();
    assert_eq!(received.borrow().as_slice(), b"hello oneloop");
}

#[test]
fn test_peer_close_reports_fault() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let listen = lp
        .tcp_server("127.0.0.1", 0, |lp, conn| {
            let _ = lp.close(conn);
        })
        .unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    let fault = Rc::new(Cell::new(None));
    let cfd = lp
        .tcp_client("127.0.0.1", port, |lp, fd| {
            let _ = lp.read_start(fd);
        })
        .unwrap();
    let f = fault.clone();
    lp.set_close_cb(cfd, move |lp, _fd, why| {
        f.set(why);
        lp.stop();
    })
    .unwrap();

    lp.run();
    assert_eq!(fault.get(), Some(IoFault::PeerClosed));
}

#[test]
fn test_close_callback_fires_once() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let closes = Rc::new(Cell::new(0u32));
    let c = closes.clone();
    let listen = lp
        .tcp_server("127.0.0.1", 0, move |lp, conn| {
            let c = c.clone();
            lp.set_close_cb(conn, move |_, _, _| {
                c.set(c.get() + 1);
            })
            .unwrap();
            let _ = lp.close(conn);
            let _ = lp.close(conn);
        })
        .unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    let cfd = lp
        .tcp_client("127.0.0.1", port, |lp, fd| {
            let _ = lp.read_start(fd);
        })
        .unwrap();
    lp.set_close_cb(cfd, |lp, _, _| {
        lp.stop();
    })
    .unwrap();

    lp.run();
    assert_eq!(closes.get(), 1);
}

#[test]
fn test_write_backpressure_drains_and_completes() {
    const N: usize = 1 << 20;
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let write_done = Rc::new(Cell::new(0usize));
    let wd = write_done.clone();
    let listen = lp
        .tcp_server("127.0.0.1", 0, move |lp, conn| {
            let wd = wd.clone();
            lp.set_write_cb(conn, move |_, _, total| {
                wd.set(wd.get() + total);
            })
            .unwrap();
            let payload = vec![0x5Au8; N];
            let _ = lp.write(conn, &payload);
        })
        .unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    let read_total = Rc::new(Cell::new(0usize));
    let rt = read_total.clone();
    let cfd = lp
        .tcp_client("127.0.0.1", port, |lp, fd| {
            let _ = lp.read_start(fd);
        })
        .unwrap();
    lp.set_read_cb(cfd, move |lp, _fd, data| {
        rt.set(rt.get() + data.len());
        if rt.get() >= N {
            lp.stop();
        }
    })
    .unwrap();

    lp.run();
    assert_eq!(read_total.get(), N);
    // One write call, one completion, full original length.
    assert_eq!(write_done.get(), N);
}

#[test]
fn test_delimiter_framing_across_writes() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let frames: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let fr = frames.clone();
    let listen = lp
        .tcp_server("127.0.0.1", 0, move |lp, conn| {
            let fr = fr.clone();
            lp.set_read_cb(conn, move |lp, _fd, data| {
                fr.borrow_mut().push(data.to_vec());
                if fr.borrow().len() == 3 {
                    lp.stop();
                }
            })
            .unwrap();
            lp.read_start(conn).unwrap();
        })
        .unwrap();
    let dec = FrameDecoder::with_default_max(FrameMode::delimiter(b"\n").unwrap()).unwrap();
    lp.set_frame_decoder(listen, dec).unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    lp.tcp_client("127.0.0.1", port, |lp, fd| {
        // Two full frames plus the head of a third.
        let _ = lp.write(fd, b"PING\nPONG\nPA");
        lp.add_timer(30, 1, move |lp, _| {
            let _ = lp.write(fd, b"R\n");
        });
    })
    .unwrap();

    lp.run();
    let frames = frames.borrow();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], b"PING\n");
    assert_eq!(frames[1], b"PONG\n");
    assert_eq!(frames[2], b"PAR\n");
}

#[test]
fn test_read_until_length_is_one_shot() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let listen = lp
        .tcp_server("127.0.0.1", 0, |lp, conn| {
            let _ = lp.write(conn, b"helloworld");
        })
        .unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    let chunks: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let cfd = lp
        .tcp_client("127.0.0.1", port, |lp, fd| {
            let _ = lp.read_until_length(fd, 5);
        })
        .unwrap();
    let ch = chunks.clone();
    lp.set_read_cb(cfd, move |lp, fd, data| {
        ch.borrow_mut().push(data.to_vec());
        if ch.borrow().len() == 1 {
            // Second window satisfied from the already-buffered tail.
            let _ = lp.read_until_length(fd, 5);
        } else {
            lp.stop();
        }
    })
    .unwrap();

    lp.run();
    let chunks = chunks.borrow();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0], b"hello");
    assert_eq!(chunks[1], b"world");
}

#[test]
fn test_upstream_tunnel_relays_both_ways() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    // Plain echo backend.
    let backend = lp
        .tcp_server("127.0.0.1", 0, |lp, conn| {
            lp.set_read_cb(conn, |lp, fd, data| {
                let data = data.to_vec();
                let _ = lp.write(fd, &data);
            })
            .unwrap();
            lp.read_start(conn).unwrap();
        })
        .unwrap();
    let backend_port = lp.local_addr(backend).unwrap().port();

    // Tunnel front door.
    let front = lp
        .tcp_server("127.0.0.1", 0, move |lp, conn| {
            let up = lp
                .tcp_client("127.0.0.1", backend_port, |lp, up| {
                    let _ = lp.read_start(up);
                    if let Some(origin) = lp.upstream_partner(up) {
                        let _ = lp.read_start(origin);
                    }
                })
                .unwrap();
            lp.pair_upstream(conn, up).unwrap();
        })
        .unwrap();
    let front_port = lp.local_addr(front).unwrap().port();

    let received = Rc::new(RefCell::new(Vec::new()));
    let cfd = lp
        .tcp_client("127.0.0.1", front_port, |lp, fd| {
            let _ = lp.write(fd, b"tunnel me");
            let _ = lp.read_start(fd);
        })
        .unwrap();
    let r = received.clone();
    lp.set_read_cb(cfd, move |lp, _fd, data| {
        r.borrow_mut().extend_from_slice(data);
        if r.borrow().len() >= 9 {
            lp.stop();
        }
    })
    .unwrap();

    lp.run();
    assert_eq!(received.borrow().as_slice(), b"tunnel me");
}

#[test]
fn test_adopted_fd_reads_and_writes() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let mut fds = [0; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (a, b) = (fds[0], fds[1]);

    lp.adopt_fd(a).unwrap();
    lp.adopt_fd(b).unwrap();
    // Adopting twice is a no-op get.
    assert_eq!(lp.adopt_fd(b).unwrap(), b);

    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    lp.set_read_cb(b, move |lp, _fd, data| {
        g.borrow_mut().extend_from_slice(data);
        lp.stop();
    })
    .unwrap();
    lp.read_start(b).unwrap();
    lp.write(a, b"adopted").unwrap();

    lp.run();
    assert_eq!(got.borrow().as_slice(), b"adopted");
}

#[test]
fn test_custom_read_buffer_caps_chunk_size() {
    const N: usize = 64;
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let listen = lp
        .tcp_server("127.0.0.1", 0, |lp, conn| {
            let _ = lp.write(conn, &[0x42u8; N]);
        })
        .unwrap();
    let port = lp.local_addr(listen).unwrap().port();

    let chunks: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let cfd = lp
        .tcp_client("127.0.0.1", port, |lp, fd| {
            lp.set_read_buffer(fd, Some(vec![0u8; 4])).unwrap();
            let _ = lp.read_start(fd);
        })
        .unwrap();
    let ch = chunks.clone();
    lp.set_read_cb(cfd, move |lp, _fd, data| {
        ch.borrow_mut().push(data.len());
        if ch.borrow().iter().sum::<usize>() >= N {
            lp.stop();
        }
    })
    .unwrap();

    lp.run();
    assert!(chunks.borrow().iter().all(|&n| n <= 4));
    assert_eq!(chunks.borrow().iter().sum::<usize>(), N);
}

#[test]
fn test_udp_echo() {
    let mut lp = EventLoop::with_defaults().unwrap();
    failsafe(&mut lp);

    let sfd = lp.udp_server("127.0.0.1", 0).unwrap();
    let port = lp.local_addr(sfd).unwrap().port();
    lp.set_read_cb(sfd, |lp, fd, data| {
        let data = data.to_vec();
        let _ = lp.write(fd, &data);
    })
    .unwrap();
    lp.read_start(sfd).unwrap();

    let cfd = lp.udp_client("127.0.0.1", port).unwrap();
    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    lp.set_read_cb(cfd, move |lp, _fd, data| {
        g.borrow_mut().extend_from_slice(data);
        lp.stop();
    })
    .unwrap();
    lp.read_start(cfd).unwrap();
    lp.write(cfd, b"ping").unwrap();

    lp.run();
    assert_eq!(got.borrow().as_slice(), b"ping");
}

#[test]
fn test_detach_attach_preserves_identity() {
    let mut lp = EventLoop::with_defaults().unwrap();
    let fd = lp.udp_client("127.0.0.1", 9).unwrap();
    let peer = lp.peer_addr(fd);

    let detached = lp.detach(fd).unwrap();
    assert!(lp.peer_addr(fd).is_none());
    assert_eq!(detached.fd(), fd);

    let mut other = EventLoop::with_defaults().unwrap();
    let fd2 = other.attach(detached).unwrap();
    assert_eq!(fd2, fd);
    assert!(other.is_connected(fd2));
    assert_eq!(other.peer_addr(fd2), peer);
    // The detached fd left the first loop's arena, so dropping that loop
    // must not close it out from under the second.
    drop(lp);
    let _ = other.close(fd2);
}
