//! Timer and idle behavior through a running loop.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use oneloop_runtime::{EventLoop, LoopOptions};

fn idle_out_loop() -> EventLoop {
    EventLoop::new(LoopOptions {
        quit_when_idle: true,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_repeating_timer_fires_repeat_times() {
    let mut lp = idle_out_loop();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    lp.add_timer(10, 3, move |_, _| {
        c.set(c.get() + 1);
    });
    lp.run();
    assert_eq!(count.get(), 3);
}

#[test]
fn test_cancelled_timer_never_fires() {
    let mut lp = idle_out_loop();
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    let tid = lp.add_timer(10, 1, move |_, _| {
        f.set(true);
    });
    lp.cancel_timer(tid);
    // Something else keeps the loop alive past the cancelled deadline.
    lp.add_timer(40, 1, |_, _| {});
    lp.run();
    assert!(!fired.get());
}

#[test]
fn test_cancel_from_own_callback() {
    let mut lp = idle_out_loop();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    lp.add_timer(5, oneloop_core::REPEAT_UNLIMITED, move |lp, tid| {
        c.set(c.get() + 1);
        if c.get() == 2 {
            lp.cancel_timer(tid);
        }
    });
    lp.run();
    assert_eq!(count.get(), 2);
}

#[test]
fn test_reset_extends_deadline() {
    let mut lp = idle_out_loop();
    let fired_at = Rc::new(Cell::new(0u64));
    let f = fired_at.clone();
    let tid = lp.add_timer(10, 1, move |lp, _| {
        f.set(lp.now_hrtime_us());
    });
    lp.reset_timer(tid, Some(60));
    let start = Instant::now();
    lp.run();
    assert!(fired_at.get() > 0);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_idle_runs_when_nothing_pends() {
    let mut lp = idle_out_loop();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    lp.add_idle(2, move |_, _| {
        c.set(c.get() + 1);
    });
    lp.run();
    assert_eq!(count.get(), 2);
}

#[test]
fn test_timer_chain_keeps_loop_alive() {
    let mut lp = idle_out_loop();
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    let o = order.clone();
    lp.add_timer(10, 1, move |lp, _| {
        o.borrow_mut().push("first");
        let o2 = o.clone();
        lp.add_timer(10, 1, move |_, _| {
            o2.borrow_mut().push("second");
        });
    });
    lp.run();
    assert_eq!(*order.borrow(), vec!["first", "second"]);
}

#[test]
fn test_wall_clock_queries_agree() {
    let lp = EventLoop::with_defaults().unwrap();
    let secs = lp.now();
    let ms = lp.now_ms();
    let us = lp.now_us();
    // After 2020-01-01.
    assert!(secs > 1_577_836_800);
    assert!((ms / 1000) as i64 >= secs - 1);
    assert!(us / 1000 >= ms.saturating_sub(1000));
}

#[test]
fn test_run_once_does_one_iteration() {
    let mut lp = EventLoop::new(LoopOptions {
        run_once: true,
        ..Default::default()
    })
    .unwrap();
    let start = Instant::now();
    lp.run();
    assert_eq!(lp.loop_count(), 1);
    // One iteration blocks at most ~100 ms.
    assert!(start.elapsed() < Duration::from_secs(1));
}
