//! Timer storage: two binary min-heaps over one entry map.
//!
//! Interval timers key on the loop's monotonic clock, calendar timers on
//! wall time. Heap entries are `(deadline, id)` pairs and are never
//! removed eagerly; a popped key is valid only while the entry still
//! exists, is not destroy-marked, and still carries that deadline. Stale
//! keys are skipped, which makes cancel and reschedule O(1).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use oneloop_core::{id, REPEAT_UNLIMITED};

use crate::cron::CronSchedule;
use crate::event_loop::EventLoop;

pub type TimerId = u64;

pub(crate) type TimerCb = Box<dyn FnMut(&mut EventLoop, TimerId)>;

#[derive(Debug, Clone)]
pub(crate) enum TimerKind {
    Interval { interval_ms: u64 },
    Calendar { sched: CronSchedule },
}

pub(crate) struct TimerEntry {
    pub id: TimerId,
    pub kind: TimerKind,
    pub repeat: u32,
    /// Monotonic us for interval timers, wall us for calendar timers.
    pub next_timeout_us: u64,
    pub priority: i8,
    pub active: bool,
    pub pending: bool,
    pub destroy: bool,
    pub cb: Option<TimerCb>,
}

#[derive(Default)]
pub(crate) struct Timers {
    pub entries: HashMap<TimerId, TimerEntry>,
    monotonic: BinaryHeap<Reverse<(u64, TimerId)>>,
    realtime: BinaryHeap<Reverse<(u64, TimerId)>>,
}

/// Intervals of at least a second on a 100 ms grid share deadlines, so
/// many coarse timers wake the loop together instead of in a spray.
fn coalesce(next_us: u64, interval_ms: u64) -> u64 {
    if interval_ms >= 1000 && interval_ms % 100 == 0 {
        next_us / 100_000 * 100_000
    } else {
        next_us
    }
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add_interval(
        &mut self,
        now_hr_us: u64,
        interval_ms: u64,
        repeat: u32,
        priority: i8,
        cb: TimerCb,
    ) -> TimerId {
        let tid = id::next_event_id();
        let next = coalesce(now_hr_us + interval_ms * 1000, interval_ms);
        self.entries.insert(
            tid,
            TimerEntry {
                id: tid,
                kind: TimerKind::Interval { interval_ms },
                repeat,
                next_timeout_us: next,
                priority,
                active: true,
                pending: false,
                destroy: false,
                cb: Some(cb),
            },
        );
        self.monotonic.push(Reverse((next, tid)));
        tid
    }

    pub fn add_calendar(
        &mut self,
        now_wall_secs: i64,
        sched: CronSchedule,
        repeat: u32,
        priority: i8,
        cb: TimerCb,
    ) -> TimerId {
        let tid = id::next_event_id();
        let next = sched.next_after(now_wall_secs) as u64 * 1_000_000;
        self.entries.insert(
            tid,
            TimerEntry {
                id: tid,
                kind: TimerKind::Calendar { sched },
                repeat,
                next_timeout_us: next,
                priority,
                active: true,
                pending: false,
                destroy: false,
                cb: Some(cb),
            },
        );
        self.realtime.push(Reverse((next, tid)));
        tid
    }

    /// Revive and reschedule an interval timer. No-op for calendar timers
    /// and cancelled ids.
    pub fn reset(&mut self, tid: TimerId, now_hr_us: u64, new_interval_ms: Option<u64>) -> bool {
        let Some(entry) = self.entries.get_mut(&tid) else {
            return false;
        };
        if !entry.active {
            return false;
        }
        let interval_ms = match &mut entry.kind {
            TimerKind::Interval { interval_ms } => {
                if let Some(ms) = new_interval_ms {
                    *interval_ms = ms;
                }
                *interval_ms
            }
            TimerKind::Calendar { .. } => return false,
        };
        entry.destroy = false;
        if entry.repeat == 0 {
            entry.repeat = 1;
        }
        entry.next_timeout_us = coalesce(now_hr_us + interval_ms * 1000, interval_ms);
        self.monotonic.push(Reverse((entry.next_timeout_us, tid)));
        true
    }

    /// Destroy-mark an entry. Returns (was_active, is_pending); the
    /// caller frees immediately when not pending.
    pub fn cancel(&mut self, tid: TimerId) -> Option<(bool, bool)> {
        let entry = self.entries.get_mut(&tid)?;
        if entry.destroy && !entry.active {
            return None;
        }
        let was_active = entry.active;
        entry.active = false;
        entry.destroy = true;
        Some((was_active, entry.pending))
    }

    pub fn remove(&mut self, tid: TimerId) -> Option<TimerEntry> {
        self.entries.remove(&tid)
    }

    /// Earliest live monotonic deadline; pops stale heap keys.
    pub fn next_monotonic_deadline(&mut self) -> Option<u64> {
        Self::next_deadline(&mut self.monotonic, &self.entries)
    }

    /// Earliest live wall deadline; pops stale heap keys.
    pub fn next_realtime_deadline(&mut self) -> Option<u64> {
        Self::next_deadline(&mut self.realtime, &self.entries)
    }

    fn next_deadline(
        heap: &mut BinaryHeap<Reverse<(u64, TimerId)>>,
        entries: &HashMap<TimerId, TimerEntry>,
    ) -> Option<u64> {
        while let Some(&Reverse((due, tid))) = heap.peek() {
            match entries.get(&tid) {
                Some(e) if !e.destroy && e.next_timeout_us == due => return Some(due),
                _ => {
                    heap.pop();
                }
            }
        }
        None
    }

    /// Pop every due entry, advance repeats and deadlines, and return the
    /// ids to mark pending with their priorities.
    pub fn pop_due(&mut self, now_hr_us: u64, now_wall_us: u64) -> Vec<(TimerId, i8)> {
        let mut due = Vec::new();
        Self::pop_due_heap(&mut self.monotonic, &mut self.entries, now_hr_us, &mut due);
        Self::pop_due_heap(&mut self.realtime, &mut self.entries, now_wall_us, &mut due);
        due
    }

    fn pop_due_heap(
        heap: &mut BinaryHeap<Reverse<(u64, TimerId)>>,
        entries: &mut HashMap<TimerId, TimerEntry>,
        now_us: u64,
        due: &mut Vec<(TimerId, i8)>,
    ) {
        while let Some(&Reverse((deadline, tid))) = heap.peek() {
            let entry = match entries.get_mut(&tid) {
                Some(e) if !e.destroy && e.next_timeout_us == deadline => e,
                _ => {
                    heap.pop();
                    continue;
                }
            };
            if deadline > now_us {
                break;
            }
            heap.pop();
            if entry.repeat != REPEAT_UNLIMITED {
                entry.repeat -= 1;
            }
            if entry.repeat == 0 {
                // Last firing; freed after its dispatch.
                entry.destroy = true;
            } else {
                match &entry.kind {
                    TimerKind::Interval { interval_ms } => {
                        let step = (*interval_ms * 1000).max(1);
                        // Catch up over missed ticks.
                        while entry.next_timeout_us <= now_us {
                            entry.next_timeout_us += step;
                        }
                    }
                    TimerKind::Calendar { sched } => {
                        let now_secs = (now_us / 1_000_000) as i64;
                        entry.next_timeout_us = sched.next_after(now_secs) as u64 * 1_000_000;
                    }
                }
                heap.push(Reverse((entry.next_timeout_us, tid)));
            }
            due.push((tid, entry.priority));
        }
    }
}
