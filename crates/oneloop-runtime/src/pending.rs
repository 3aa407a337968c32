//! Priority dispatch queue.
//!
//! Eleven stacks, one per priority level from -5 to +5. Dispatch always
//! pops from the highest non-empty stack, so entries marked during a
//! drain at a higher priority run before anything lower, and entries at
//! the same priority run newest-first.

use std::os::unix::io::RawFd;

use oneloop_core::priority;

/// One queued dispatch reference. Ids guard against recycled storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    Timer(u64),
    Idle(u64),
    Io { fd: RawFd, id: u64 },
}

#[derive(Debug)]
pub(crate) struct PendingQueue {
    stacks: [Vec<Pending>; priority::SLOTS],
    count: usize,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            stacks: Default::default(),
            count: 0,
        }
    }

    pub fn push(&mut self, pri: i8, p: Pending) {
        self.stacks[priority::slot(pri)].push(p);
        self.count += 1;
    }

    /// Pop the newest entry of the highest non-empty stack.
    pub fn pop(&mut self) -> Option<Pending> {
        for stack in self.stacks.iter_mut().rev() {
            if let Some(p) = stack.pop() {
                self.count -= 1;
                return Some(p);
            }
        }
        None
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_pops_first() {
        let mut q = PendingQueue::new();
        q.push(priority::LOW, Pending::Timer(1));
        q.push(priority::HIGH, Pending::Timer(2));
        q.push(priority::NORMAL, Pending::Timer(3));
        assert_eq!(q.pop(), Some(Pending::Timer(2)));
        assert_eq!(q.pop(), Some(Pending::Timer(3)));
        assert_eq!(q.pop(), Some(Pending::Timer(1)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_lifo_within_a_level() {
        let mut q = PendingQueue::new();
        q.push(priority::NORMAL, Pending::Timer(1));
        q.push(priority::NORMAL, Pending::Timer(2));
        assert_eq!(q.pop(), Some(Pending::Timer(2)));
        assert_eq!(q.pop(), Some(Pending::Timer(1)));
    }

    #[test]
    fn test_push_during_drain_wins_when_higher() {
        let mut q = PendingQueue::new();
        q.push(priority::NORMAL, Pending::Timer(1));
        assert_eq!(q.pop(), Some(Pending::Timer(1)));
        // A dispatch marks something urgent mid-drain.
        q.push(priority::HIGHEST, Pending::Idle(9));
        q.push(priority::NORMAL, Pending::Timer(2));
        assert_eq!(q.pop(), Some(Pending::Idle(9)));
        assert_eq!(q.pop(), Some(Pending::Timer(2)));
    }

    #[test]
    fn test_count_tracks_entries() {
        let mut q = PendingQueue::new();
        assert!(q.is_empty());
        q.push(0, Pending::Io { fd: 3, id: 7 });
        q.push(5, Pending::Timer(1));
        assert_eq!(q.len(), 2);
        let _ = q.pop();
        assert_eq!(q.len(), 1);
    }
}
