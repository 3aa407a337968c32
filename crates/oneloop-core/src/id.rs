//! Monotonic id generators.
//!
//! Every loop event (timer, idle, io incarnation) gets a 64-bit id from a
//! process-wide counter. Ids are never reused, which lets dispatch code
//! detect stale references to a recycled fd slot.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next event id. Never returns 0.
#[inline]
pub fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reset the counter. Test use only; ids stop being unique afterwards.
pub fn reset_event_ids() {
    NEXT_EVENT_ID.store(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = next_event_id();
        let b = next_event_id();
        let c = next_event_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_ids_are_nonzero() {
        assert_ne!(next_event_id(), 0);
    }
}
