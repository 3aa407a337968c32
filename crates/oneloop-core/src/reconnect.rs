//! Reconnect delay policy.
//!
//! Tracks how many reconnect attempts have been made and how long to wait
//! before the next one. The caller owns the actual timer; this type only
//! does the arithmetic.

/// Sentinel for unlimited retries.
pub const UNLIMITED: u32 = u32::MAX;

/// How the delay advances between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    /// Always `min_delay`.
    Fixed,
    /// Grows by `min_delay` each attempt.
    Linear,
    /// Multiplied by the factor each attempt.
    Exponential(u32),
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    min_delay_ms: u32,
    max_delay_ms: u32,
    policy: DelayPolicy,
    max_retry_cnt: u32,
    cur_retry_cnt: u32,
    cur_delay_ms: u32,
}

impl ReconnectPolicy {
    pub fn new(min_delay_ms: u32, max_delay_ms: u32, policy: DelayPolicy) -> Self {
        Self {
            min_delay_ms,
            max_delay_ms,
            policy,
            max_retry_cnt: UNLIMITED,
            cur_retry_cnt: 0,
            cur_delay_ms: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retry_cnt: u32) -> Self {
        self.max_retry_cnt = max_retry_cnt;
        self
    }

    #[inline]
    pub fn retries(&self) -> u32 {
        self.cur_retry_cnt
    }

    /// Record one attempt. Returns true while attempts remain; the call
    /// after the last permitted retry returns false.
    pub fn can_retry(&mut self) -> bool {
        self.cur_retry_cnt = self.cur_retry_cnt.saturating_add(1);
        self.max_retry_cnt == UNLIMITED || self.cur_retry_cnt <= self.max_retry_cnt
    }

    /// Advance and return the delay before the next attempt, clamped to
    /// `[min_delay, max_delay]`.
    pub fn next_delay(&mut self) -> u32 {
        self.cur_delay_ms = match self.policy {
            DelayPolicy::Fixed => self.min_delay_ms,
            DelayPolicy::Linear => self.cur_delay_ms.saturating_add(self.min_delay_ms),
            DelayPolicy::Exponential(factor) => self.cur_delay_ms.saturating_mul(factor),
        };
        self.cur_delay_ms = self
            .cur_delay_ms
            .max(self.min_delay_ms)
            .min(self.max_delay_ms);
        self.cur_delay_ms
    }

    /// Clear the counter and delay after a successful connection.
    pub fn reset(&mut self) {
        self.cur_retry_cnt = 0;
        self.cur_delay_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_ladder() {
        let mut p = ReconnectPolicy::new(1000, 60000, DelayPolicy::Exponential(2));
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(p.next_delay());
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]);
    }

    #[test]
    fn test_linear_ladder() {
        let mut p = ReconnectPolicy::new(500, 2000, DelayPolicy::Linear);
        assert_eq!(p.next_delay(), 500);
        assert_eq!(p.next_delay(), 1000);
        assert_eq!(p.next_delay(), 1500);
        assert_eq!(p.next_delay(), 2000);
        assert_eq!(p.next_delay(), 2000);
    }

    #[test]
    fn test_fixed_delay() {
        let mut p = ReconnectPolicy::new(250, 60000, DelayPolicy::Fixed);
        assert_eq!(p.next_delay(), 250);
        assert_eq!(p.next_delay(), 250);
    }

    #[test]
    fn test_retry_cutoff() {
        let mut p =
            ReconnectPolicy::new(1000, 60000, DelayPolicy::Fixed).with_max_retries(3);
        assert!(p.can_retry());
        assert!(p.can_retry());
        assert!(p.can_retry());
        assert!(!p.can_retry());
        assert!(!p.can_retry());
    }

    #[test]
    fn test_unlimited_retries() {
        let mut p = ReconnectPolicy::new(1000, 60000, DelayPolicy::Fixed);
        for _ in 0..1000 {
            assert!(p.can_retry());
        }
    }

    #[test]
    fn test_reset() {
        let mut p =
            ReconnectPolicy::new(1000, 60000, DelayPolicy::Exponential(2)).with_max_retries(2);
        let _ = p.next_delay();
        let _ = p.next_delay();
        assert!(p.can_retry());
        assert!(p.can_retry());
        assert!(!p.can_retry());
        p.reset();
        assert_eq!(p.retries(), 0);
        assert!(p.can_retry());
        assert_eq!(p.next_delay(), 1000);
    }
}
