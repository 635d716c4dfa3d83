//! Fixed-delay, bounded, debounced retry.
//!
//! Shared by HTTP client construction, schedule fetch and stream restart:
//! each owner keeps one [`Retry`] and calls [`Retry::schedule`] on failure.
//! While an attempt is pending, further calls are absorbed, so a burst of
//! failures never stacks timers.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::timers::{TimerError, TimerId, TimerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled(TimerId),
    AlreadyPending,
    Exhausted,
}

#[derive(Debug)]
pub struct Retry {
    delay: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
    pending: Option<TimerId>,
}

impl Retry {
    /// `max_attempts = None` retries forever.
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
            pending: None,
        }
    }

    pub fn schedule<T: Clone>(
        &mut self,
        timers: &mut TimerRegistry<T>,
        now: Instant,
        token: impl Into<T>,
    ) -> Result<RetryDecision, TimerError> {
        if self.pending.is_some() {
            return Ok(RetryDecision::AlreadyPending);
        }
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return Ok(RetryDecision::Exhausted);
            }
        }
        let id = timers.schedule_once(now, self.delay, token)?;
        self.attempts += 1;
        self.pending = Some(id);
        debug!(
            "retry: attempt {} armed in {:?} ({})",
            self.attempts, self.delay, id
        );
        Ok(RetryDecision::Scheduled(id))
    }

    /// The pending timer fired.  Returns false when `id` is not the attempt
    /// this helper armed (a stale timer), which callers should ignore.
    pub fn fired(&mut self, id: TimerId) -> bool {
        if self.pending == Some(id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn cancel<T: Clone>(&mut self, timers: &mut TimerRegistry<T>) {
        timers.cancel_slot(&mut self.pending);
    }

    /// Restore the full budget after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.pending.is_none()
            && self
                .max_attempts
                .map(|max| self.attempts >= max)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_attempts() {
        let t0 = Instant::now();
        let mut timers: TimerRegistry<u8> = TimerRegistry::new();
        let mut retry = Retry::new(Duration::from_secs(5), Some(3));

        let mut now = t0;
        for attempt in 1..=3 {
            let id = match retry.schedule(&mut timers, now, 0u8).unwrap() {
                RetryDecision::Scheduled(id) => id,
                other => panic!("attempt {attempt}: {other:?}"),
            };
            now += Duration::from_secs(5);
            let fired = timers.pop_due(now);
            assert_eq!(fired.len(), 1);
            assert!(retry.fired(id));
        }
        assert_eq!(
            retry.schedule(&mut timers, now, 0u8).unwrap(),
            RetryDecision::Exhausted
        );
        assert!(retry.is_exhausted());

        retry.reset();
        assert!(matches!(
            retry.schedule(&mut timers, now, 0u8).unwrap(),
            RetryDecision::Scheduled(_)
        ));
    }

    #[test]
    fn test_debounces_while_pending() {
        let t0 = Instant::now();
        let mut timers: TimerRegistry<u8> = TimerRegistry::new();
        let mut retry = Retry::new(Duration::from_secs(2), None);

        assert!(matches!(
            retry.schedule(&mut timers, t0, 1u8).unwrap(),
            RetryDecision::Scheduled(_)
        ));
        for _ in 0..5 {
            assert_eq!(
                retry.schedule(&mut timers, t0, 1u8).unwrap(),
                RetryDecision::AlreadyPending
            );
        }
        assert_eq!(timers.len(), 1);
        assert_eq!(retry.attempts(), 1);
    }

    #[test]
    fn test_cancel_disarms() {
        let t0 = Instant::now();
        let mut timers: TimerRegistry<u8> = TimerRegistry::new();
        let mut retry = Retry::new(Duration::from_secs(2), None);
        retry.schedule(&mut timers, t0, 1u8).unwrap();
        retry.cancel(&mut timers);
        assert!(!retry.is_pending());
        assert!(timers.is_empty());
    }
}
