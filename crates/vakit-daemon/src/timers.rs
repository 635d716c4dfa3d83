//! Timer bookkeeping for the single-threaded core loop.
//!
//! Timers are plain data: a deadline plus a token describing what to do when
//! it expires.  The core loop sleeps until [`TimerRegistry::next_deadline`],
//! drains [`TimerRegistry::pop_due`] and dispatches each token to the
//! component that armed it.
//!
//! ```text
//!   component ── schedule_once / schedule_every ──► TimerRegistry
//!                                                        │
//!   core loop ◄──────── pop_due(now) ── (TimerId, token) ┘
//! ```
//!
//! Components keep `Option<TimerId>` references only.  Cancelling an id that
//! already fired yields [`TimerError::NotArmed`], which callers log and drop.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("{0} is not armed (already fired or cancelled)")]
    NotArmed(TimerId),
    #[error("timer registry is closed")]
    Closed,
}

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    period: Option<Duration>,
    token: T,
}

pub struct TimerRegistry<T> {
    next_id: u64,
    entries: BTreeMap<TimerId, Entry<T>>,
    closed: bool,
}

impl<T: Clone> TimerRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn schedule_once(
        &mut self,
        now: Instant,
        delay: Duration,
        token: impl Into<T>,
    ) -> Result<TimerId, TimerError> {
        self.insert(now + delay, None, token.into())
    }

    /// First expiry one `period` from `now`, then every `period` after that.
    pub fn schedule_every(
        &mut self,
        now: Instant,
        period: Duration,
        token: impl Into<T>,
    ) -> Result<TimerId, TimerError> {
        self.insert(now + period, Some(period), token.into())
    }

    fn insert(
        &mut self,
        deadline: Instant,
        period: Option<Duration>,
        token: T,
    ) -> Result<TimerId, TimerError> {
        if self.closed {
            return Err(TimerError::Closed);
        }
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                deadline,
                period,
                token,
            },
        );
        Ok(id)
    }

    pub fn cancel(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.entries
            .remove(&id)
            .map(|_| ())
            .ok_or(TimerError::NotArmed(id))
    }

    /// Cancel `slot` if it holds an id, clearing it first.  Errors are logged.
    pub fn cancel_slot(&mut self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            if let Err(e) = self.cancel(id) {
                debug!("timers: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Remove every expired one-shot and re-arm every expired repeating timer,
    /// returning their tokens ordered by deadline.  A repeating timer that
    /// missed several periods fires once and is re-armed relative to `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut due: Vec<(Instant, TimerId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, e)| (e.deadline, *id))
            .collect();
        due.sort();

        let mut fired = Vec::with_capacity(due.len());
        for (_, id) in due {
            let repeat = match self.entries.get_mut(&id) {
                Some(entry) => match entry.period {
                    Some(period) => {
                        let mut next = entry.deadline + period;
                        if next <= now {
                            next = now + period;
                        }
                        entry.deadline = next;
                        fired.push((id, entry.token.clone()));
                        true
                    }
                    None => false,
                },
                None => continue,
            };
            if !repeat {
                if let Some(entry) = self.entries.remove(&id) {
                    fired.push((id, entry.token));
                }
            }
        }
        fired
    }

    /// Cancel every outstanding timer and refuse new ones.  Must run once, at
    /// the start of teardown.
    pub fn cancel_all(&mut self) {
        let ids: Vec<TimerId> = self.entries.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.cancel(id) {
                warn!("timers: cancel during teardown: {}", e);
            }
        }
        self.entries.clear();
        self.closed = true;
        debug!("timers: registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T: Clone> Default for TimerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
