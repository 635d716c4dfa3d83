//! PrayerScheduler: today's prayer table, the next prayer, time remaining,
//! and the reminder window.
//!
//! Everything here is synchronous and takes the wall-clock time as an
//! argument; the core loop supplies `Local::now()` once per display refresh.
//!
//! The wrap past the last prayer reuses today's first entry as tomorrow's.
//! Prayer times drift by a minute or two per day, so the countdown shown after
//! Isha is approximate until the next daily fetch replaces the table.

use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use vakit_proto::prayer::{Language, PrayerKey, TimeOfDay};

pub const DISPLAY_REFRESH: Duration = Duration::from_secs(60);
/// Minutes-before-prayer range in which a reminder may fire.
pub const REMINDER_WINDOW: RangeInclusive<i32> = 15..=20;
/// Minimum gap between two reminders.
pub const QUIET_WINDOW_MINUTES: i64 = 240;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSchedule {
    #[error("no entries")]
    Empty,
    #[error("duplicate entry for {0:?}")]
    Duplicate(PrayerKey),
    #[error("{0:?} is not later than the entry before it")]
    OutOfOrder(PrayerKey),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] InvalidSchedule),
    #[error("negative time remaining: target {target} (next day: {is_next_day}) is before {now}")]
    NegativeRemaining {
        target: TimeOfDay,
        is_next_day: bool,
        now: TimeOfDay,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrayerSchedule {
    entries: Vec<(PrayerKey, TimeOfDay)>,
}

impl PrayerSchedule {
    pub fn entries(&self) -> &[(PrayerKey, TimeOfDay)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.len() == PrayerKey::ALL.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextPrayer {
    pub key: PrayerKey,
    pub time: TimeOfDay,
    pub is_next_day: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLeft {
    pub hours: i32,
    pub minutes: i32,
    pub total_minutes: i32,
}

impl fmt::Display for TimeLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h {}m", self.hours, self.minutes)
    }
}

/// Reminder bookkeeping.  `last_fired` gates re-firing; the two flags are
/// owned by the reminder side effects and say whether each is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationState {
    pub last_fired: Option<NaiveDateTime>,
    pub is_blinking: bool,
    pub is_playing_sound: bool,
}

impl NotificationState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyDecision {
    pub fire: bool,
}

/// One display refresh worth of output.
#[derive(Debug, Clone, PartialEq)]
pub struct Refresh {
    pub next: NextPrayer,
    pub left: TimeLeft,
    pub text: String,
    pub notify: NotifyDecision,
}

pub struct PrayerScheduler {
    schedule: PrayerSchedule,
    language: Language,
    destroyed: bool,
}

impl PrayerScheduler {
    pub fn new(language: Language) -> Self {
        Self {
            schedule: PrayerSchedule::default(),
            language,
            destroyed: false,
        }
    }

    pub fn schedule(&self) -> &PrayerSchedule {
        &self.schedule
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    pub fn label(&self, key: PrayerKey) -> &'static str {
        key.label(self.language)
    }

    /// Replace the table atomically.  On error the previous table is kept.
    pub fn load_schedule(
        &mut self,
        entries: Vec<(PrayerKey, TimeOfDay)>,
    ) -> Result<(), ScheduleError> {
        if self.destroyed {
            debug!("scheduler: torn down, ignoring schedule");
            return Ok(());
        }
        if entries.is_empty() {
            return Err(InvalidSchedule::Empty.into());
        }
        let mut seen = HashSet::with_capacity(entries.len());
        let mut prev: Option<TimeOfDay> = None;
        for (key, time) in &entries {
            if !seen.insert(*key) {
                return Err(InvalidSchedule::Duplicate(*key).into());
            }
            if prev.map(|p| *time <= p).unwrap_or(false) {
                return Err(InvalidSchedule::OutOfOrder(*key).into());
            }
            prev = Some(*time);
        }
        let schedule = PrayerSchedule { entries };
        if !schedule.is_complete() {
            warn!(
                "scheduler: partial schedule with {} of {} entries",
                schedule.entries.len(),
                PrayerKey::ALL.len()
            );
        }
        info!("scheduler: loaded {} entries", schedule.entries.len());
        self.schedule = schedule;
        Ok(())
    }

    pub fn find_next(&self, now: &NaiveDateTime) -> Option<NextPrayer> {
        let first = self.schedule.entries.first()?;
        let now = TimeOfDay::of(now);
        let next = self
            .schedule
            .entries
            .iter()
            .find(|(_, time)| *time > now)
            .map(|(key, time)| NextPrayer {
                key: *key,
                time: *time,
                is_next_day: false,
            });
        Some(next.unwrap_or(NextPrayer {
            key: first.0,
            time: first.1,
            is_next_day: true,
        }))
    }

    pub fn time_remaining(
        target: TimeOfDay,
        is_next_day: bool,
        now: &NaiveDateTime,
    ) -> Result<TimeLeft, ScheduleError> {
        let now = TimeOfDay::of(now);
        let mut target_minutes = target.minutes_since_midnight();
        if is_next_day {
            target_minutes += TimeOfDay::MINUTES_PER_DAY;
        }
        let diff = target_minutes - now.minutes_since_midnight();
        if diff < 0 {
            return Err(ScheduleError::NegativeRemaining {
                target,
                is_next_day,
                now,
            });
        }
        Ok(TimeLeft {
            hours: diff / 60,
            minutes: diff % 60,
            total_minutes: diff,
        })
    }

    pub fn maybe_notify(
        left: &TimeLeft,
        state: &mut NotificationState,
        now: NaiveDateTime,
    ) -> NotifyDecision {
        if !REMINDER_WINDOW.contains(&left.total_minutes) {
            return NotifyDecision { fire: false };
        }
        if let Some(last) = state.last_fired {
            let since = (now - last).num_minutes();
            if since < QUIET_WINDOW_MINUTES {
                debug!(
                    "scheduler: skipping reminder, last one was {} minutes ago",
                    since
                );
                return NotifyDecision { fire: false };
            }
        }
        state.last_fired = Some(now);
        NotifyDecision { fire: true }
    }

    /// The display-refresh step.  `None` when there is nothing to show: the
    /// table is not loaded yet or the scheduler has been torn down.
    pub fn refresh(
        &self,
        now: NaiveDateTime,
        state: &mut NotificationState,
    ) -> Option<Refresh> {
        if self.destroyed {
            return None;
        }
        let next = self.find_next(&now)?;
        let left = match Self::time_remaining(next.time, next.is_next_day, &now) {
            Ok(left) => left,
            Err(e) => {
                error!("scheduler: {}", e);
                return None;
            }
        };
        let text = format!("{}: {}", self.label(next.key), left);
        debug!(
            "scheduler: next {:?} at {} (next day: {}), {} left",
            next.key, next.time, next.is_next_day, left
        );
        let notify = Self::maybe_notify(&left, state, now);
        Some(Refresh {
            next,
            left,
            text,
            notify,
        })
    }

    pub fn teardown(&mut self) {
        self.destroyed = true;
        self.schedule = PrayerSchedule::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 11)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn sample() -> Vec<(PrayerKey, TimeOfDay)> {
        vec![
            (PrayerKey::Fajr, t("05:00")),
            (PrayerKey::Sunrise, t("06:30")),
            (PrayerKey::Dhuhr, t("12:30")),
            (PrayerKey::Asr, t("15:45")),
            (PrayerKey::Maghrib, t("18:20")),
            (PrayerKey::Isha, t("19:45")),
        ]
    }

    fn loaded() -> PrayerScheduler {
        let mut s = PrayerScheduler::new(Language::En);
        s.load_schedule(sample()).unwrap();
        s
    }

    #[test]
    fn test_find_next_before_first() {
        let s = loaded();
        for (h, m) in [(0, 0), (3, 15), (4, 59)] {
            let next = s.find_next(&at(h, m)).unwrap();
            assert_eq!(next.key, PrayerKey::Fajr);
            assert!(!next.is_next_day);
        }
    }

    #[test]
    fn test_find_next_is_strictly_after_now() {
        let s = loaded();
        let next = s.find_next(&at(12, 30)).unwrap();
        assert_eq!(next.key, PrayerKey::Asr);
    }

    #[test]
    fn test_after_last_wraps_with_positive_remaining() {
        let s = loaded();
        for (h, m) in [(19, 45), (20, 30), (23, 59)] {
            let now = at(h, m);
            let next = s.find_next(&now).unwrap();
            assert_eq!(next.key, PrayerKey::Fajr);
            assert!(next.is_next_day);
            let left = PrayerScheduler::time_remaining(next.time, true, &now).unwrap();
            assert!(left.total_minutes > 0);
        }
    }

    #[test]
    fn test_time_remaining_matches_difference() {
        for (target, now) in [("18:20", (18, 5)), ("23:59", (0, 0)), ("12:30", (9, 47))] {
            let target = t(target);
            let now = at(now.0, now.1);
            let left = PrayerScheduler::time_remaining(target, false, &now).unwrap();
            assert_eq!(
                left.hours * 60 + left.minutes,
                target.minutes_since_midnight() - TimeOfDay::of(&now).minutes_since_midnight()
            );
        }
    }

    #[test]
    fn test_negative_remaining_is_surfaced() {
        let err = PrayerScheduler::time_remaining(t("05:00"), false, &at(6, 0)).unwrap_err();
        assert!(matches!(err, ScheduleError::NegativeRemaining { .. }));
    }

    #[test]
    fn test_maghrib_scenario() {
        let s = loaded();
        let now = at(18, 5);
        let next = s.find_next(&now).unwrap();
        assert_eq!(
            next,
            NextPrayer {
                key: PrayerKey::Maghrib,
                time: t("18:20"),
                is_next_day: false
            }
        );
        let left = PrayerScheduler::time_remaining(next.time, next.is_next_day, &now).unwrap();
        assert_eq!((left.hours, left.minutes), (0, 15));
        let mut state = NotificationState::default();
        assert!(PrayerScheduler::maybe_notify(&left, &mut state, now).fire);
        assert_eq!(state.last_fired, Some(now));
    }

    #[test]
    fn test_after_isha_scenario() {
        let s = loaded();
        let now = at(20, 30);
        let next = s.find_next(&now).unwrap();
        assert_eq!(
            next,
            NextPrayer {
                key: PrayerKey::Fajr,
                time: t("05:00"),
                is_next_day: true
            }
        );
        let left = PrayerScheduler::time_remaining(next.time, next.is_next_day, &now).unwrap();
        assert_eq!((left.hours, left.minutes), (8, 30));
        assert_eq!(left.to_string(), "8h 30m");
    }

    #[test]
    fn test_notify_fires_once_per_quiet_window() {
        let mut state = NotificationState::default();
        let first = at(18, 5);
        let left = TimeLeft {
            hours: 0,
            minutes: 16,
            total_minutes: 16,
        };
        assert!(PrayerScheduler::maybe_notify(&left, &mut state, first).fire);

        let left = TimeLeft {
            hours: 0,
            minutes: 15,
            total_minutes: 15,
        };
        assert!(!PrayerScheduler::maybe_notify(&left, &mut state, at(18, 6)).fire);
        assert_eq!(state.last_fired, Some(first));

        // four hours later the window is open again
        let left = TimeLeft {
            hours: 0,
            minutes: 18,
            total_minutes: 18,
        };
        assert!(PrayerScheduler::maybe_notify(&left, &mut state, at(22, 5)).fire);
    }

    #[test]
    fn test_notify_outside_window_does_not_touch_state() {
        let mut state = NotificationState::default();
        for total in [0, 14, 21, 300] {
            let left = TimeLeft {
                hours: total / 60,
                minutes: total % 60,
                total_minutes: total,
            };
            assert!(!PrayerScheduler::maybe_notify(&left, &mut state, at(10, 0)).fire);
        }
        assert_eq!(state.last_fired, None);
    }

    #[test]
    fn test_load_rejects_bad_tables_and_keeps_previous() {
        let mut s = loaded();
        assert_eq!(
            s.load_schedule(Vec::new()),
            Err(ScheduleError::InvalidSchedule(InvalidSchedule::Empty))
        );
        let mut dup = sample();
        dup[1].0 = PrayerKey::Fajr;
        assert_eq!(
            s.load_schedule(dup),
            Err(ScheduleError::InvalidSchedule(InvalidSchedule::Duplicate(PrayerKey::Fajr)))
        );
        let mut unordered = sample();
        unordered.swap(2, 3);
        assert!(s.load_schedule(unordered).is_err());
        assert_eq!(s.schedule().entries(), sample().as_slice());
    }

    #[test]
    fn test_refresh_formats_label() {
        let mut s = loaded();
        s.set_language(Language::Tr);
        let mut state = NotificationState::default();
        let r = s.refresh(at(18, 5), &mut state).unwrap();
        assert_eq!(r.text, "Akşam: 0h 15m");
        assert!(r.notify.fire);
    }

    #[test]
    fn test_refresh_is_noop_when_empty_or_torn_down() {
        let mut state = NotificationState::default();
        let empty = PrayerScheduler::new(Language::En);
        assert!(empty.refresh(at(10, 0), &mut state).is_none());
        assert!(empty.find_next(&at(10, 0)).is_none());

        let mut s = loaded();
        s.teardown();
        assert!(s.refresh(at(18, 5), &mut state).is_none());
        assert_eq!(state.last_fired, None);
    }

    #[test]
    fn test_load_after_teardown_is_ignored() {
        let mut s = PrayerScheduler::new(Language::Tr);
        s.teardown();
        assert_eq!(s.load_schedule(sample()), Ok(()));
        assert!(s.schedule().is_empty());
        assert!(s.find_next(&at(10, 0)).is_none());
    }

    #[test]
    fn test_partial_schedule_is_accepted() {
        let mut s = PrayerScheduler::new(Language::Tr);
        let partial: Vec<_> = sample().into_iter().take(3).collect();
        assert_eq!(s.load_schedule(partial), Ok(()));
        assert!(!s.schedule().is_complete());
        assert_eq!(s.find_next(&at(10, 0)).map(|n| n.key), Some(PrayerKey::Dhuhr));
    }
}
