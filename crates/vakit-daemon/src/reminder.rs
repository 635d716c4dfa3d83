//! Reminder side effects: a blinking indicator and a short sound clip.
//!
//! The scheduler decides *when* to remind; this module runs the effects and
//! turns them off again.  Blink and sound are tracked independently so one
//! can end while the other is still running.

use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pipeline::{Pipeline, PipelineError, PipelineFactory, PipelineState};
use crate::scheduler::NotificationState;
use crate::timers::{TimerId, TimerRegistry};

pub const BLINK_DURATION: Duration = Duration::from_secs(60);
pub const SOUND_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderTimer {
    BlinkOff,
    SoundOff,
}

/// Where reminders become visible to clients.
pub trait ReminderSink {
    fn announce(&mut self, prayer: &str, minutes_left: i32);
    fn blink(&mut self, on: bool);
}

pub struct Reminder<F: PipelineFactory> {
    factory: F,
    sound_file: PathBuf,
    notifications_enabled: bool,
    sound_enabled: bool,
    state: NotificationState,
    player: Option<F::Pipeline>,
    blink_timer: Option<TimerId>,
    sound_timer: Option<TimerId>,
    destroyed: bool,
}

impl<F: PipelineFactory> Reminder<F> {
    pub fn new(factory: F, sound_file: PathBuf) -> Self {
        Self {
            factory,
            sound_file,
            notifications_enabled: true,
            sound_enabled: true,
            state: NotificationState::default(),
            player: None,
            blink_timer: None,
            sound_timer: None,
            destroyed: false,
        }
    }

    pub fn set_notifications_enabled(&mut self, enabled: bool) {
        self.notifications_enabled = enabled;
    }

    pub fn set_sound_enabled(&mut self, enabled: bool) {
        self.sound_enabled = enabled;
    }

    pub fn state(&self) -> &NotificationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut NotificationState {
        &mut self.state
    }

    pub fn fire<T, S>(
        &mut self,
        prayer: &str,
        minutes_left: i32,
        sink: &mut S,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) where
        T: Clone + From<ReminderTimer>,
        S: ReminderSink,
    {
        if self.destroyed {
            return;
        }
        if !self.notifications_enabled {
            debug!("reminder: notifications disabled, skipping {}", prayer);
            return;
        }
        info!("reminder: {} in {} minutes", prayer, minutes_left);
        sink.announce(prayer, minutes_left);

        if !self.state.is_blinking {
            match timers.schedule_once(now, BLINK_DURATION, ReminderTimer::BlinkOff) {
                Ok(id) => {
                    self.blink_timer = Some(id);
                    self.state.is_blinking = true;
                    sink.blink(true);
                }
                Err(e) => warn!("reminder: blink not armed: {}", e),
            }
        }

        if self.sound_enabled && !self.state.is_playing_sound {
            if !self.sound_file.exists() {
                warn!("reminder: sound file {:?} not found", self.sound_file);
                return;
            }
            match self.play_sound() {
                Ok(player) => {
                    self.player = Some(player);
                    self.state.is_playing_sound = true;
                    match timers.schedule_once(now, SOUND_DURATION, ReminderTimer::SoundOff) {
                        Ok(id) => self.sound_timer = Some(id),
                        Err(e) => {
                            warn!("reminder: sound cut-off not armed: {}", e);
                            self.stop_sound();
                        }
                    }
                }
                Err(e) => warn!("reminder: cannot play sound: {}", e),
            }
        }
    }

    fn play_sound(&mut self) -> Result<F::Pipeline, PipelineError> {
        let mut player = self.factory.create("reminder")?;
        player.set_uri(&self.sound_file.to_string_lossy())?;
        player.set_state(PipelineState::Playing)?;
        Ok(player)
    }

    fn stop_sound(&mut self) {
        if let Some(mut player) = self.player.take() {
            if let Err(e) = player.set_state(PipelineState::Null) {
                debug!("reminder: stopping sound: {}", e);
            }
        }
        self.state.is_playing_sound = false;
    }

    pub fn on_timer<S: ReminderSink>(&mut self, timer: ReminderTimer, sink: &mut S) {
        match timer {
            ReminderTimer::BlinkOff => {
                self.blink_timer = None;
                if self.state.is_blinking {
                    self.state.is_blinking = false;
                    sink.blink(false);
                }
            }
            ReminderTimer::SoundOff => {
                self.sound_timer = None;
                self.stop_sound();
            }
        }
    }

    pub fn teardown<T: Clone>(&mut self, timers: &mut TimerRegistry<T>) {
        timers.cancel_slot(&mut self.blink_timer);
        timers.cancel_slot(&mut self.sound_timer);
        self.stop_sound();
        self.state.reset();
        self.destroyed = true;
    }
}
