//! StreamSupervisor: keeps one radio station playing.
//!
//! ```text
//!            start                 StateChanged(Playing)
//!  Stopped ─────────► Starting ─────────────────────────► Playing
//!     ▲                 │  ▲                                 │  ▲
//!     │ stop            │  │ failover (next url)             │  │ Buffering(100)
//!     │                 │  └──────────── error / eos ────────┤  │
//!     │                 │                                    ▼  │
//!     │                 └── all urls tried ──► Failing    Buffering
//!     │                                          │
//!     │                                          │ 2 s debounce, teardown,
//!     └──────── (any state) ◄─── stop            ▼ new session from url 0
//!                                             Starting
//! ```
//!
//! Every pipeline is watched with a [`BusSink`] stamped with the current
//! session number.  Stopping or restarting bumps the session, so bus messages
//! and timers from an earlier pipeline are ignored when they arrive.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vakit_proto::protocol::{Station, StreamState, StreamStatus};

use crate::pipeline::{
    BusEnvelope, BusMessage, BusSink, Pipeline, PipelineError, PipelineFactory, PipelineState,
    WatchId,
};
use crate::retry::{Retry, RetryDecision};
use crate::timers::{TimerId, TimerRegistry};

pub const HEALTH_POLL: Duration = Duration::from_secs(30);
pub const RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTimer {
    HealthPoll { session: u64 },
    Restart { session: u64 },
}

pub struct StreamSupervisor<F: PipelineFactory> {
    factory: F,
    bus_tx: mpsc::UnboundedSender<BusEnvelope>,
    state: StreamState,
    station: Option<Station>,
    url_index: usize,
    /// Consecutive failovers without reaching Playing.
    failovers: usize,
    retry_count: u32,
    session: u64,
    pipeline: Option<F::Pipeline>,
    watch: Option<WatchId>,
    health_timer: Option<TimerId>,
    restart: Retry,
    buffering: bool,
}

impl<F: PipelineFactory> StreamSupervisor<F> {
    pub fn new(factory: F, bus_tx: mpsc::UnboundedSender<BusEnvelope>) -> Self {
        Self {
            factory,
            bus_tx,
            state: StreamState::Stopped,
            station: None,
            url_index: 0,
            failovers: 0,
            retry_count: 0,
            session: 0,
            pipeline: None,
            watch: None,
            health_timer: None,
            restart: Retry::new(RESTART_DELAY, None),
            buffering: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn station(&self) -> Option<&Station> {
        self.station.as_ref()
    }

    pub fn url_index(&self) -> usize {
        self.url_index
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_active(&self) -> bool {
        self.state != StreamState::Stopped
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            state: self.state,
            playing: self.state == StreamState::Playing,
            station_id: self.station.as_ref().map(|s| s.id.clone()),
            station_name: self.station.as_ref().map(|s| s.name.clone()),
            url_index: self.url_index,
            total_urls: self.station.as_ref().map(|s| s.urls.len()).unwrap_or(0),
            retry_count: self.retry_count,
        }
    }

    /// User-initiated start.  Replaces whatever is playing.
    pub fn start<T: Clone + From<StreamTimer>>(
        &mut self,
        station: Station,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) -> Result<(), PipelineError> {
        if self.is_active() {
            self.stop(timers);
        }
        self.retry_count = 0;
        self.restart.reset();
        self.begin_session(station, timers, now)
    }

    /// Same station playing: stop.  Otherwise start `station`.
    pub fn toggle<T: Clone + From<StreamTimer>>(
        &mut self,
        station: Station,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) -> Result<(), PipelineError> {
        let same = self
            .station
            .as_ref()
            .map(|s| s.id == station.id)
            .unwrap_or(false);
        if self.is_active() && same {
            self.stop(timers);
            return Ok(());
        }
        self.start(station, timers, now)
    }

    /// Idempotent.
    pub fn stop<T: Clone>(&mut self, timers: &mut TimerRegistry<T>) {
        if self.state != StreamState::Stopped {
            info!(
                "stream: stopping {}",
                self.station.as_ref().map(|s| s.name.as_str()).unwrap_or("?")
            );
        }
        self.teardown(timers);
        self.session += 1;
        self.state = StreamState::Stopped;
        self.station = None;
        self.url_index = 0;
        self.failovers = 0;
    }

    fn begin_session<T: Clone + From<StreamTimer>>(
        &mut self,
        station: Station,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) -> Result<(), PipelineError> {
        self.session += 1;
        let session = self.session;
        self.url_index = 0;
        self.failovers = 0;
        self.buffering = false;

        let result = self.build_pipeline(&station, session);
        if let Err(e) = result {
            error!("stream: cannot start {}: {}", station.name, e);
            self.teardown(timers);
            self.state = StreamState::Stopped;
            self.station = None;
            return Err(e);
        }

        match timers.schedule_every(now, HEALTH_POLL, StreamTimer::HealthPoll { session }) {
            Ok(id) => self.health_timer = Some(id),
            Err(e) => warn!("stream: health poll not armed: {}", e),
        }
        info!(
            "stream: starting {} ({} url(s), session {})",
            station.name,
            station.urls.len(),
            session
        );
        self.station = Some(station);
        self.state = StreamState::Starting;
        Ok(())
    }

    fn build_pipeline(&mut self, station: &Station, session: u64) -> Result<(), PipelineError> {
        let first = station
            .urls
            .first()
            .ok_or_else(|| PipelineError::NoUrls(station.id.clone()))?;
        let mut pipeline = self.factory.create(&station.id)?;
        let watch = pipeline.watch(BusSink::new(session, self.bus_tx.clone()))?;
        self.watch = Some(watch);
        self.pipeline = Some(pipeline);
        let pipeline = self.pipeline.as_mut().ok_or(PipelineError::Closed)?;
        pipeline.set_uri(first)?;
        pipeline.set_state(PipelineState::Playing)?;
        Ok(())
    }

    /// Release the pipeline and this session's timers.  Safe to repeat.
    fn teardown<T: Clone>(&mut self, timers: &mut TimerRegistry<T>) {
        timers.cancel_slot(&mut self.health_timer);
        self.restart.cancel(timers);
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Some(watch) = self.watch.take() {
                pipeline.unwatch(watch);
            }
            if let Err(e) = pipeline.set_state(PipelineState::Null) {
                debug!("stream: set Null during teardown: {}", e);
            }
        }
        self.watch = None;
        self.buffering = false;
    }

    pub fn on_bus<T: Clone + From<StreamTimer>>(
        &mut self,
        envelope: BusEnvelope,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) {
        if envelope.session != self.session || self.state == StreamState::Stopped {
            debug!(
                "stream: dropping {:?} from session {} (current {})",
                envelope.message, envelope.session, self.session
            );
            return;
        }
        match envelope.message {
            BusMessage::StateChanged(PipelineState::Playing) => {
                if matches!(self.state, StreamState::Starting | StreamState::Buffering) {
                    info!("stream: playing url #{}", self.url_index);
                }
                if self.state != StreamState::Failing {
                    self.failovers = 0;
                    // paused by us for buffering: stays so until the buffer fills
                    if !self.buffering {
                        self.state = StreamState::Playing;
                    }
                }
            }
            BusMessage::StateChanged(_) => {}
            BusMessage::Error(msg) => {
                info!("stream: error on url #{}: {}", self.url_index, msg);
                self.fail(timers, now);
            }
            BusMessage::EndOfStream => {
                info!("stream: end of stream on url #{}", self.url_index);
                self.fail(timers, now);
            }
            BusMessage::Buffering(percent) => self.on_buffering(percent),
        }
    }

    fn on_buffering(&mut self, percent: u8) {
        if !matches!(
            self.state,
            StreamState::Starting | StreamState::Playing | StreamState::Buffering
        ) {
            return;
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        if percent < 100 {
            if !self.buffering {
                debug!("stream: buffering {}%, pausing", percent);
                if let Err(e) = pipeline.set_state(PipelineState::Paused) {
                    warn!("stream: pause for buffering: {}", e);
                }
                self.buffering = true;
            }
            self.state = StreamState::Buffering;
        } else if self.buffering {
            debug!("stream: buffer full, resuming");
            if let Err(e) = pipeline.set_state(PipelineState::Playing) {
                warn!("stream: resume after buffering: {}", e);
            }
            self.buffering = false;
            self.state = StreamState::Playing;
        }
    }

    pub fn on_timer<T: Clone + From<StreamTimer>>(
        &mut self,
        timer: StreamTimer,
        id: TimerId,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) {
        match timer {
            StreamTimer::HealthPoll { session } => {
                if session != self.session {
                    debug!("stream: stale health poll for session {}", session);
                    return;
                }
                if !matches!(
                    self.state,
                    StreamState::Starting | StreamState::Playing | StreamState::Buffering
                ) {
                    return;
                }
                let healthy = self
                    .pipeline
                    .as_ref()
                    .map(|p| p.query_state().is_healthy())
                    .unwrap_or(false);
                if !healthy {
                    info!("stream: health check failed on url #{}", self.url_index);
                    self.fail(timers, now);
                }
            }
            StreamTimer::Restart { session } => {
                if !self.restart.fired(id) || session != self.session {
                    debug!("stream: stale restart for session {}", session);
                    return;
                }
                if self.state != StreamState::Failing {
                    return;
                }
                let Some(station) = self.station.clone() else {
                    return;
                };
                self.teardown(timers);
                self.retry_count += 1;
                info!(
                    "stream: restarting {} (retry {})",
                    station.name, self.retry_count
                );
                if self.begin_session(station, timers, now).is_err() {
                    debug!("stream: restart abandoned");
                }
            }
        }
    }

    fn fail<T: Clone + From<StreamTimer>>(&mut self, timers: &mut TimerRegistry<T>, now: Instant) {
        match self.state {
            StreamState::Starting | StreamState::Playing | StreamState::Buffering => {
                self.failover(timers, now)
            }
            StreamState::Failing => self.schedule_restart(timers, now),
            StreamState::Stopped => {}
        }
    }

    fn failover<T: Clone + From<StreamTimer>>(
        &mut self,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) {
        let Some(station) = self.station.as_ref() else {
            return;
        };
        let total = station.urls.len();
        if total == 0 {
            return;
        }
        self.url_index = (self.url_index + 1) % total;
        self.failovers += 1;
        self.buffering = false;

        if self.failovers >= total {
            info!("stream: all {} url(s) failed", total);
            self.state = StreamState::Failing;
            self.schedule_restart(timers, now);
            return;
        }

        let url = station.urls[self.url_index].clone();
        info!("stream: failing over to url #{}: {}", self.url_index, url);
        let rebound = match self.pipeline.as_mut() {
            Some(pipeline) => pipeline
                .set_uri(&url)
                .and_then(|_| pipeline.set_state(PipelineState::Playing)),
            None => Err(PipelineError::Closed),
        };
        match rebound {
            Ok(_) => self.state = StreamState::Starting,
            Err(e) => {
                info!("stream: failover to url #{}: {}", self.url_index, e);
                self.state = StreamState::Failing;
                self.schedule_restart(timers, now);
            }
        }
    }

    fn schedule_restart<T: Clone + From<StreamTimer>>(
        &mut self,
        timers: &mut TimerRegistry<T>,
        now: Instant,
    ) {
        let session = self.session;
        match self
            .restart
            .schedule(timers, now, StreamTimer::Restart { session })
        {
            Ok(RetryDecision::Scheduled(id)) => {
                info!("stream: restart in {:?} ({})", RESTART_DELAY, id)
            }
            Ok(RetryDecision::AlreadyPending) => debug!("stream: restart already pending"),
            Ok(RetryDecision::Exhausted) => warn!("stream: restart budget exhausted"),
            Err(e) => warn!("stream: restart not armed: {}", e),
        }
    }
}
