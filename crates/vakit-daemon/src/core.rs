/// DaemonCore: single-owner event loop for all mutable state.
///
/// The scheduler, the stream supervisor, the reminder and every timer live
/// here and are only touched from this loop.  Inputs arrive three ways:
///
/// - `DaemonEvent`s from the socket and HTTP servers and from fetch tasks,
/// - `BusEnvelope`s posted by audio pipelines,
/// - expiry of the nearest timer in `TimerRegistry`.
///
/// After each input the panel snapshot is rebuilt; when it differs from the
/// last one it is published to `StateManager` and a
/// `BroadcastMessage::StatusUpdated` goes out to all listeners.
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vakit_proto::config::Config;
use vakit_proto::prayer::{PrayerKey, TimeOfDay};
use vakit_proto::protocol::{
    City, Command, NextPrayerInfo, PanelStatus, ScheduleEntry, SettingsSnapshot, Station,
};
use vakit_proto::state::{
    load_cities_from_toml, load_stations_from_m3u, load_stations_from_toml, StateManager,
};

use crate::fetch::{self, FetchError};
use crate::pipeline::{BusEnvelope, PipelineFactory};
use crate::reminder::{Reminder, ReminderSink, ReminderTimer};
use crate::retry::{Retry, RetryDecision};
use crate::scheduler::{NextPrayer, PrayerScheduler, DISPLAY_REFRESH};
use crate::supervisor::{StreamSupervisor, StreamTimer};
use crate::timers::{TimerId, TimerRegistry};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop except bus messages and timers.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a panel client or the HTTP API.
    ClientCommand(Command),
    /// A fetch task finished.  `generation` identifies the request.
    ScheduleFetched {
        generation: u64,
        city: String,
        result: Result<Vec<(PrayerKey, TimeOfDay)>, FetchError>,
    },
    Shutdown,
}

// ── timers ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreTimer {
    DisplayRefresh,
    FetchRetry,
    ClientInit,
    Stream(StreamTimer),
    Reminder(ReminderTimer),
}

impl From<StreamTimer> for CoreTimer {
    fn from(t: StreamTimer) -> Self {
        Self::Stream(t)
    }
}

impl From<ReminderTimer> for CoreTimer {
    fn from(t: ReminderTimer) -> Self {
        Self::Reminder(t)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

struct BroadcastSink<'a>(&'a broadcast::Sender<BroadcastMessage>);

impl ReminderSink for BroadcastSink<'_> {
    fn announce(&mut self, prayer: &str, minutes_left: i32) {
        let _ = self.0.send(BroadcastMessage::Reminder {
            prayer: prayer.to_string(),
            minutes_left,
        });
    }

    fn blink(&mut self, on: bool) {
        let _ = self.0.send(BroadcastMessage::Blink(on));
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore<F: PipelineFactory + Clone> {
    config: Config,
    /// Write settings changes back to `config.toml`.
    persist_settings: bool,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Cloned into fetch tasks so results come back through the loop.
    event_tx: mpsc::Sender<DaemonEvent>,
    clock: fn() -> NaiveDateTime,
    make_client: fn() -> Result<reqwest::Client, FetchError>,

    timers: TimerRegistry<CoreTimer>,
    scheduler: PrayerScheduler,
    reminder: Reminder<F>,
    supervisor: StreamSupervisor<F>,

    http: Option<reqwest::Client>,
    client_retry: Retry,
    fetch_retry: Retry,
    fetch_task: Option<tokio::task::JoinHandle<()>>,
    fetch_generation: u64,
    /// Day of the last successful fetch.
    fetched_on: Option<NaiveDate>,
    /// Day a date-change refetch was last started.
    daily_attempt: Option<NaiveDate>,
    load_failed: bool,

    refresh_timer: Option<TimerId>,
    display_text: String,
    next: Option<NextPrayer>,
    last_published: Option<PanelStatus>,
    destroyed: bool,
}

impl<F: PipelineFactory + Clone> DaemonCore<F> {
    pub fn new(
        config: Config,
        state_manager: Arc<StateManager>,
        factory: F,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
        bus_tx: mpsc::UnboundedSender<BusEnvelope>,
    ) -> Self {
        let mut reminder = Reminder::new(factory.clone(), config.prayer.sound_file.clone());
        reminder.set_notifications_enabled(config.prayer.notifications_enabled);
        reminder.set_sound_enabled(config.prayer.sound_enabled);
        let language = config.prayer.language;

        Self {
            config,
            persist_settings: false,
            state_manager,
            broadcast_tx,
            event_tx,
            clock: local_now,
            make_client: fetch::build_client,
            timers: TimerRegistry::new(),
            scheduler: PrayerScheduler::new(language),
            reminder,
            supervisor: StreamSupervisor::new(factory, bus_tx),
            http: None,
            client_retry: Retry::new(fetch::RETRY_DELAY, Some(fetch::MAX_RETRIES)),
            fetch_retry: Retry::new(fetch::RETRY_DELAY, Some(fetch::MAX_RETRIES)),
            fetch_task: None,
            fetch_generation: 0,
            fetched_on: None,
            daily_attempt: None,
            load_failed: false,
            refresh_timer: None,
            display_text: language.loading_text().to_string(),
            next: None,
            last_published: None,
            destroyed: false,
        }
    }

    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist_settings = persist;
        self
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every event sender is gone.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<DaemonEvent>,
        mut bus_rx: mpsc::UnboundedReceiver<BusEnvelope>,
    ) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.start_updating(Instant::now());
        self.publish().await;

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("DaemonCore: event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("DaemonCore: shutdown requested");
                        break;
                    }
                    Some(evt) => self.handle_event(evt, Instant::now()),
                },
                Some(envelope) = bus_rx.recv() => {
                    self.supervisor.on_bus(envelope, &mut self.timers, Instant::now());
                }
                _ = sleep_until(deadline) => self.dispatch_due(Instant::now()),
            }
            self.publish().await;
        }

        self.shutdown();
        self.publish().await;
        Ok(())
    }

    fn handle_event(&mut self, evt: DaemonEvent, now: Instant) {
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                self.handle_command(cmd, now);
            }
            DaemonEvent::ScheduleFetched {
                generation,
                city,
                result,
            } => self.on_fetched(generation, city, result, now),
            DaemonEvent::Shutdown => self.shutdown(),
        }
    }

    fn dispatch_due(&mut self, now: Instant) {
        for (id, timer) in self.timers.pop_due(now) {
            if self.destroyed {
                break;
            }
            match timer {
                CoreTimer::DisplayRefresh => self.refresh_display(now),
                CoreTimer::FetchRetry => {
                    if self.fetch_retry.fired(id) {
                        self.start_fetch(now);
                    }
                }
                CoreTimer::ClientInit => {
                    if !self.client_retry.fired(id) {
                        continue;
                    }
                    if self.init_client(now) {
                        self.start_fetch(now);
                    } else if self.client_retry.is_exhausted() {
                        self.refresh_display(now);
                    }
                }
                CoreTimer::Stream(t) => self.supervisor.on_timer(t, id, &mut self.timers, now),
                CoreTimer::Reminder(t) => {
                    let mut sink = BroadcastSink(&self.broadcast_tx);
                    self.reminder.on_timer(t, &mut sink);
                }
            }
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command, now: Instant) {
        if self.destroyed {
            return;
        }
        match cmd {
            Command::GetStatus => {}
            Command::ToggleRadio { station_id } => {
                let id = if station_id.is_empty() {
                    self.config.radio.station.clone()
                } else {
                    station_id
                };
                let Some(station) = self.state_manager.station(&id).cloned() else {
                    warn!("DaemonCore: unknown station {}", id);
                    return;
                };
                if let Err(e) = self.supervisor.toggle(station, &mut self.timers, now) {
                    error!("DaemonCore: cannot play {}: {}", id, e);
                }
                if self.config.radio.station != id {
                    self.config.radio.station = id;
                    self.save_config();
                }
            }
            Command::StopRadio => self.supervisor.stop(&mut self.timers),
            Command::SelectCity { name } => {
                if self.state_manager.city(&name).is_none() {
                    warn!("DaemonCore: unknown city {}", name);
                    return;
                }
                if self.config.prayer.city != name {
                    info!("DaemonCore: city changed to {}", name);
                    self.config.prayer.city = name;
                    self.save_config();
                }
                self.refetch(now);
            }
            Command::RefreshSchedule => self.refetch(now),
            Command::SetNotifications { enabled } => {
                self.config.prayer.notifications_enabled = enabled;
                self.reminder.set_notifications_enabled(enabled);
                self.save_config();
            }
            Command::SetSound { enabled } => {
                self.config.prayer.sound_enabled = enabled;
                self.reminder.set_sound_enabled(enabled);
                self.save_config();
            }
            Command::SetLanguage { language } => {
                self.config.prayer.language = language;
                self.scheduler.set_language(language);
                self.save_config();
                self.refresh_display(now);
            }
        }
    }

    fn save_config(&self) {
        if !self.persist_settings {
            return;
        }
        if let Err(e) = self.config.save() {
            warn!("DaemonCore: failed to save config: {}", e);
        }
    }

    // ── schedule fetch ────────────────────────────────────────────────────────

    fn start_updating(&mut self, now: Instant) {
        self.start_fetch(now);
        self.timers.cancel_slot(&mut self.refresh_timer);
        match self
            .timers
            .schedule_every(now, DISPLAY_REFRESH, CoreTimer::DisplayRefresh)
        {
            Ok(id) => self.refresh_timer = Some(id),
            Err(e) => warn!("DaemonCore: display refresh not armed: {}", e),
        }
        self.refresh_display(now);
    }

    fn refetch(&mut self, now: Instant) {
        self.fetch_retry.cancel(&mut self.timers);
        self.fetch_retry.reset();
        self.client_retry.reset();
        self.load_failed = false;
        self.start_fetch(now);
    }

    /// Build the HTTP client.  On failure a bounded retry is armed.
    fn init_client(&mut self, now: Instant) -> bool {
        match (self.make_client)() {
            Ok(client) => {
                self.http = Some(client);
                self.client_retry.reset();
                true
            }
            Err(e) => {
                warn!("DaemonCore: {}", e);
                match self
                    .client_retry
                    .schedule(&mut self.timers, now, CoreTimer::ClientInit)
                {
                    Ok(RetryDecision::Exhausted) => {
                        error!("DaemonCore: giving up on HTTP client");
                        self.load_failed = true;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("DaemonCore: client retry not armed: {}", e),
                }
                false
            }
        }
    }

    fn start_fetch(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }
        let city_name = self.config.prayer.city.clone();
        let Some(city) = self.state_manager.city(&city_name).cloned() else {
            warn!("DaemonCore: city not found: {}", city_name);
            self.load_failed = true;
            return;
        };
        if self.http.is_none() && !self.init_client(now) {
            return;
        }
        let Some(client) = self.http.clone() else {
            return;
        };
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }

        self.fetch_generation += 1;
        let generation = self.fetch_generation;
        let tx = self.event_tx.clone();
        info!("DaemonCore: fetching schedule for {}", city.name);
        self.fetch_task = Some(tokio::spawn(async move {
            let result = fetch::fetch_schedule(&client, &city.url).await;
            let _ = tx
                .send(DaemonEvent::ScheduleFetched {
                    generation,
                    city: city.name,
                    result,
                })
                .await;
        }));
    }

    fn on_fetched(
        &mut self,
        generation: u64,
        city: String,
        result: Result<Vec<(PrayerKey, TimeOfDay)>, FetchError>,
        now: Instant,
    ) {
        if self.destroyed
            || generation != self.fetch_generation
            || city != self.config.prayer.city
        {
            debug!(
                "DaemonCore: dropping stale schedule for {} (generation {})",
                city, generation
            );
            return;
        }
        self.fetch_task = None;
        match result {
            Ok(entries) => match self.scheduler.load_schedule(entries) {
                Ok(()) => {
                    self.fetch_retry.reset();
                    self.load_failed = false;
                    self.fetched_on = Some((self.clock)().date());
                    self.refresh_display(now);
                }
                Err(e) => {
                    warn!("DaemonCore: rejected schedule for {}: {}", city, e);
                    self.fetch_failed(now);
                }
            },
            Err(e) => {
                warn!("DaemonCore: fetch for {} failed: {}", city, e);
                self.fetch_failed(now);
            }
        }
    }

    fn fetch_failed(&mut self, now: Instant) {
        match self
            .fetch_retry
            .schedule(&mut self.timers, now, CoreTimer::FetchRetry)
        {
            Ok(RetryDecision::Scheduled(_)) => info!(
                "DaemonCore: retrying fetch in {:?} ({}/{})",
                fetch::RETRY_DELAY,
                self.fetch_retry.attempts(),
                fetch::MAX_RETRIES
            ),
            Ok(RetryDecision::AlreadyPending) => {}
            Ok(RetryDecision::Exhausted) => {
                error!(
                    "DaemonCore: giving up on schedule after {} retries",
                    fetch::MAX_RETRIES
                );
                self.load_failed = true;
                self.refresh_display(now);
            }
            Err(e) => warn!("DaemonCore: fetch retry not armed: {}", e),
        }
    }

    // ── display ───────────────────────────────────────────────────────────────

    fn refresh_display(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }
        let wall = (self.clock)();
        let today = wall.date();
        if let Some(day) = self.fetched_on {
            if day != today
                && self.daily_attempt != Some(today)
                && self.fetch_task.is_none()
                && !self.fetch_retry.is_pending()
            {
                info!("DaemonCore: new day, refreshing schedule");
                self.daily_attempt = Some(today);
                self.refetch(now);
            }
        }

        match self.scheduler.refresh(wall, self.reminder.state_mut()) {
            Some(refresh) => {
                self.display_text = refresh.text;
                self.next = Some(refresh.next);
                if refresh.notify.fire {
                    let label = self.scheduler.label(refresh.next.key);
                    let mut sink = BroadcastSink(&self.broadcast_tx);
                    self.reminder.fire(
                        label,
                        refresh.left.total_minutes,
                        &mut sink,
                        &mut self.timers,
                        now,
                    );
                }
            }
            None => {
                self.next = None;
                let language = self.scheduler.language();
                self.display_text = if self.load_failed {
                    language.load_failed_text()
                } else {
                    language.loading_text()
                }
                .to_string();
            }
        }
    }

    fn build_status(&self) -> PanelStatus {
        let label = |key: PrayerKey| self.scheduler.label(key).to_string();
        PanelStatus {
            rev: 0,
            display_text: self.display_text.clone(),
            loading: self.fetch_task.is_some(),
            load_failed: self.load_failed,
            schedule: self
                .scheduler
                .schedule()
                .entries()
                .iter()
                .map(|(key, time)| ScheduleEntry {
                    key: *key,
                    label: label(*key),
                    time: *time,
                })
                .collect(),
            next: self.next.map(|n| NextPrayerInfo {
                key: n.key,
                label: label(n.key),
                time: n.time,
                is_next_day: n.is_next_day,
            }),
            stream: self.supervisor.status(),
            settings: SettingsSnapshot {
                city: self.config.prayer.city.clone(),
                notifications_enabled: self.config.prayer.notifications_enabled,
                sound_enabled: self.config.prayer.sound_enabled,
                language: self.config.prayer.language,
                station_id: self.config.radio.station.clone(),
            },
        }
    }

    async fn publish(&mut self) {
        let status = self.build_status();
        if self.last_published.as_ref() == Some(&status) {
            return;
        }
        self.last_published = Some(status.clone());
        self.state_manager.publish(status).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StatusUpdated);
    }

    // ── teardown ──────────────────────────────────────────────────────────────

    /// Cancel every timer first, then release components.  Idempotent.
    fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        info!("DaemonCore: shutting down");
        self.timers.cancel_all();
        self.destroyed = true;
        self.refresh_timer = None;
        self.supervisor.stop(&mut self.timers);
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        self.http = None;
        self.reminder.teardown(&mut self.timers);
        self.scheduler.teardown();
        self.next = None;
    }
}

// ── station and city loaders ──────────────────────────────────────────────────

fn beside_exe(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let path = exe.parent()?.join(name);
    path.exists().then_some(path)
}

/// Stations from, in order: the configured TOML file, `stations.toml` beside
/// the executable, `stations.m3u` in the config dir, the inline config list.
pub fn load_stations(config: &Config) -> Vec<Station> {
    let mut toml_paths = vec![config.radio.stations_toml.clone()];
    toml_paths.extend(beside_exe("stations.toml"));
    for path in toml_paths.iter().filter(|p| p.exists()) {
        match load_stations_from_toml(path) {
            Ok(s) if !s.is_empty() => {
                info!("Loaded {} stations from TOML: {}", s.len(), path.display());
                return s;
            }
            Ok(_) => warn!("No stations in {}", path.display()),
            Err(e) => warn!("Failed to parse {}: {}", path.display(), e),
        }
    }

    let m3u = vakit_proto::platform::config_dir().join("stations.m3u");
    if m3u.exists() {
        match load_stations_from_m3u(&m3u) {
            Ok(s) if !s.is_empty() => {
                info!("Loaded {} stations from m3u: {}", s.len(), m3u.display());
                return s;
            }
            Ok(_) => warn!("No stations in {}", m3u.display()),
            Err(e) => warn!("Failed to parse {}: {}", m3u.display(), e),
        }
    }

    info!("Using {} stations from config", config.stations.len());
    config.stations.clone()
}

/// Cities from the configured TOML file, `cities.toml` beside the
/// executable, or the inline config list.
pub fn load_cities(config: &Config) -> Vec<City> {
    let mut paths = vec![config.prayer.cities_toml.clone()];
    paths.extend(beside_exe("cities.toml"));
    for path in paths.iter().filter(|p| p.exists()) {
        match load_cities_from_toml(path) {
            Ok(c) if !c.is_empty() => {
                info!("Loaded {} cities from TOML: {}", c.len(), path.display());
                return c;
            }
            Ok(_) => warn!("No cities in {}", path.display()),
            Err(e) => warn!("Failed to parse {}: {}", path.display(), e),
        }
    }
    info!("Using {} cities from config", config.cities.len());
    config.cities.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fake::FakeFactory;
    use chrono::NaiveDate;
    use std::time::Duration;
    use vakit_proto::protocol::StreamState;

    struct Fixture {
        core: DaemonCore<FakeFactory>,
        factory: FakeFactory,
        broadcast_rx: broadcast::Receiver<BroadcastMessage>,
        _event_rx: mpsc::Receiver<DaemonEvent>,
        _bus_rx: mpsc::UnboundedReceiver<BusEnvelope>,
    }

    fn at_1805() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 11)
            .unwrap()
            .and_hms_opt(18, 5, 0)
            .unwrap()
    }

    fn fixture(cities: Vec<City>) -> Fixture {
        let mut config = Config::default();
        config.prayer.sound_file = PathBuf::from("/nonexistent/call.mp3");
        let stations = vec![Station {
            id: "herkulfm".into(),
            name: "HerkulFM".into(),
            urls: vec!["http://a".into(), "http://b".into()],
        }];
        let state_manager = Arc::new(StateManager::new(stations, cities));
        let (broadcast_tx, broadcast_rx) = broadcast::channel(64);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let factory = FakeFactory::default();
        let mut core = DaemonCore::new(
            config,
            state_manager,
            factory.clone(),
            broadcast_tx,
            event_tx,
            bus_tx,
        );
        core.clock = at_1805;
        Fixture {
            core,
            factory,
            broadcast_rx,
            _event_rx: event_rx,
            _bus_rx: bus_rx,
        }
    }

    fn istanbul() -> City {
        City {
            name: "İstanbul".into(),
            // closed port: spawned fetches fail fast and are never awaited
            url: "http://127.0.0.1:9/".into(),
        }
    }

    fn day() -> Vec<(PrayerKey, TimeOfDay)> {
        ["05:30", "07:00", "12:45", "15:45", "18:20", "19:45"]
        .iter()
        .zip(PrayerKey::ALL)
        .map(|(t, k)| (k, t.parse().unwrap()))
        .collect()
    }

    #[tokio::test]
    async fn test_fetched_schedule_drives_display_and_reminder() {
        let mut f = fixture(vec![istanbul()]);
        let now = Instant::now();
        f.core.start_updating(now);
        let generation = f.core.fetch_generation;
        assert_eq!(generation, 1);

        f.core.handle_event(
            DaemonEvent::ScheduleFetched {
                generation,
                city: "İstanbul".into(),
                result: Ok(day()),
            },
            now,
        );
        assert_eq!(f.core.display_text, "Akşam: 0h 15m");
        assert!(!f.core.load_failed);

        let mut reminded = false;
        let mut blinked = false;
        while let Ok(msg) = f.broadcast_rx.try_recv() {
            match msg {
                BroadcastMessage::Reminder {
                    prayer,
                    minutes_left,
                } => {
                    assert_eq!(prayer, "Akşam");
                    assert_eq!(minutes_left, 15);
                    reminded = true;
                }
                BroadcastMessage::Blink(true) => blinked = true,
                _ => {}
            }
        }
        assert!(reminded && blinked);

        let status = f.core.build_status();
        assert_eq!(status.schedule.len(), 6);
        assert_eq!(status.next.map(|n| n.key), Some(PrayerKey::Maghrib));
        assert!(!status.loading);
    }

    #[tokio::test]
    async fn test_stale_fetch_result_is_ignored() {
        let mut f = fixture(vec![istanbul()]);
        let now = Instant::now();
        f.core.start_updating(now);
        f.core.handle_command(Command::RefreshSchedule, now);
        assert_eq!(f.core.fetch_generation, 2);

        f.core.handle_event(
            DaemonEvent::ScheduleFetched {
                generation: 1,
                city: "İstanbul".into(),
                result: Ok(day()),
            },
            now,
        );
        assert!(f.core.scheduler.schedule().is_empty());
        assert!(f.core.fetch_task.is_some());
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_three_retries() {
        let mut f = fixture(vec![istanbul()]);
        let mut now = Instant::now();
        f.core.start_updating(now);

        for _ in 0..3 {
            let generation = f.core.fetch_generation;
            f.core.handle_event(
                DaemonEvent::ScheduleFetched {
                    generation,
                    city: "İstanbul".into(),
                    result: Err(FetchError::Empty),
                },
                now,
            );
            assert!(f.core.fetch_retry.is_pending());
            now += fetch::RETRY_DELAY;
            f.core.dispatch_due(now);
            assert_eq!(f.core.fetch_generation, generation + 1);
        }

        let generation = f.core.fetch_generation;
        f.core.handle_event(
            DaemonEvent::ScheduleFetched {
                generation,
                city: "İstanbul".into(),
                result: Err(FetchError::Empty),
            },
            now,
        );
        assert!(f.core.load_failed);
        assert!(!f.core.fetch_retry.is_pending());
        assert_eq!(f.core.display_text, "Namaz vakitleri yüklenemedi");
    }

    fn next_day_0900() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 12)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn fail_fetch(f: &mut Fixture, now: Instant) {
        let generation = f.core.fetch_generation;
        f.core.handle_event(
            DaemonEvent::ScheduleFetched {
                generation,
                city: "İstanbul".into(),
                result: Err(FetchError::Empty),
            },
            now,
        );
    }

    #[tokio::test]
    async fn test_date_change_refetches_once_per_day() {
        let mut f = fixture(vec![istanbul()]);
        let mut now = Instant::now();
        f.core.start_updating(now);
        f.core.handle_event(
            DaemonEvent::ScheduleFetched {
                generation: 1,
                city: "İstanbul".into(),
                result: Ok(day()),
            },
            now,
        );

        // same day: nothing new
        f.core.refresh_display(now);
        assert_eq!(f.core.fetch_generation, 1);

        f.core.clock = next_day_0900;
        f.core.refresh_display(now);
        assert_eq!(f.core.fetch_generation, 2);
        f.core.refresh_display(now);
        assert_eq!(f.core.fetch_generation, 2);

        // the new day's fetch keeps failing until the budget is gone
        for _ in 0..fetch::MAX_RETRIES {
            fail_fetch(&mut f, now);
            now += fetch::RETRY_DELAY;
            f.core.dispatch_due(now);
        }
        fail_fetch(&mut f, now);
        assert!(f.core.load_failed);
        let generation = f.core.fetch_generation;
        assert_eq!(generation, 2 + u64::from(fetch::MAX_RETRIES));

        // no second automatic attempt on the same date
        f.core.refresh_display(now);
        assert_eq!(f.core.fetch_generation, generation);
        // yesterday's table is still shown
        assert_eq!(f.core.display_text, "Öğle: 3h 45m");
    }

    fn broken_client() -> Result<reqwest::Client, FetchError> {
        Err(FetchError::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR))
    }

    #[tokio::test]
    async fn test_client_init_retries_then_gives_up() {
        let mut f = fixture(vec![istanbul()]);
        f.core.make_client = broken_client;
        let mut now = Instant::now();
        f.core.start_updating(now);
        assert_eq!(f.core.fetch_generation, 0);
        assert!(f.core.client_retry.is_pending());

        for attempt in 1..=fetch::MAX_RETRIES {
            assert_eq!(f.core.client_retry.attempts(), attempt);
            now += fetch::RETRY_DELAY;
            f.core.dispatch_due(now);
        }
        assert!(f.core.client_retry.is_exhausted());
        assert!(f.core.load_failed);
        assert_eq!(f.core.fetch_generation, 0);
        assert_eq!(f.core.display_text, "Namaz vakitleri yüklenemedi");

        // a manual refresh gets a fresh budget
        f.core.make_client = fetch::build_client;
        f.core.handle_command(Command::RefreshSchedule, now);
        assert!(f.core.http.is_some());
        assert_eq!(f.core.fetch_generation, 1);
        assert!(!f.core.load_failed);
    }

    #[tokio::test]
    async fn test_client_init_recovers_on_retry() {
        let mut f = fixture(vec![istanbul()]);
        f.core.make_client = broken_client;
        let now = Instant::now();
        f.core.start_updating(now);
        assert!(f.core.http.is_none());

        f.core.make_client = fetch::build_client;
        f.core.dispatch_due(now + fetch::RETRY_DELAY);
        assert!(f.core.http.is_some());
        assert_eq!(f.core.fetch_generation, 1);
        assert_eq!(f.core.client_retry.attempts(), 0);
    }

    #[tokio::test]
    async fn test_unknown_city_fails_without_fetching() {
        let mut f = fixture(Vec::new());
        f.core.start_updating(Instant::now());
        assert!(f.core.load_failed);
        assert_eq!(f.core.fetch_generation, 0);
        assert!(f.core.fetch_task.is_none());
    }

    #[tokio::test]
    async fn test_radio_toggle_and_settings() {
        let mut f = fixture(Vec::new());
        let now = Instant::now();
        f.core.handle_command(
            Command::ToggleRadio {
                station_id: String::new(),
            },
            now,
        );
        assert_eq!(f.core.supervisor.state(), StreamState::Starting);

        f.core.handle_command(
            Command::SetLanguage {
                language: vakit_proto::prayer::Language::En,
            },
            now,
        );
        f.core.handle_command(Command::SetSound { enabled: false }, now);
        let status = f.core.build_status();
        assert_eq!(status.settings.language, vakit_proto::prayer::Language::En);
        assert!(!status.settings.sound_enabled);
        assert_eq!(status.stream.station_id.as_deref(), Some("herkulfm"));

        f.core.handle_command(
            Command::ToggleRadio {
                station_id: "herkulfm".into(),
            },
            now,
        );
        assert_eq!(f.core.supervisor.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let mut f = fixture(vec![istanbul()]);
        let now = Instant::now();
        f.core.start_updating(now);
        f.core.handle_command(
            Command::ToggleRadio {
                station_id: String::new(),
            },
            now,
        );
        assert!(f.core.timers.len() >= 2);

        f.core.shutdown();
        assert!(f.core.timers.is_empty());
        assert!(f.core.timers.is_closed());
        assert!(f.core.fetch_task.is_none());
        assert_eq!(f.core.supervisor.state(), StreamState::Stopped);
        assert_eq!(f.factory.log.borrow().active_watches, 0);

        // nothing re-arms afterwards
        f.core.dispatch_due(now + Duration::from_secs(3600));
        f.core.handle_command(
            Command::ToggleRadio {
                station_id: String::new(),
            },
            now,
        );
        assert!(f.core.timers.is_empty());
        f.core.shutdown();
    }

    #[tokio::test]
    async fn test_publish_skips_unchanged_snapshots() {
        let mut f = fixture(Vec::new());
        f.core.publish().await;
        f.core.publish().await;
        let mut updates = 0;
        while let Ok(msg) = f.broadcast_rx.try_recv() {
            if matches!(msg, BroadcastMessage::StatusUpdated) {
                updates += 1;
            }
        }
        assert_eq!(updates, 1);
        assert_eq!(f.core.state_manager.get_status().await.rev, 2);
    }
}
