use crate::prayer::{Language, PrayerKey, TimeOfDay};
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Panel clients check this on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a panel client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    GetStatus,
    ToggleRadio { station_id: String },
    StopRadio,
    SelectCity { name: String },
    RefreshSchedule,
    SetNotifications { enabled: bool },
    SetSound { enabled: bool },
    SetLanguage { language: Language },
}

/// Messages sent from the daemon to panel clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full status snapshot.
    Hello {
        protocol_version: u32,
        status: PanelStatus,
    },
    Status {
        data: PanelStatus,
    },
    /// A prayer is 15–20 minutes away and the quiet window has elapsed.
    Reminder {
        prayer: String,
        minutes_left: i32,
    },
    /// Start (`on = true`) or stop blinking the panel icon.
    Blink {
        on: bool,
    },
    Log {
        message: String,
    },
}

/// Supervisor state as reported to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Stopped,
    Starting,
    Playing,
    Buffering,
    Failing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamStatus {
    pub state: StreamState,
    pub playing: bool,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub url_index: usize,
    pub total_urls: usize,
    /// Full restarts performed since the user last started playback.
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub key: PrayerKey,
    pub label: String,
    pub time: TimeOfDay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NextPrayerInfo {
    pub key: PrayerKey,
    pub label: String,
    pub time: TimeOfDay,
    pub is_next_day: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SettingsSnapshot {
    pub city: String,
    pub notifications_enabled: bool,
    pub sound_enabled: bool,
    pub language: Language,
    pub station_id: String,
}

/// Everything a panel needs to render.  `rev` is a monotonically increasing
/// counter incremented every time the status changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PanelStatus {
    #[serde(default)]
    pub rev: u64,
    pub display_text: String,
    /// A schedule fetch is in flight.
    pub loading: bool,
    /// Every fetch attempt for the current city failed.
    pub load_failed: bool,
    pub schedule: Vec<ScheduleEntry>,
    pub next: Option<NextPrayerInfo>,
    pub stream: StreamStatus,
    pub settings: SettingsSnapshot,
}

/// A radio station with one or more alternate stream URLs, tried in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub urls: Vec<String>,
}

/// A city and the schedule page it is fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct City {
    pub name: String,
    pub url: String,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
