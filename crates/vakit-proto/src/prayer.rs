//! Prayer names and minute-precision times of day.

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The six daily time points, in their natural chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrayerKey {
    Fajr,
    Sunrise,
    Dhuhr,
    Asr,
    Maghrib,
    Isha,
}

impl PrayerKey {
    pub const ALL: [PrayerKey; 6] = [
        PrayerKey::Fajr,
        PrayerKey::Sunrise,
        PrayerKey::Dhuhr,
        PrayerKey::Asr,
        PrayerKey::Maghrib,
        PrayerKey::Isha,
    ];

    /// Map the `data-vakit-name` attribute used by the schedule site.
    pub fn from_vakit_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "imsak" => Some(Self::Fajr),
            "gunes" => Some(Self::Sunrise),
            "ogle" => Some(Self::Dhuhr),
            "ikindi" => Some(Self::Asr),
            "aksam" => Some(Self::Maghrib),
            "yatsi" => Some(Self::Isha),
            _ => None,
        }
    }

    pub fn vakit_name(&self) -> &'static str {
        match self {
            Self::Fajr => "imsak",
            Self::Sunrise => "gunes",
            Self::Dhuhr => "ogle",
            Self::Asr => "ikindi",
            Self::Maghrib => "aksam",
            Self::Isha => "yatsi",
        }
    }

    pub fn label(&self, language: Language) -> &'static str {
        match language {
            Language::Tr => match self {
                Self::Fajr => "İmsak",
                Self::Sunrise => "Güneş",
                Self::Dhuhr => "Öğle",
                Self::Asr => "İkindi",
                Self::Maghrib => "Akşam",
                Self::Isha => "Yatsı",
            },
            Language::En => match self {
                Self::Fajr => "Fajr",
                Self::Sunrise => "Sunrise",
                Self::Dhuhr => "Dhuhr",
                Self::Asr => "Asr",
                Self::Maghrib => "Maghrib",
                Self::Isha => "Isha",
            },
        }
    }
}

/// Display language for prayer labels and status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Tr,
    En,
}

impl Language {
    pub fn loading_text(&self) -> &'static str {
        match self {
            Self::Tr => "Yükleniyor...",
            Self::En => "Loading...",
        }
    }

    pub fn load_failed_text(&self) -> &'static str {
        match self {
            Self::Tr => "Namaz vakitleri yüklenemedi",
            Self::En => "Failed to load prayer times",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?}, expected zero-padded HH:MM")]
pub struct TimeParseError(pub String);

/// Minute-precision wall-clock time.  Ordering matches lexicographic order of
/// the zero-padded `HH:MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub const MINUTES_PER_DAY: i32 = 24 * 60;

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Truncates seconds, the same way the panel clock does.
    pub fn of<T: Timelike>(t: &T) -> Self {
        Self {
            hour: t.hour() as u8,
            minute: t.minute() as u8,
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn minutes_since_midnight(&self) -> i32 {
        self.hour as i32 * 60 + self.minute as i32
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeParseError(s.to_string());
        let b = s.as_bytes();
        if b.len() != 5 || b[2] != b':' {
            return Err(err());
        }
        let digit = |c: u8| c.is_ascii_digit().then(|| c - b'0').ok_or_else(err);
        let hour = digit(b[0])? * 10 + digit(b[1])?;
        let minute = digit(b[3])? * 10 + digit(b[4])?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let t: TimeOfDay = "05:07".parse().unwrap();
        assert_eq!(t.hour(), 5);
        assert_eq!(t.minute(), 7);
        assert_eq!(t.to_string(), "05:07");
        assert_eq!(t.minutes_since_midnight(), 307);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["5:07", "24:00", "12:60", "12-30", "ab:cd", "", "12:301"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_ordering_matches_string_ordering() {
        let samples = ["00:00", "05:00", "06:30", "12:30", "15:45", "18:20", "19:45", "23:59"];
        for a in samples {
            for b in samples {
                let ta: TimeOfDay = a.parse().unwrap();
                let tb: TimeOfDay = b.parse().unwrap();
                assert_eq!(ta.cmp(&tb), a.cmp(b), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_vakit_names_round_trip() {
        for key in PrayerKey::ALL {
            assert_eq!(PrayerKey::from_vakit_name(key.vakit_name()), Some(key));
        }
        assert_eq!(PrayerKey::from_vakit_name("Aksam"), Some(PrayerKey::Maghrib));
        assert_eq!(PrayerKey::from_vakit_name("teheccud"), None);
    }

    #[test]
    fn test_serde_uses_hh_mm_string() {
        let t = TimeOfDay::new(9, 5).unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"09:05\"");
        let back: TimeOfDay = serde_json::from_str("\"19:45\"").unwrap();
        assert_eq!(back, TimeOfDay::new(19, 45).unwrap());
        assert!(serde_json::from_str::<TimeOfDay>("\"7:45\"").is_err());
    }
}
