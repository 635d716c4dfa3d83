use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;
use crate::prayer::Language;
use crate::protocol::{City, Station};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub prayer: PrayerConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    /// Inline station list, used when `radio.stations_toml` does not exist.
    #[serde(default = "default_stations")]
    pub stations: Vec<Station>,
    /// Inline city list, used when `prayer.cities_toml` does not exist.
    #[serde(default = "default_cities")]
    pub cities: Vec<City>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Settings the preferences UI can change at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrayerConfig {
    #[serde(default = "default_city")]
    pub city: String,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    #[serde(default)]
    pub language: Language,
    /// Played once when a reminder fires.
    #[serde(default = "default_sound_file")]
    pub sound_file: PathBuf,
    /// Optional TOML file with `[[city]]` tables (takes priority over `cities`).
    #[serde(default = "default_cities_toml")]
    pub cities_toml: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Station id toggled when a client does not name one.
    #[serde(default = "default_station")]
    pub station: String,
    /// Optional TOML file with `[[station]]` tables (takes priority over `stations`).
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PrayerConfig {
    fn default() -> Self {
        Self {
            city: default_city(),
            notifications_enabled: true,
            sound_enabled: true,
            language: Language::default(),
            sound_file: default_sound_file(),
            cities_toml: default_cities_toml(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            station: default_station(),
            stations_toml: default_stations_toml(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_http_enabled() -> bool {
    false
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_true() -> bool {
    true
}

fn default_city() -> String {
    "İstanbul".to_string()
}

fn default_sound_file() -> PathBuf {
    platform::data_dir().join("sounds").join("call.mp3")
}

fn default_cities_toml() -> PathBuf {
    platform::config_dir().join("cities.toml")
}

fn default_station() -> String {
    "herkulfm".to_string()
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_stations() -> Vec<Station> {
    vec![Station {
        id: "herkulfm".to_string(),
        name: "HerkulFM".to_string(),
        urls: vec!["https://s1.wohooo.net/proxy/herkulfo/stream".to_string()],
    }]
}

fn default_cities() -> Vec<City> {
    [
        ("İstanbul", "9541/istanbul-icin-namaz-vakti"),
        ("Ankara", "9206/ankara-icin-namaz-vakti"),
        ("İzmir", "9560/izmir-icin-namaz-vakti"),
    ]
    .into_iter()
    .map(|(name, path)| City {
        name: name.to_string(),
        url: format!("https://namazvakitleri.diyanet.gov.tr/tr-TR/{}", path),
    })
    .collect()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            prayer: PrayerConfig::default(),
            radio: RadioConfig::default(),
            stations: default_stations(),
            cities: default_cities(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.prayer.city, "İstanbul");
        assert!(config.prayer.notifications_enabled);
        assert_eq!(config.radio.station, "herkulfm");
        assert_eq!(config.stations.len(), 1);
        assert!(config.stations[0].urls[0].starts_with("https://"));
        assert!(config.radio.stations_toml.ends_with("vakit/stations.toml"));
        assert!(config.cities.iter().any(|c| c.name == config.prayer.city));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [prayer]
            city = "Ankara"
            sound_enabled = false
            language = "en"
            "#,
        )
        .unwrap();
        assert_eq!(config.prayer.city, "Ankara");
        assert!(!config.prayer.sound_enabled);
        assert!(config.prayer.notifications_enabled);
        assert_eq!(config.prayer.language, Language::En);
        assert_eq!(config.stations[0].id, "herkulfm");
    }

    #[test]
    fn test_save_format_reloads() {
        let mut config = Config::default();
        config.cities.push(City {
            name: "Bursa".into(),
            url: "https://example.org/bursa".into(),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.cities, config.cities);
        assert_eq!(back.stations, config.stations);
    }
}
