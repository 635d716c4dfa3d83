use crate::protocol::{City, PanelStatus, Station};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared read-mostly snapshot of what the panel shows.  The daemon core is
/// the only writer; socket and HTTP handlers read.
pub struct StateManager {
    status: Arc<RwLock<PanelStatus>>,
    stations: Vec<Station>,
    cities: Vec<City>,
}

impl StateManager {
    pub fn new(stations: Vec<Station>, cities: Vec<City>) -> Self {
        Self {
            status: Arc::new(RwLock::new(PanelStatus {
                rev: 1,
                ..PanelStatus::default()
            })),
            stations,
            cities,
        }
    }

    pub async fn get_status(&self) -> PanelStatus {
        self.status.read().await.clone()
    }

    /// Replace the snapshot.  The revision only moves forward.
    pub async fn publish(&self, mut status: PanelStatus) {
        let mut guard = self.status.write().await;
        status.rev = guard.rev + 1;
        *guard = status;
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn cities(&self) -> &[City] {
        &self.cities
    }

    pub fn station(&self, id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn city(&self, name: &str) -> Option<&City> {
        self.cities.iter().find(|c| c.name == name)
    }
}

/// Parse an extended m3u playlist.  Consecutive entries that share an
/// `#EXTINF` title become alternate URLs of one station.
pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations: Vec<Station> = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());

        match stations.last_mut() {
            Some(last) if last.name == name => last.urls.push(url),
            _ => stations.push(Station {
                id: station_id_from_name(&name),
                name,
                urls: vec![url],
            }),
        }
    }

    Ok(stations)
}

pub fn load_stations_from_m3u(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

fn station_id_from_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

// ── TOML loaders ──────────────────────────────────────────────────────────────

/// Matches the `[[station]]` tables of a stations file.  Kept separate from
/// `Station` so `id` can default from the name.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
}

pub fn load_stations_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let mut stations = Vec::with_capacity(file.station.len());
    for s in file.station {
        let mut urls = s.urls;
        if let Some(url) = s.url {
            urls.insert(0, url);
        }
        if urls.is_empty() {
            anyhow::bail!("station {:?} has no stream url", s.name);
        }
        let id = if s.id.is_empty() {
            station_id_from_name(&s.name)
        } else {
            s.id
        };
        stations.push(Station {
            id,
            name: s.name,
            urls,
        });
    }
    Ok(stations)
}

#[derive(Debug, serde::Deserialize)]
struct TomlCityFile {
    city: Vec<City>,
}

pub fn load_cities_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<City>> {
    let content = std::fs::read_to_string(path)?;
    parse_cities_from_toml_str(&content)
}

pub fn parse_cities_from_toml_str(content: &str) -> anyhow::Result<Vec<City>> {
    let file: TomlCityFile = toml::from_str(content)?;
    Ok(file.city)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_m3u_groups_alternates() {
        let m3u = "#EXTM3U\n\
                   #EXTINF:-1,Herkul FM\nhttps://a.example/stream\n\
                   #EXTINF:-1,Herkul FM\nhttps://b.example/stream\n\
                   #EXTINF:-1,Other\nhttps://c.example/live\n";
        let stations = parse_m3u_from_str(m3u).unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].id, "herkulfm");
        assert_eq!(stations[0].urls.len(), 2);
        assert_eq!(stations[1].urls, vec!["https://c.example/live".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_bumps_revision() {
        let sm = StateManager::new(Vec::new(), Vec::new());
        let first = sm.get_status().await.rev;
        sm.publish(PanelStatus {
            rev: 0,
            display_text: "x".into(),
            ..PanelStatus::default()
        })
        .await;
        let status = sm.get_status().await;
        assert_eq!(status.rev, first + 1);
        assert_eq!(status.display_text, "x");
    }
}
