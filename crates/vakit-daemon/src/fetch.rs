//! Prayer-times page download and extraction.
//!
//! The source is a city page on namazvakitleri.diyanet.gov.tr.  Each prayer
//! is one `tpt-cell` block whose `data-vakit-name` names the prayer and whose
//! nested `tpt-time` div holds `HH:MM`.

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL};
use reqwest::{Client, StatusCode};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use vakit_proto::prayer::{PrayerKey, TimeOfDay};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RETRIES: u32 = 3;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error {0}")]
    Status(StatusCode),

    #[error("no prayer times found in page")]
    Empty,
}

pub fn build_client() -> Result<Client, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("tr-TR,tr"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(FetchError::Client)
}

pub async fn fetch_schedule(
    client: &Client,
    url: &str,
) -> Result<Vec<(PrayerKey, TimeOfDay)>, FetchError> {
    debug!("fetch: GET {}", url);
    let response = client.get(url).send().await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(FetchError::Status(status));
    }
    let body = response.text().await?;
    let entries = extract_schedule(&body);
    if entries.is_empty() {
        return Err(FetchError::Empty);
    }
    info!("fetch: {} prayer times from {}", entries.len(), url);
    Ok(entries)
}

fn cell_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(
            r#"<div class="tpt-cell" data-vakit-name="([^"]+)"[^>]*>[\s\S]*?<div class="tpt-time">(\d{2}:\d{2})</div>"#,
        )
        .expect("prayer cell pattern is valid")
    })
}

/// Pairs in page order.  Unknown names and malformed times are skipped, and
/// only the first cell per prayer counts.
pub fn extract_schedule(html: &str) -> Vec<(PrayerKey, TimeOfDay)> {
    let mut out: Vec<(PrayerKey, TimeOfDay)> = Vec::new();
    for caps in cell_regex().captures_iter(html) {
        let name = &caps[1];
        let Some(key) = PrayerKey::from_vakit_name(name) else {
            debug!("fetch: skipping unknown prayer {:?}", name);
            continue;
        };
        let time = match caps[2].parse::<TimeOfDay>() {
            Ok(t) => t,
            Err(e) => {
                debug!("fetch: skipping {:?}: {}", name, e);
                continue;
            }
        };
        if out.iter().any(|(k, _)| *k == key) {
            continue;
        }
        out.push((key, time));
    }
    out
}
