//! Remote manifest API client.
//!
//! The manifest endpoint returns campaign units for an environment; each
//! active campaign carries one or more media URLs and a fixed exposure
//! time. The client flattens that into the ordered entry list the playlist
//! resolver consumes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("manifest endpoint returned HTTP {0}")]
    HttpStatus(u16),

    #[error("manifest response was not valid JSON: {0}")]
    Decode(reqwest::Error),

    #[error("no api_url configured")]
    NotConfigured,
}

/// One flattened manifest entry, in playback order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub url: String,
    pub exposure_ms: i64,
    pub campaign_id: String,
    pub campaign_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestRequest<'a> {
    environment_id: &'a str,
    only_standby: bool,
    search_in: &'a str,
    include_descendants: bool,
    limit: u32,
}

#[derive(Deserialize)]
struct ManifestResponse {
    #[serde(default)]
    units: Vec<Unit>,
}

#[derive(Deserialize)]
struct Unit {
    #[serde(default)]
    campaigns: Vec<Campaign>,
}

#[derive(Deserialize)]
struct Campaign {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    exposure_time_ms: Option<i64>,
    #[serde(default)]
    media_urls: Option<Vec<String>>,
    #[serde(default)]
    primary_media_url: Option<String>,
}

#[derive(Clone)]
pub struct ManifestClient {
    client: reqwest::Client,
}

impl ManifestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch and flatten the manifest. Campaign entries whose status is
    /// neither empty nor active are skipped; a campaign without
    /// `media_urls` falls back to its primary media URL.
    pub async fn fetch(&self, config: &Config) -> Result<Vec<ManifestEntry>, ManifestError> {
        if config.api_url.is_empty() {
            return Err(ManifestError::NotConfigured);
        }
        let response = self
            .client
            .post(&config.api_url)
            .header("x-api-key", &config.api_key)
            .timeout(Duration::from_secs(config.request_timeout_sec.max(1)))
            .json(&ManifestRequest {
                environment_id: &config.environment_id,
                only_standby: config.only_standby,
                search_in: &config.search_in,
                include_descendants: config.include_descendants,
                limit: config.limit,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ManifestError::HttpStatus(status.as_u16()));
        }
        let body: ManifestResponse = response.json().await.map_err(ManifestError::Decode)?;
        Ok(flatten(body, i64::from(config.default_exposure_ms)))
    }
}

fn campaign_is_active(status: Option<&str>) -> bool {
    match status {
        None => true,
        Some(s) => {
            let s = s.to_lowercase();
            s.is_empty() || s == "active" || s == "ativa"
        }
    }
}

fn flatten(body: ManifestResponse, default_exposure_ms: i64) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for unit in body.units {
        for campaign in unit.campaigns {
            if !campaign_is_active(campaign.status.as_deref()) {
                continue;
            }
            let exposure_ms = campaign
                .exposure_time_ms
                .filter(|&ms| ms > 0)
                .unwrap_or(default_exposure_ms);
            let campaign_id = campaign
                .id
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let campaign_name = campaign.name.unwrap_or_default();
            let urls = match campaign.media_urls {
                Some(urls) if !urls.is_empty() => urls,
                _ => campaign.primary_media_url.into_iter().collect(),
            };
            for url in urls {
                if url.is_empty() {
                    continue;
                }
                entries.push(ManifestEntry {
                    url,
                    exposure_ms,
                    campaign_id: campaign_id.clone(),
                    campaign_name: campaign_name.clone(),
                });
            }
        }
    }
    entries
}

/// Probe whether the API host accepts TCP connections at all.
///
/// Used to distinguish "network is down" (offline age limits may be
/// waived) from "API answered badly" (they may not). A single short
/// connect; a flaky link that happens to accept the probe counts as
/// reachable.
pub async fn endpoint_reachable(api_url: &str, timeout: Duration) -> bool {
    let Ok(url) = reqwest::Url::parse(api_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> ManifestResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn flattens_units_and_campaigns_in_order() {
        let body = parse(
            r#"{"units": [{"campaigns": [
                {"id": 7, "name": "spring", "status": "active",
                 "exposure_time_ms": 8000,
                 "media_urls": ["https://cdn/a.mp4", "https://cdn/b.jpg"]},
                {"id": "x", "name": "fall", "status": "paused",
                 "media_urls": ["https://cdn/ignored.mp4"]}
            ]}]}"#,
        );
        let entries = flatten(body, 10_000);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://cdn/a.mp4");
        assert_eq!(entries[0].exposure_ms, 8000);
        assert_eq!(entries[0].campaign_id, "7");
        assert_eq!(entries[1].url, "https://cdn/b.jpg");
    }

    #[test]
    fn primary_media_url_is_the_fallback() {
        let body = parse(
            r#"{"units": [{"campaigns": [
                {"name": "solo", "primary_media_url": "https://cdn/only.mp4"}
            ]}]}"#,
        );
        let entries = flatten(body, 10_000);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://cdn/only.mp4");
        // No exposure given: default applies.
        assert_eq!(entries[0].exposure_ms, 10_000);
    }

    #[test]
    fn missing_units_decode_as_empty() {
        let entries = flatten(parse("{}"), 10_000);
        assert!(entries.is_empty());
    }

    #[test]
    fn nonpositive_exposure_takes_default() {
        let body = parse(
            r#"{"units": [{"campaigns": [
                {"exposure_time_ms": 0, "media_urls": ["https://cdn/a.mp4"]}
            ]}]}"#,
        );
        assert_eq!(flatten(body, 10_000)[0].exposure_ms, 10_000);
    }

    #[tokio::test]
    async fn unreachable_endpoint_probes_false() {
        assert!(!endpoint_reachable("http://127.0.0.1:1", Duration::from_millis(200)).await);
        assert!(!endpoint_reachable("not a url", Duration::from_millis(200)).await);
    }
}
