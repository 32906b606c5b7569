//! Location enrichment: geocoding an event's venue.
//!
//! Lookups are cached in the store by a hash of the normalized address, and
//! misses are cached too so a bad venue string is not retried every run.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use url::Url;

use recapsync_shared::{GeoPoint, GeocoderConfig, RecapSyncError, Result};
use recapsync_storage::Storage;

/// User-Agent string for geocoding requests.
const USER_AGENT: &str = concat!("recapsync/", env!("CARGO_PKG_VERSION"));

/// Resolves a free-form address to a point.
pub trait Geocoder {
    /// `Ok(None)` means the service answered but found nothing.
    fn geocode(&self, address: &str) -> impl Future<Output = Result<Option<GeoPoint>>>;
}

/// Trim, lowercase, and collapse internal whitespace.
pub fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache key for a normalized address.
fn cache_key(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Google Geocoding API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    formatted_address: String,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// Client for the Google Geocoding JSON endpoint.
#[derive(Debug, Clone)]
pub struct GoogleGeocoder {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RecapSyncError::config(format!("invalid geocoder base_url: {e}")))?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RecapSyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }
}

impl Geocoder for GoogleGeocoder {
    #[instrument(skip_all, fields(address = %address))]
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let response = self
            .client
            .get(self.base_url.clone())
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| RecapSyncError::Network(format!("geocode request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecapSyncError::Network(format!("geocoder: HTTP {status}")));
        }

        let body: GeocodeResponse = response
            .json()
            .await
            .map_err(|e| RecapSyncError::Geocode(format!("malformed response: {e}")))?;

        if body.status != "OK" {
            debug!(status = %body.status, "no geocode result");
            return Ok(None);
        }

        Ok(body.results.into_iter().next().map(|r| GeoPoint {
            lat: r.geometry.location.lat,
            lng: r.geometry.location.lng,
            formatted_address: r.formatted_address,
        }))
    }
}

// ---------------------------------------------------------------------------
// Store-backed cache
// ---------------------------------------------------------------------------

/// Wraps a geocoder with the store's `geocode_cache` table.
pub struct CachedGeocoder<'a, G> {
    inner: G,
    storage: &'a Storage,
    ttl: Duration,
}

impl<'a, G: Geocoder> CachedGeocoder<'a, G> {
    pub fn new(inner: G, storage: &'a Storage, ttl: Duration) -> Self {
        Self {
            inner,
            storage,
            ttl,
        }
    }

    async fn cached(&self, key: &str) -> Option<Option<GeoPoint>> {
        let entry = match self.storage.get_geocode_cache(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "geocode cache read failed");
                return None;
            }
        };

        let age = (Utc::now() - entry.created_at).to_std().unwrap_or_default();
        if age > self.ttl {
            return None;
        }

        match entry.result_json {
            None => Some(None),
            Some(json) => match serde_json::from_str::<GeoPoint>(&json) {
                Ok(point) => Some(Some(point)),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable geocode cache entry");
                    None
                }
            },
        }
    }
}

impl<G: Geocoder> Geocoder for CachedGeocoder<'_, G> {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let normalized = normalize_address(address);
        if normalized.is_empty() {
            return Ok(None);
        }
        let key = cache_key(&normalized);

        if let Some(hit) = self.cached(&key).await {
            debug!(address = %normalized, "geocode cache hit");
            return Ok(hit);
        }

        // Transport errors propagate uncached.
        let result = self.inner.geocode(address).await?;

        let json = match &result {
            Some(point) => Some(
                serde_json::to_string(point).map_err(|e| RecapSyncError::Geocode(e.to_string()))?,
            ),
            None => None,
        };
        if let Err(e) = self
            .storage
            .set_geocode_cache(&key, &normalized, json.as_deref())
            .await
        {
            warn!(error = %e, "geocode cache write failed");
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Disabled / configured
// ---------------------------------------------------------------------------

/// Never resolves anything and performs no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGeocoder;

impl Geocoder for DisabledGeocoder {
    async fn geocode(&self, _address: &str) -> Result<Option<GeoPoint>> {
        Ok(None)
    }
}

/// The geocoder a [`GeocoderConfig`] asks for.
pub enum ConfiguredGeocoder<'a> {
    Cached(CachedGeocoder<'a, GoogleGeocoder>),
    Disabled(DisabledGeocoder),
}

impl<'a> ConfiguredGeocoder<'a> {
    /// Cached Google lookups when an API key is available, otherwise disabled.
    pub fn from_config(
        config: &GeocoderConfig,
        storage: &'a Storage,
        timeout: Duration,
    ) -> Result<Self> {
        match &config.api_key {
            Some(key) => {
                let google = GoogleGeocoder::new(&config.base_url, key.clone(), timeout)?;
                Ok(Self::Cached(CachedGeocoder::new(
                    google,
                    storage,
                    config.cache_ttl,
                )))
            }
            None => {
                debug!("geocoding disabled");
                Ok(Self::Disabled(DisabledGeocoder))
            }
        }
    }
}

impl Geocoder for ConfiguredGeocoder<'_> {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        match self {
            Self::Cached(g) => g.geocode(address).await,
            Self::Disabled(g) => g.geocode(address).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("rs_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn google(server: &MockServer) -> GoogleGeocoder {
        GoogleGeocoder::new(
            &format!("{}/maps/api/geocode/json", server.uri()),
            "test-key",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "status": "OK",
            "results": [{
                "formatted_address": "Dayton, OH, USA",
                "geometry": { "location": { "lat": 39.7589, "lng": -84.1916 } }
            }]
        })
    }

    #[test]
    fn normalizes_addresses() {
        assert_eq!(normalize_address("  Dayton,   OH \n"), "dayton, oh");
        assert_eq!(cache_key("dayton, oh"), cache_key(&normalize_address("DAYTON, OH")));
    }

    #[tokio::test]
    async fn google_parses_first_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/api/geocode/json"))
            .and(query_param("address", "Dayton, OH"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let point = google(&server).geocode("Dayton, OH").await.unwrap().unwrap();
        assert_eq!(point.formatted_address, "Dayton, OH, USA");
        assert!((point.lat - 39.7589).abs() < 1e-9);
    }

    #[tokio::test]
    async fn google_zero_results_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "status": "ZERO_RESULTS", "results": [] })),
            )
            .mount(&server)
            .await;

        assert!(google(&server).geocode("Nowhere").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let cached = CachedGeocoder::new(google(&server), &storage, Duration::from_secs(3600));

        let first = cached.geocode("Dayton, OH").await.unwrap();
        let second = cached.geocode("  dayton,  oh ").await.unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cache_remembers_misses_but_not_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("address", "Nowhere"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "status": "ZERO_RESULTS" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("address", "Flaky"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let cached = CachedGeocoder::new(google(&server), &storage, Duration::from_secs(3600));

        assert!(cached.geocode("Nowhere").await.unwrap().is_none());
        assert!(cached.geocode("Nowhere").await.unwrap().is_none());

        assert!(cached.geocode("Flaky").await.is_err());
        assert!(cached.geocode("Flaky").await.is_err());
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(2)
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let cached = CachedGeocoder::new(google(&server), &storage, Duration::ZERO);
        cached.geocode("Dayton, OH").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cached.geocode("Dayton, OH").await.unwrap();
    }

    #[tokio::test]
    async fn configured_without_key_is_disabled() {
        let storage = test_storage().await;
        let config = GeocoderConfig {
            api_key: None,
            base_url: "https://maps.example.com/geocode/json".into(),
            cache_ttl: Duration::from_secs(60),
        };
        let geocoder =
            ConfiguredGeocoder::from_config(&config, &storage, Duration::from_secs(1)).unwrap();
        assert!(matches!(geocoder, ConfiguredGeocoder::Disabled(_)));
        assert!(geocoder.geocode("Dayton, OH").await.unwrap().is_none());
        // Disabled lookups never populate the cache.
        let key = cache_key(&normalize_address("Dayton, OH"));
        assert!(storage.get_geocode_cache(&key).await.unwrap().is_none());
    }
}
