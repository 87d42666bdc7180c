//! Reverse geocoding of coordinates to streets.
//!
//! Lookups go over the network and may fail; callers treat a failure as
//! "street unknown" for that point only.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::config::GeocoderConfig;
use crate::geo::{Coord, CoordKey};
use crate::model::Street;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("geocoder returned HTTP {0}")]
    Status(u16),

    #[error("malformed address: {0:?}")]
    MalformedAddress(String),

    #[error("no address at {lat}, {lon}")]
    NotFound { lat: f64, lon: f64 },

    #[error("geocoding disabled")]
    Disabled,
}

impl GeocodeError {
    /// Whether retrying the same point later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GeocodeError::Http(_) | GeocodeError::Status(_))
    }
}

pub trait ReverseGeocoder: Send + Sync {
    fn resolve(&self, coord: Coord) -> impl Future<Output = Result<Street, GeocodeError>> + Send;
}

impl<G: ReverseGeocoder> ReverseGeocoder for Arc<G> {
    fn resolve(&self, coord: Coord) -> impl Future<Output = Result<Street, GeocodeError>> + Send {
        (**self).resolve(coord)
    }
}

/// Geocoder for offline runs: every lookup fails, so only the vehicle count
/// of an overspeed report is filled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineGeocoder;

impl ReverseGeocoder for OfflineGeocoder {
    async fn resolve(&self, _coord: Coord) -> Result<Street, GeocodeError> {
        Err(GeocodeError::Disabled)
    }
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    display_name: Option<String>,
    address: Option<NominatimAddress>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    road: Option<String>,
    pedestrian: Option<String>,
    city_district: Option<String>,
    suburb: Option<String>,
    quarter: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
}

/// Client for the Nominatim `/reverse` endpoint.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(Duration::from_millis(config.min_interval_ms)),
        })
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    async fn resolve(&self, coord: Coord) -> Result<Street, GeocodeError> {
        self.limiter.wait().await;

        let response = self
            .client
            .get(format!("{}/reverse", self.base_url))
            .query(&[
                ("format", "jsonv2".to_string()),
                ("addressdetails", "1".to_string()),
                ("lat", coord.lat.to_string()),
                ("lon", coord.lon.to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeocodeError::Status(response.status().as_u16()));
        }
        let body: NominatimResponse = response.json().await?;
        street_from_response(body, coord)
    }
}

fn street_from_response(body: NominatimResponse, coord: Coord) -> Result<Street, GeocodeError> {
    if body.error.is_some() {
        return Err(GeocodeError::NotFound {
            lat: coord.lat,
            lon: coord.lon,
        });
    }

    let address = body.address.unwrap_or_default();
    let name = address.road.or(address.pedestrian);
    let city = address.city.or(address.town).or(address.village);
    if let (Some(name), Some(city)) = (name, city) {
        let district = address
            .city_district
            .or(address.suburb)
            .or(address.quarter)
            .unwrap_or_default();
        return Ok(Street::new(name, district, city));
    }

    match body.display_name {
        Some(display_name) => street_from_address(&display_name),
        None => Err(GeocodeError::NotFound {
            lat: coord.lat,
            lon: coord.lon,
        }),
    }
}

/// Parse a comma separated address of the form
/// `street, [..], district, city, region, postcode, country`.
pub fn street_from_address(address: &str) -> Result<Street, GeocodeError> {
    let parts: Vec<&str> = address.split(',').map(str::trim).collect();
    if parts.len() < 5 || parts.iter().any(|p| p.is_empty()) {
        return Err(GeocodeError::MalformedAddress(address.to_string()));
    }
    let n = parts.len();
    Ok(Street::new(parts[0], parts[n - 5], parts[n - 4]))
}

/// Spaces out calls so that two of them start at least `interval` apart.
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

/// Memoizes lookups by rounded coordinate. Permanent failures are cached
/// too; transient ones are retried on the next request. Concurrent lookups
/// of one key share a single request to the inner geocoder.
pub struct CachedGeocoder<G> {
    inner: G,
    decimals: u32,
    cache: Mutex<HashMap<CoordKey, Arc<OnceCell<Option<Street>>>>>,
    misses: AtomicUsize,
}

impl<G: ReverseGeocoder> CachedGeocoder<G> {
    pub fn new(inner: G, decimals: u32) -> Self {
        Self {
            inner,
            decimals,
            cache: Mutex::new(HashMap::new()),
            misses: AtomicUsize::new(0),
        }
    }

    /// Number of lookups forwarded to the inner geocoder.
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<G: ReverseGeocoder> ReverseGeocoder for CachedGeocoder<G> {
    async fn resolve(&self, coord: Coord) -> Result<Street, GeocodeError> {
        let cell = {
            let mut cache = self.cache.lock().await;
            Arc::clone(cache.entry(coord.key(self.decimals)).or_default())
        };

        let mut failure = None;
        let slot = &mut failure;
        let cached = cell
            .get_or_try_init(move || async move {
                self.misses.fetch_add(1, Ordering::Relaxed);
                match self.inner.resolve(coord).await {
                    Ok(street) => Ok(Some(street)),
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => {
                        debug!("Caching failed lookup at {}, {}: {}", coord.lat, coord.lon, e);
                        *slot = Some(e);
                        Ok(None)
                    }
                }
            })
            .await?;

        match cached {
            Some(street) => Ok(street.clone()),
            None => Err(failure.unwrap_or(GeocodeError::NotFound {
                lat: coord.lat,
                lon: coord.lon,
            })),
        }
    }
}
