#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use transit_reconcile::geo::{Coord, CoordKey};
use transit_reconcile::geocode::{GeocodeError, ReverseGeocoder};
use transit_reconcile::model::{ServiceTime, Stop};
use transit_reconcile::pings::parse_timestamp;
use transit_reconcile::{PositionPing, ScheduleEntry, Street};

pub const STOP_LAT: f64 = 52.21599054475676;
pub const STOP_LON: f64 = 20.982646082482425;
pub const FAR_LAT: f64 = 52.2163576442883;
pub const FAR_LON: f64 = 20.99128337964515;

pub fn data_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

pub fn ping(vehicle: &str, line: &str, lat: f64, lon: f64, time: &str, brigade: &str) -> PositionPing {
    PositionPing {
        vehicle_id: vehicle.to_string(),
        line: line.to_string(),
        lat,
        lon,
        timestamp: parse_timestamp(time).unwrap(),
        brigade: brigade.to_string(),
    }
}

pub fn entry(line: &str, stop_id: &str, stop_nr: &str, brigade: &str, time: &str) -> ScheduleEntry {
    ScheduleEntry {
        line: line.to_string(),
        stop_id: stop_id.to_string(),
        stop_nr: stop_nr.to_string(),
        brigade: brigade.to_string(),
        time: ServiceTime::parse(time).unwrap(),
        direction: None,
    }
}

pub fn stop(stop_id: &str, stop_nr: &str, lat: f64, lon: f64) -> Stop {
    Stop {
        stop_id: stop_id.to_string(),
        stop_nr: stop_nr.to_string(),
        name: None,
        position: Some(Coord::new(lat, lon)),
        direction: None,
    }
}

pub fn kolonia_lubeckiego() -> Street {
    Street::new("Kolonia Lubeckiego", "Ochota", "Warszawa")
}

/// In-memory geocoder; coordinates it does not know fail with `NotFound`.
#[derive(Default)]
pub struct FakeGeocoder {
    streets: HashMap<CoordKey, Street>,
    calls: AtomicUsize,
}

impl FakeGeocoder {
    pub fn with(mut self, lat: f64, lon: f64, street: Street) -> Self {
        self.streets.insert(CoordKey::new(lat, lon, 4), street);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReverseGeocoder for FakeGeocoder {
    async fn resolve(&self, coord: Coord) -> Result<Street, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.streets
            .get(&coord.key(4))
            .cloned()
            .ok_or(GeocodeError::NotFound {
                lat: coord.lat,
                lon: coord.lon,
            })
    }
}

/// Fails every lookup with a transient error.
pub struct FlakyGeocoder;

impl ReverseGeocoder for FlakyGeocoder {
    async fn resolve(&self, _coord: Coord) -> Result<Street, GeocodeError> {
        Err(GeocodeError::Status(503))
    }
}

/// Wraps a [`FakeGeocoder`] with a fixed response delay and records how
/// many lookups were in flight at once.
pub struct SlowGeocoder {
    inner: FakeGeocoder,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowGeocoder {
    pub fn new(inner: FakeGeocoder, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ReverseGeocoder for SlowGeocoder {
    async fn resolve(&self, coord: Coord) -> Result<Street, GeocodeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.resolve(coord).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
