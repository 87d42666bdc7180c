use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn key(&self, decimals: u32) -> CoordKey {
        CoordKey::new(self.lat, self.lon, decimals)
    }
}

/// A coordinate rounded to a fixed number of decimals, stored as scaled
/// integers so it can be hashed and compared exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordKey {
    lat: i64,
    lon: i64,
}

impl CoordKey {
    pub fn new(lat: f64, lon: f64, decimals: u32) -> Self {
        let scale = 10f64.powi(decimals as i32);
        Self {
            lat: (lat * scale).round() as i64,
            lon: (lon * scale).round() as i64,
        }
    }
}

/// Great-circle distance in km. Identical points are exactly 0; the
/// haversine term is clamped to 1 so antipodal rounding cannot produce NaN.
pub fn distance_km(a: Coord, b: Coord) -> f64 {
    if a == b {
        return 0.0;
    }
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// Hours from `from` to `to`; negative when `to` is earlier.
pub fn elapsed_hours(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 3_600_000_000.0,
        None => delta.num_milliseconds() as f64 / 3_600_000.0,
    }
}
