use std::fmt;
use std::sync::LazyLock;

use chrono::{NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::geo::Coord;

static SERVICE_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,2}):(\d{2}):(\d{2})\s*$").unwrap());

/// One reported vehicle position sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionPing {
    pub vehicle_id: String,
    pub line: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: NaiveDateTime,
    pub brigade: String,
}

impl PositionPing {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lon)
    }
}

/// A stop from the stop catalog, keyed by `(stop_id, stop_nr)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_nr: String,
    pub name: Option<String>,
    pub position: Option<Coord>,
    pub direction: Option<String>,
}

/// Scheduled time of day as published, measured from the start of the
/// service day. Hours 24..=47 denote the post-midnight tail of that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceTime {
    secs: u32,
}

impl ServiceTime {
    pub const SECS_PER_DAY: u32 = 24 * 3600;

    pub fn parse(text: &str) -> Option<Self> {
        let caps = SERVICE_TIME_RE.captures(text)?;
        let hours: u32 = caps[1].parse().ok()?;
        let mins: u32 = caps[2].parse().ok()?;
        let secs: u32 = caps[3].parse().ok()?;
        if hours >= 48 || mins >= 60 || secs >= 60 {
            return None;
        }
        Some(Self {
            secs: hours * 3600 + mins * 60 + secs,
        })
    }

    pub fn from_hms(hours: u32, mins: u32, secs: u32) -> Self {
        Self {
            secs: hours * 3600 + mins * 60 + secs,
        }
    }

    pub fn is_after_midnight(&self) -> bool {
        self.secs >= Self::SECS_PER_DAY
    }

    /// Time of day with 24 hours subtracted from post-midnight values.
    pub fn time_of_day(&self) -> NaiveTime {
        let secs = self.secs % Self::SECS_PER_DAY;
        NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for ServiceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.secs / 3600,
            (self.secs / 60) % 60,
            self.secs % 60
        )
    }
}

impl Serialize for ServiceTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub line: String,
    pub stop_id: String,
    pub stop_nr: String,
    pub brigade: String,
    pub time: ServiceTime,
    pub direction: Option<String>,
}

/// A ping matched to a stop served by its line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopVisit {
    pub line: String,
    pub vehicle_id: String,
    pub stop_id: String,
    pub stop_nr: String,
    pub brigade: String,
    pub observed_at: NaiveDateTime,
    pub lat: f64,
    pub lon: f64,
}

impl StopVisit {
    pub fn observed_time(&self) -> NaiveTime {
        self.observed_at.time()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayRecord {
    pub line: String,
    pub stop_id: String,
    pub stop_nr: String,
    pub brigade: String,
    pub vehicle_id: String,
    pub observed_time: NaiveTime,
    pub scheduled_time: NaiveTime,
    pub delay_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverspeedEvent {
    pub vehicle_id: String,
    pub line: String,
    pub lat: f64,
    pub lon: f64,
    pub observed_at: NaiveDateTime,
    pub speed_kmh: f64,
    pub street: Option<Street>,
}

impl OverspeedEvent {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lon)
    }
}

/// A street as resolved by reverse geocoding. Two values with the same
/// fields are the same street.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Street {
    pub name: String,
    pub district: String,
    pub city: String,
}

impl Street {
    pub fn new(name: impl Into<String>, district: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            district: district.into(),
            city: city.into(),
        }
    }
}

impl fmt::Display for Street {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.name, self.district, self.city)
    }
}

/// Trim an identifier and drop leading zeros from purely numeric codes, so
/// `"05"`, `"5"` and `5` all join.
pub fn normalize_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = trimmed.trim_start_matches('0');
        if stripped.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        }
    } else {
        trimmed.to_string()
    }
}

/// Field values the upstream catalogs emit either as strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Int(i64),
    Float(f64),
    Str(String),
}

pub(crate) fn de_code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Loose::deserialize(deserializer)? {
        Loose::Int(i) => normalize_code(&i.to_string()),
        Loose::Float(f) if f.fract() == 0.0 => normalize_code(&(f as i64).to_string()),
        Loose::Float(f) => f.to_string(),
        Loose::Str(s) => normalize_code(&s),
    })
}

pub(crate) fn de_opt_f64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Int(i)) => Some(i as f64),
        Some(Loose::Float(f)) => Some(f),
        Some(Loose::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}
