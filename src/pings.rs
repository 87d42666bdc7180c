use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::{ReconcileError, Result};
use crate::model::{de_code, de_opt_f64, PositionPing};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// A ping row as published by the vehicle position API.
#[derive(Debug, Deserialize)]
struct RawPing {
    #[serde(rename = "Lines", deserialize_with = "de_code")]
    line: String,
    #[serde(rename = "Lat", default, deserialize_with = "de_opt_f64")]
    lat: Option<f64>,
    #[serde(rename = "Lon", default, deserialize_with = "de_opt_f64")]
    lon: Option<f64>,
    #[serde(rename = "VehicleNumber", deserialize_with = "de_code")]
    vehicle_id: String,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Brigade", deserialize_with = "de_code")]
    brigade: String,
}

impl RawPing {
    fn into_ping(self) -> std::result::Result<PositionPing, String> {
        let (lat, lon) = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Err("missing coordinates".to_string()),
        };
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(format!("coordinates out of range: {lat}, {lon}"));
        }
        if self.vehicle_id.is_empty() || self.line.is_empty() {
            return Err("missing vehicle or line".to_string());
        }
        let timestamp = parse_timestamp(&self.time)
            .ok_or_else(|| format!("unparseable timestamp {:?}", self.time))?;
        Ok(PositionPing {
            vehicle_id: self.vehicle_id,
            line: self.line,
            lat,
            lon,
            timestamp,
            brigade: self.brigade,
        })
    }
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// All pings of one observation window, reduced to one ping per
/// `(vehicle, timestamp)`.
#[derive(Debug, Clone, Default)]
pub struct PingBatch {
    pings: Vec<PositionPing>,
    duplicates_removed: usize,
}

impl PingBatch {
    /// Build a batch, keeping the first ping seen for each vehicle and
    /// timestamp.
    pub fn new(pings: Vec<PositionPing>) -> Self {
        let total = pings.len();
        let mut seen = HashSet::new();
        let pings: Vec<PositionPing> = pings
            .into_iter()
            .filter(|p| seen.insert((p.vehicle_id.clone(), p.timestamp)))
            .collect();
        let duplicates_removed = total - pings.len();
        if duplicates_removed > 0 {
            debug!("Dropped {} duplicate pings", duplicates_removed);
        }
        Self {
            pings,
            duplicates_removed,
        }
    }

    /// Load a batch file. `.csv` files are read as CSV, everything else as
    /// a JSON array; a trailing `.gz` means gzip-compressed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReconcileError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let file = BufReader::new(File::open(path)?);
        let (reader, name): (Box<dyn Read>, &str) = match name.strip_suffix(".gz") {
            Some(inner) => (Box::new(GzDecoder::new(file)), inner),
            None => (Box::new(file), name.as_str()),
        };
        let batch = if name.ends_with(".csv") {
            Self::from_csv(reader)?
        } else {
            Self::from_json(reader)?
        };
        info!(
            "Loaded {} pings from {} ({} duplicates dropped)",
            batch.len(),
            path.display(),
            batch.duplicates_removed
        );
        Ok(batch)
    }

    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_reader(reader)?;
        let rows = match value {
            serde_json::Value::Array(rows) => rows,
            _ => {
                return Err(ReconcileError::Json(serde::de::Error::custom(
                    "expected a JSON array of pings",
                )))
            }
        };

        let mut pings = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for (idx, row) in rows.into_iter().enumerate() {
            let parsed = serde_json::from_value::<RawPing>(row)
                .map_err(|e| e.to_string())
                .and_then(RawPing::into_ping);
            match parsed {
                Ok(ping) => pings.push(ping),
                Err(e) => {
                    warn!("Skipping ping row {}: {}", idx, e);
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!("Skipped {} malformed ping rows", skipped);
        }
        Ok(Self::new(pings))
    }

    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut pings = Vec::new();
        let mut skipped = 0;
        for (idx, result) in rdr.deserialize::<RawPing>().enumerate() {
            let parsed = result
                .map_err(|e| e.to_string())
                .and_then(RawPing::into_ping);
            match parsed {
                Ok(ping) => pings.push(ping),
                Err(e) => {
                    warn!("Skipping ping row {}: {}", idx, e);
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!("Skipped {} malformed ping rows", skipped);
        }
        Ok(Self::new(pings))
    }

    pub fn pings(&self) -> &[PositionPing] {
        &self.pings
    }

    pub fn len(&self) -> usize {
        self.pings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pings.is_empty()
    }

    pub fn duplicates_removed(&self) -> usize {
        self.duplicates_removed
    }

    /// Distinct lines in order of first appearance.
    pub fn lines(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.pings
            .iter()
            .map(|p| p.line.as_str())
            .filter(|line| seen.insert(*line))
            .collect()
    }

    /// Owned copy of one line's pings, for handing to a worker.
    pub fn for_line(&self, line: &str) -> Vec<PositionPing> {
        self.pings
            .iter()
            .filter(|p| p.line == line)
            .cloned()
            .collect()
    }

    /// Pings grouped per vehicle, in input order within each group.
    pub fn by_vehicle(&self) -> BTreeMap<&str, Vec<&PositionPing>> {
        let mut groups: BTreeMap<&str, Vec<&PositionPing>> = BTreeMap::new();
        for ping in &self.pings {
            groups.entry(ping.vehicle_id.as_str()).or_default().push(ping);
        }
        groups
    }
}
