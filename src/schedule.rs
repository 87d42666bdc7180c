use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::geo::{Coord, CoordKey};
use crate::model::{de_code, de_opt_f64, ScheduleEntry, ServiceTime, Stop};

#[derive(Debug, Deserialize)]
struct ScheduleRow {
    #[serde(rename = "Line", deserialize_with = "de_code")]
    line: String,
    #[serde(rename = "BusstopID", deserialize_with = "de_code")]
    stop_id: String,
    #[serde(rename = "BusstopNr", deserialize_with = "de_code")]
    stop_nr: String,
    #[serde(rename = "Brigade", deserialize_with = "de_code")]
    brigade: String,
    #[serde(rename = "Direction", default)]
    direction: Option<String>,
    #[serde(rename = "Time")]
    time: String,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    #[serde(rename = "BusstopID", deserialize_with = "de_code")]
    stop_id: String,
    #[serde(rename = "BusstopNr", deserialize_with = "de_code")]
    stop_nr: String,
    #[serde(rename = "BusstopName", default)]
    name: Option<String>,
    #[serde(rename = "Latitude", default, deserialize_with = "de_opt_f64")]
    lat: Option<f64>,
    #[serde(rename = "Longitude", default, deserialize_with = "de_opt_f64")]
    lon: Option<f64>,
    #[serde(rename = "Direction", default)]
    direction: Option<String>,
}

impl From<StopRow> for Stop {
    fn from(row: StopRow) -> Self {
        let position = match (row.lat, row.lon) {
            (Some(lat), Some(lon)) => Some(Coord::new(lat, lon)),
            _ => None,
        };
        Stop {
            stop_id: row.stop_id,
            stop_nr: row.stop_nr,
            name: row.name,
            position,
            direction: row.direction,
        }
    }
}

/// A `(stop_id, stop_nr)` pair served by a line, joined with the stop
/// catalog. `position` is `None` when the catalog has no such stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineStop {
    pub stop_id: String,
    pub stop_nr: String,
    pub name: Option<String>,
    pub position: Option<Coord>,
}

impl LineStop {
    pub fn key(&self, decimals: u32) -> Option<CoordKey> {
        self.position.map(|p| p.key(decimals))
    }
}

/// Everything a worker needs to reconcile one line, owned so it can move
/// across threads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LineSchedule {
    pub line: String,
    pub entries: Vec<ScheduleEntry>,
    pub stops: Vec<LineStop>,
}

impl LineSchedule {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stops with known coordinates, in schedule order.
    pub fn located_stops(&self) -> impl Iterator<Item = (&LineStop, Coord)> {
        self.stops
            .iter()
            .filter_map(|s| s.position.map(|p| (s, p)))
    }
}

#[derive(Debug, Default)]
pub struct ScheduleIndex {
    entries_by_line: HashMap<String, Vec<ScheduleEntry>>,
    stops: HashMap<(String, String), Stop>,
}

impl ScheduleIndex {
    pub fn new(entries: Vec<ScheduleEntry>, stops: Vec<Stop>) -> Self {
        let mut entries_by_line: HashMap<String, Vec<ScheduleEntry>> = HashMap::new();
        for entry in entries {
            entries_by_line
                .entry(entry.line.clone())
                .or_default()
                .push(entry);
        }
        let mut stop_map = HashMap::new();
        for stop in stops {
            stop_map
                .entry((stop.stop_id.clone(), stop.stop_nr.clone()))
                .or_insert(stop);
        }
        Self {
            entries_by_line,
            stops: stop_map,
        }
    }

    pub fn load(schedule_path: impl AsRef<Path>, stops_path: impl AsRef<Path>) -> Result<Self> {
        let entries = load_schedule(schedule_path)?;
        let stops = load_stops(stops_path)?;
        let index = Self::new(entries, stops);
        info!(
            "Schedule index ready: {} lines, {} stops",
            index.entries_by_line.len(),
            index.stops.len()
        );
        Ok(index)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.entries_by_line.keys().map(|l| l.as_str())
    }

    /// All schedule entries of a line; empty for an unknown line.
    pub fn schedule_for(&self, line: &str) -> &[ScheduleEntry] {
        self.entries_by_line
            .get(line)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    /// Distinct stops of a line in order of first appearance in its
    /// schedule, left-joined with the stop catalog.
    pub fn stops_for(&self, line: &str) -> Vec<LineStop> {
        let mut seen = HashSet::new();
        self.schedule_for(line)
            .iter()
            .filter(|e| seen.insert((e.stop_id.as_str(), e.stop_nr.as_str())))
            .map(|e| {
                let stop = self.stops.get(&(e.stop_id.clone(), e.stop_nr.clone()));
                LineStop {
                    stop_id: e.stop_id.clone(),
                    stop_nr: e.stop_nr.clone(),
                    name: stop.and_then(|s| s.name.clone()),
                    position: stop.and_then(|s| s.position),
                }
            })
            .collect()
    }

    pub fn stop(&self, stop_id: &str, stop_nr: &str) -> Option<&Stop> {
        self.stops.get(&(stop_id.to_string(), stop_nr.to_string()))
    }

    pub fn line(&self, line: &str) -> LineSchedule {
        LineSchedule {
            line: line.to_string(),
            entries: self.schedule_for(line).to_vec(),
            stops: self.stops_for(line),
        }
    }
}

fn open_table(path: &Path) -> Result<BufReader<File>> {
    if !path.exists() {
        return Err(ReconcileError::MissingInput {
            path: path.to_path_buf(),
        });
    }
    Ok(BufReader::new(File::open(path)?))
}

pub fn load_schedule(path: impl AsRef<Path>) -> Result<Vec<ScheduleEntry>> {
    let path = path.as_ref();
    let entries = read_schedule(open_table(path)?)?;
    info!("Loaded {} schedule entries from {}", entries.len(), path.display());
    Ok(entries)
}

pub fn read_schedule<R: Read>(reader: R) -> Result<Vec<ScheduleEntry>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut entries = Vec::new();
    let mut skipped = 0;
    for (idx, result) in rdr.deserialize::<ScheduleRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!("Skipping schedule row {}: {}", idx, e);
                skipped += 1;
                continue;
            }
        };
        let Some(time) = ServiceTime::parse(&row.time) else {
            warn!("Skipping schedule row {}: bad time {:?}", idx, row.time);
            skipped += 1;
            continue;
        };
        entries.push(ScheduleEntry {
            line: row.line,
            stop_id: row.stop_id,
            stop_nr: row.stop_nr,
            brigade: row.brigade,
            time,
            direction: row.direction.filter(|d| !d.is_empty()),
        });
    }
    if skipped > 0 {
        warn!("Skipped {} malformed schedule rows", skipped);
    }
    Ok(entries)
}

/// Load the stop catalog from a JSON array or, for `.csv` paths, a CSV
/// table.
pub fn load_stops(path: impl AsRef<Path>) -> Result<Vec<Stop>> {
    let path = path.as_ref();
    let reader = open_table(path)?;
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    let stops = if is_csv {
        read_stops_csv(reader)?
    } else {
        read_stops_json(reader)?
    };
    info!("Loaded {} stops from {}", stops.len(), path.display());
    Ok(stops)
}

pub fn read_stops_json<R: Read>(reader: R) -> Result<Vec<Stop>> {
    let rows: Vec<serde_json::Value> = serde_json::from_reader(reader)?;
    let mut stops = Vec::with_capacity(rows.len());
    for (idx, row) in rows.into_iter().enumerate() {
        match serde_json::from_value::<StopRow>(row) {
            Ok(row) => stops.push(row.into()),
            Err(e) => warn!("Skipping stop row {}: {}", idx, e),
        }
    }
    Ok(stops)
}

pub fn read_stops_csv<R: Read>(reader: R) -> Result<Vec<Stop>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut stops = Vec::new();
    for (idx, result) in rdr.deserialize::<StopRow>().enumerate() {
        match result {
            Ok(row) => stops.push(row.into()),
            Err(e) => warn!("Skipping stop row {}: {}", idx, e),
        }
    }
    Ok(stops)
}
