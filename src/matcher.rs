//! Matching of position pings to the stops served by their line.
//!
//! Both strategies emit at most one [`StopVisit`] per ping and return the
//! visits ordered by observation time.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::config::{EngineConfig, MatchingStrategy};
use crate::geo::{distance_km, CoordKey};
use crate::model::{PositionPing, StopVisit};
use crate::schedule::{LineSchedule, LineStop};

pub trait StopMatcher: Send + Sync {
    /// Match `pings` (all of `schedule.line`) against the line's stops.
    fn match_line(&self, schedule: &LineSchedule, pings: &[PositionPing]) -> Vec<StopVisit>;
}

pub fn matcher_for(config: &EngineConfig) -> Arc<dyn StopMatcher> {
    match config.matching {
        MatchingStrategy::Exact => Arc::new(ExactKeyMatcher::new(config.coordinate_decimals)),
        MatchingStrategy::Nearest => {
            Arc::new(NearestStopMatcher::new(config.nearest_stop_tolerance_km))
        }
    }
}

/// Joins rounded ping coordinates with rounded stop coordinates.
///
/// A vehicle that never reports a position within the rounding cell of a
/// catalog stop produces no visit there.
#[derive(Debug, Clone, Copy)]
pub struct ExactKeyMatcher {
    decimals: u32,
}

impl ExactKeyMatcher {
    pub fn new(decimals: u32) -> Self {
        Self { decimals }
    }
}

impl StopMatcher for ExactKeyMatcher {
    fn match_line(&self, schedule: &LineSchedule, pings: &[PositionPing]) -> Vec<StopVisit> {
        // first stop wins when two stops share a cell
        let mut by_key: HashMap<CoordKey, &LineStop> = HashMap::new();
        for (stop, position) in schedule.located_stops() {
            by_key.entry(position.key(self.decimals)).or_insert(stop);
        }

        let visits = pings
            .iter()
            .filter(|p| p.line == schedule.line)
            .filter_map(|p| {
                by_key
                    .get(&p.coord().key(self.decimals))
                    .map(|stop| visit(&schedule.line, stop, p))
            })
            .collect();
        sorted(visits)
    }
}

/// Picks the closest stop of the line and accepts it under a distance
/// tolerance. Ties go to the stop listed first.
#[derive(Debug, Clone, Copy)]
pub struct NearestStopMatcher {
    tolerance_km: f64,
}

impl NearestStopMatcher {
    pub fn new(tolerance_km: f64) -> Self {
        Self { tolerance_km }
    }
}

impl StopMatcher for NearestStopMatcher {
    fn match_line(&self, schedule: &LineSchedule, pings: &[PositionPing]) -> Vec<StopVisit> {
        let stops: Vec<_> = schedule.located_stops().collect();
        if stops.is_empty() {
            debug!("Line {} has no located stops", schedule.line);
            return Vec::new();
        }

        let visits = pings
            .iter()
            .filter(|p| p.line == schedule.line)
            .filter_map(|p| {
                let here = p.coord();
                let mut best: Option<(&LineStop, f64)> = None;
                for (stop, position) in &stops {
                    let d = distance_km(here, *position);
                    match best {
                        Some((_, best_d)) if d >= best_d => {}
                        _ => best = Some((stop, d)),
                    }
                }
                best.filter(|(_, d)| *d < self.tolerance_km)
                    .map(|(stop, _)| visit(&schedule.line, stop, p))
            })
            .collect();
        sorted(visits)
    }
}

fn visit(line: &str, stop: &LineStop, ping: &PositionPing) -> StopVisit {
    StopVisit {
        line: line.to_string(),
        vehicle_id: ping.vehicle_id.clone(),
        stop_id: stop.stop_id.clone(),
        stop_nr: stop.stop_nr.clone(),
        brigade: ping.brigade.clone(),
        observed_at: ping.timestamp,
        lat: ping.lat,
        lon: ping.lon,
    }
}

fn sorted(mut visits: Vec<StopVisit>) -> Vec<StopVisit> {
    visits.sort_by_key(|v| v.observed_at);
    visits
}
