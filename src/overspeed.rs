//! Detection of implausibly fast ping-to-ping segments and their
//! aggregation by street.

use std::collections::{BTreeSet, HashMap, HashSet};

use futures_util::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;

use crate::geo::{distance_km, elapsed_hours};
use crate::geocode::{GeocodeError, ReverseGeocoder};
use crate::model::{OverspeedEvent, PositionPing, Street};
use crate::pings::PingBatch;

/// Speed in km/h needed to go from `prev` to `cur`. Zero when the vehicle
/// did not move, however much time passed.
pub fn segment_speed_kmh(prev: &PositionPing, cur: &PositionPing) -> f64 {
    let distance = distance_km(prev.coord(), cur.coord());
    if distance == 0.0 {
        return 0.0;
    }
    distance / elapsed_hours(prev.timestamp, cur.timestamp)
}

/// Sort one vehicle's pings by time, drop repeated timestamps and pair each
/// ping with its speed from the previous one. The first ping has speed 0.
pub fn vehicle_speeds<'a>(pings: &[&'a PositionPing]) -> Vec<(&'a PositionPing, f64)> {
    let mut ordered: Vec<&PositionPing> = pings.to_vec();
    ordered.sort_by_key(|p| p.timestamp);
    ordered.dedup_by_key(|p| p.timestamp);

    let mut speeds = Vec::with_capacity(ordered.len());
    let mut prev: Option<&PositionPing> = None;
    for ping in ordered {
        let speed = match prev {
            Some(prev) => segment_speed_kmh(prev, ping),
            None => 0.0,
        };
        speeds.push((ping, speed));
        prev = Some(ping);
    }
    speeds
}

#[derive(Debug, Clone, Copy)]
pub struct SpeedAnomalyDetector {
    threshold_kmh: f64,
}

impl SpeedAnomalyDetector {
    pub fn new(threshold_kmh: f64) -> Self {
        Self { threshold_kmh }
    }

    pub fn detect_vehicle(&self, pings: &[&PositionPing]) -> Vec<OverspeedEvent> {
        vehicle_speeds(pings)
            .into_iter()
            .filter(|(_, speed)| *speed > self.threshold_kmh)
            .map(|(ping, speed)| OverspeedEvent {
                vehicle_id: ping.vehicle_id.clone(),
                line: ping.line.clone(),
                lat: ping.lat,
                lon: ping.lon,
                observed_at: ping.timestamp,
                speed_kmh: speed,
                street: None,
            })
            .collect()
    }

    /// Flagged pings of every vehicle, vehicles in id order.
    pub fn detect(&self, batch: &PingBatch) -> Vec<OverspeedEvent> {
        let mut events = Vec::new();
        for (vehicle, pings) in batch.by_vehicle() {
            let flagged = self.detect_vehicle(&pings);
            if !flagged.is_empty() {
                debug!("Vehicle {} overspeeding at {} points", vehicle, flagged.len());
            }
            events.extend(flagged);
        }
        events
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreetTally {
    pub street: Street,
    pub vehicles: BTreeSet<String>,
}

impl StreetTally {
    pub fn count(&self) -> usize {
        self.vehicles.len()
    }
}

/// Street to distinct-vehicle mapping that remembers first-encounter order.
#[derive(Debug, Default)]
pub struct StreetAccumulator {
    index: HashMap<Street, usize>,
    tallies: Vec<StreetTally>,
}

impl StreetAccumulator {
    pub fn add(&mut self, street: Street, vehicle_id: &str) {
        let idx = match self.index.get(&street) {
            Some(&idx) => idx,
            None => {
                self.tallies.push(StreetTally {
                    street: street.clone(),
                    vehicles: BTreeSet::new(),
                });
                self.index.insert(street, self.tallies.len() - 1);
                self.tallies.len() - 1
            }
        };
        self.tallies[idx].vehicles.insert(vehicle_id.to_string());
    }

    /// Fold in another accumulator; its streets count as encountered after
    /// ours.
    pub fn merge(&mut self, other: StreetAccumulator) {
        for tally in other.tallies {
            for vehicle in &tally.vehicles {
                self.add(tally.street.clone(), vehicle);
            }
        }
    }

    /// Streets by descending vehicle count, ties in encounter order.
    pub fn into_ranked(mut self) -> Vec<StreetTally> {
        self.tallies.sort_by(|a, b| b.count().cmp(&a.count()));
        self.tallies
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverspeedReport {
    pub overspeeding_vehicles: usize,
    pub streets: Vec<StreetTally>,
    pub events: Vec<OverspeedEvent>,
}

impl OverspeedReport {
    /// Resolve the street of every event and tally distinct vehicles per
    /// street. Events whose lookup fails still count towards
    /// `overspeeding_vehicles` but not towards any street.
    pub async fn aggregate<G: ReverseGeocoder>(
        events: Vec<OverspeedEvent>,
        geocoder: &G,
        concurrency: usize,
    ) -> Self {
        let overspeeding_vehicles = events
            .iter()
            .map(|e| e.vehicle_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        let resolved: Vec<OverspeedEvent> = stream::iter(events)
            .map(|mut event| async move {
                match geocoder.resolve(event.coord()).await {
                    Ok(street) => event.street = Some(street),
                    Err(GeocodeError::Disabled) => {}
                    Err(e) => warn!(
                        "No street for vehicle {} at {}, {}: {}",
                        event.vehicle_id, event.lat, event.lon, e
                    ),
                }
                event
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let mut streets = StreetAccumulator::default();
        for event in &resolved {
            if let Some(street) = &event.street {
                streets.add(street.clone(), &event.vehicle_id);
            }
        }
        let streets = streets.into_ranked();
        info!(
            "{} overspeeding vehicles, {} events on {} streets",
            overspeeding_vehicles,
            resolved.len(),
            streets.len()
        );

        Self {
            overspeeding_vehicles,
            streets,
            events: resolved,
        }
    }

    pub fn top(&self, n: usize) -> &[StreetTally] {
        &self.streets[..n.min(self.streets.len())]
    }

    pub fn count_on(&self, street: &Street) -> usize {
        self.streets
            .iter()
            .find(|t| &t.street == street)
            .map_or(0, StreetTally::count)
    }
}
