//! Reconciliation of observed stop visits against the published schedule.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use chrono::NaiveTime;
use log::debug;
use serde::Serialize;

use crate::error::Result;
use crate::model::{DelayRecord, ServiceTime, StopVisit};
use crate::schedule::LineSchedule;

type SlotKey<'a> = (&'a str, &'a str, &'a str);

/// Finds, for each visit, the latest scheduled departure of the same
/// brigade at the same stop strictly before the observed time.
///
/// Post-midnight schedule times (`24:xx` and later) are folded onto the
/// same clock as everything else, so a `24:05` departure competes with a
/// `00:05` one of the following morning. Delays at or above the cutoff are
/// dropped: they come from a vehicle passing the opposite-direction stop at
/// the same coordinates, not from real lateness.
#[derive(Debug, Clone, Copy)]
pub struct DelayReconciler {
    max_delay_minutes: f64,
}

impl DelayReconciler {
    pub fn new(max_delay_minutes: f64) -> Self {
        Self { max_delay_minutes }
    }

    pub fn reconcile(&self, schedule: &LineSchedule, visits: &[StopVisit]) -> Vec<DelayRecord> {
        let mut slots: HashMap<SlotKey, Vec<(NaiveTime, ServiceTime)>> = HashMap::new();
        for entry in &schedule.entries {
            slots
                .entry((
                    entry.brigade.as_str(),
                    entry.stop_id.as_str(),
                    entry.stop_nr.as_str(),
                ))
                .or_default()
                .push((entry.time.time_of_day(), entry.time));
        }
        for times in slots.values_mut() {
            times.sort();
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for visit in visits {
            let key: SlotKey = (
                visit.brigade.as_str(),
                visit.stop_id.as_str(),
                visit.stop_nr.as_str(),
            );
            let Some(times) = slots.get(&key) else {
                continue;
            };
            let observed = visit.observed_time();
            let before = times.partition_point(|(t, _)| *t < observed);
            if before == 0 {
                continue;
            }
            let (scheduled, _) = times[before - 1];
            let delay_minutes = (observed - scheduled).num_milliseconds() as f64 / 60_000.0;
            if delay_minutes >= self.max_delay_minutes {
                debug!(
                    "Line {} brigade {} at {}/{}: {:.1} min delay rejected",
                    visit.line, visit.brigade, visit.stop_id, visit.stop_nr, delay_minutes
                );
                continue;
            }
            if !seen.insert((
                visit.stop_id.clone(),
                visit.stop_nr.clone(),
                visit.brigade.clone(),
                scheduled,
            )) {
                continue;
            }
            records.push(DelayRecord {
                line: visit.line.clone(),
                stop_id: visit.stop_id.clone(),
                stop_nr: visit.stop_nr.clone(),
                brigade: visit.brigade.clone(),
                vehicle_id: visit.vehicle_id.clone(),
                observed_time: observed,
                scheduled_time: scheduled,
                delay_minutes,
            });
        }
        records
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DelayReport {
    records: Vec<DelayRecord>,
}

impl DelayReport {
    pub fn new(records: Vec<DelayRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[DelayRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records delayed by strictly more than `minutes`.
    pub fn over_threshold(&self, minutes: f64) -> DelayReport {
        DelayReport {
            records: self
                .records
                .iter()
                .filter(|r| r.delay_minutes > minutes)
                .cloned()
                .collect(),
        }
    }

    pub fn for_line<'a>(&'a self, line: &'a str) -> impl Iterator<Item = &'a DelayRecord> + 'a {
        self.records.iter().filter(move |r| r.line == line)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for record in &self.records {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}
