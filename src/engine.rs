use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::delay::{DelayReconciler, DelayReport};
use crate::geocode::ReverseGeocoder;
use crate::matcher::{matcher_for, StopMatcher};
use crate::model::{DelayRecord, OverspeedEvent, PositionPing};
use crate::overspeed::{OverspeedReport, SpeedAnomalyDetector};
use crate::pings::PingBatch;
use crate::schedule::{LineSchedule, ScheduleIndex};

/// Match one line's pings to its stops and reconcile the visits.
pub fn reconcile_line(
    matcher: &dyn StopMatcher,
    reconciler: &DelayReconciler,
    schedule: &LineSchedule,
    pings: &[PositionPing],
) -> Vec<DelayRecord> {
    let visits = matcher.match_line(schedule, pings);
    let records = reconciler.reconcile(schedule, &visits);
    debug!(
        "Line {}: {} pings, {} stop visits, {} delay records",
        schedule.line,
        pings.len(),
        visits.len(),
        records.len()
    );
    records
}

/// Batch entry points over one observation window.
pub struct Engine {
    config: EngineConfig,
    schedule: Arc<ScheduleIndex>,
    matcher: Arc<dyn StopMatcher>,
}

impl Engine {
    pub fn new(config: EngineConfig, schedule: Arc<ScheduleIndex>) -> Self {
        let matcher = matcher_for(&config);
        Self {
            config,
            schedule,
            matcher,
        }
    }

    /// Swap the stop-matching strategy without touching reconciliation.
    pub fn with_matcher(mut self, matcher: Arc<dyn StopMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schedule(&self) -> &ScheduleIndex {
        &self.schedule
    }

    pub fn shared_schedule(&self) -> Arc<ScheduleIndex> {
        Arc::clone(&self.schedule)
    }

    fn reconciler(&self) -> DelayReconciler {
        DelayReconciler::new(self.config.max_delay_minutes)
    }

    /// Delay report computed one line at a time on the calling thread.
    pub fn delays(&self, batch: &PingBatch) -> DelayReport {
        let reconciler = self.reconciler();
        let mut records = Vec::new();
        for line in batch.lines() {
            let line_schedule = self.schedule.line(line);
            if line_schedule.is_empty() {
                debug!("No schedule for line {}", line);
                continue;
            }
            let pings = batch.for_line(line);
            records.extend(reconcile_line(
                self.matcher.as_ref(),
                &reconciler,
                &line_schedule,
                &pings,
            ));
        }
        info!("{} delay records from {} pings", records.len(), batch.len());
        DelayReport::new(records)
    }

    /// Same report as [`Engine::delays`], with lines spread over blocking
    /// workers. Each worker owns its line's schedule and pings; results are
    /// concatenated in line order once all workers finish.
    pub async fn delays_parallel(&self, batch: &PingBatch) -> DelayReport {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count()));
        let reconciler = self.reconciler();
        let mut workers = JoinSet::new();

        for (idx, line) in batch.lines().into_iter().enumerate() {
            let line_schedule = self.schedule.line(line);
            if line_schedule.is_empty() {
                debug!("No schedule for line {}", line);
                continue;
            }
            let pings = batch.for_line(line);
            let matcher = Arc::clone(&self.matcher);
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            workers.spawn_blocking(move || {
                let _permit = permit;
                let records = reconcile_line(matcher.as_ref(), &reconciler, &line_schedule, &pings);
                (idx, records)
            });
        }

        let mut per_line = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => per_line.push(result),
                Err(e) => warn!("Line worker failed: {}", e),
            }
        }
        per_line.sort_by_key(|(idx, _)| *idx);

        let records: Vec<DelayRecord> = per_line.into_iter().flat_map(|(_, r)| r).collect();
        info!("{} delay records from {} pings", records.len(), batch.len());
        DelayReport::new(records)
    }

    pub fn overspeed_events(&self, batch: &PingBatch) -> Vec<OverspeedEvent> {
        SpeedAnomalyDetector::new(self.config.overspeed_threshold_kmh).detect(batch)
    }

    pub async fn overspeed<G: ReverseGeocoder>(
        &self,
        batch: &PingBatch,
        geocoder: &G,
    ) -> OverspeedReport {
        let events = self.overspeed_events(batch);
        OverspeedReport::aggregate(events, geocoder, self.config.geocoder.max_concurrency).await
    }
}
