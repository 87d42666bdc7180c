//! Reconciliation of transit vehicle telemetry against a published schedule.
//!
//! A batch of position pings is matched to the stops of each line to
//! measure delays against the timetable, and scanned per vehicle for
//! ping-to-ping speeds above a threshold, which are then tallied by street.

pub mod config;
pub mod delay;
pub mod engine;
pub mod error;
pub mod geo;
pub mod geocode;
pub mod matcher;
pub mod model;
pub mod overspeed;
pub mod pings;
pub mod schedule;
pub mod server;

pub use config::{EngineConfig, GeocoderConfig, MatchingStrategy};
pub use delay::{DelayReconciler, DelayReport};
pub use engine::Engine;
pub use error::{ReconcileError, Result};
pub use model::{DelayRecord, OverspeedEvent, PositionPing, ScheduleEntry, Stop, StopVisit, Street};
pub use overspeed::{OverspeedReport, SpeedAnomalyDetector};
pub use pings::PingBatch;
pub use schedule::ScheduleIndex;
