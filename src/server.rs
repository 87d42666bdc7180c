use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use log::info;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::delay::DelayReport;
use crate::model::{normalize_code, DelayRecord, ScheduleEntry};
use crate::overspeed::{OverspeedReport, StreetTally};
use crate::schedule::{LineStop, ScheduleIndex};

/// Reports of one batch, computed once and served read-only.
pub struct AppState {
    pub schedule: Arc<ScheduleIndex>,
    pub delays: DelayReport,
    pub overspeed: OverspeedReport,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DelayQuery {
    pub min_delay: Option<f64>,
    pub line: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopQuery {
    pub top: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct OverspeedSummary {
    pub overspeeding_vehicles: usize,
    pub streets: Vec<StreetCount>,
}

#[derive(Debug, Serialize)]
pub struct StreetCount {
    pub street: String,
    pub vehicles: usize,
}

impl From<&StreetTally> for StreetCount {
    fn from(tally: &StreetTally) -> Self {
        Self {
            street: tally.street.to_string(),
            vehicles: tally.count(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/delays", get(get_delays))
        .route("/overspeed", get(get_overspeed))
        .route("/lines/{line}/stops", get(get_line_stops))
        .route("/lines/{line}/schedule", get(get_line_schedule))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server is running on http://localhost:{}", port);
    axum::serve(listener, router(state)).await
}

pub async fn get_delays(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DelayQuery>,
) -> Json<Vec<DelayRecord>> {
    let report = match query.min_delay {
        Some(min) => state.delays.over_threshold(min),
        None => state.delays.clone(),
    };
    let records = match &query.line {
        Some(line) => report.for_line(&normalize_code(line)).cloned().collect(),
        None => report.records().to_vec(),
    };
    Json(records)
}

pub async fn get_overspeed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopQuery>,
) -> Json<OverspeedSummary> {
    let streets = match query.top {
        Some(n) => state.overspeed.top(n),
        None => &state.overspeed.streets[..],
    };
    Json(OverspeedSummary {
        overspeeding_vehicles: state.overspeed.overspeeding_vehicles,
        streets: streets.iter().map(StreetCount::from).collect(),
    })
}

pub async fn get_line_stops(
    State(state): State<Arc<AppState>>,
    Path(line): Path<String>,
) -> Result<Json<Vec<LineStop>>, (StatusCode, Json<ErrorResponse>)> {
    let stops = state.schedule.stops_for(&normalize_code(&line));
    if stops.is_empty() {
        return Err(not_found(&line));
    }
    Ok(Json(stops))
}

pub async fn get_line_schedule(
    State(state): State<Arc<AppState>>,
    Path(line): Path<String>,
) -> Result<Json<Vec<ScheduleEntry>>, (StatusCode, Json<ErrorResponse>)> {
    let entries = state.schedule.schedule_for(&normalize_code(&line));
    if entries.is_empty() {
        return Err(not_found(&line));
    }
    Ok(Json(entries.to_vec()))
}

fn not_found(line: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Line '{}' not found", line),
        }),
    )
}
