use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

/// Which stop-matching strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchingStrategy {
    /// Join rounded ping coordinates against rounded stop coordinates.
    #[default]
    Exact,
    /// Nearest stop on the line within the tolerance radius.
    Nearest,
}

/// Tunables for one batch run. The thresholds are empirical; they are
/// exposed here instead of being baked into the algorithms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub overspeed_threshold_kmh: f64,
    pub nearest_stop_tolerance_km: f64,
    pub max_delay_minutes: f64,
    pub coordinate_decimals: u32,
    pub matching: MatchingStrategy,
    /// Upper bound on parallel per-line workers; `None` uses every core.
    pub workers: Option<usize>,
    pub geocoder: GeocoderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overspeed_threshold_kmh: 50.0,
            nearest_stop_tolerance_km: 0.025,
            max_delay_minutes: 30.0,
            coordinate_decimals: 4,
            matching: MatchingStrategy::Exact,
            workers: None,
            geocoder: GeocoderConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReconcileError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        positive("overspeed_threshold_kmh", self.overspeed_threshold_kmh)?;
        positive("nearest_stop_tolerance_km", self.nearest_stop_tolerance_km)?;
        positive("max_delay_minutes", self.max_delay_minutes)?;
        if self.coordinate_decimals > 9 {
            return Err(ReconcileError::Config(format!(
                "coordinate_decimals must be at most 9, got {}",
                self.coordinate_decimals
            )));
        }
        if self.workers == Some(0) || self.geocoder.max_concurrency == 0 {
            return Err(ReconcileError::Config(
                "worker and geocoder concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_nan() || value <= 0.0 {
        return Err(ReconcileError::Config(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Minimum spacing between two outgoing requests.
    pub min_interval_ms: u64,
    pub max_concurrency: usize,
    /// Precision of the rounded-coordinate cache key.
    pub cache_decimals: u32,
    pub timeout_secs: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: NOMINATIM_URL.to_string(),
            user_agent: concat!("transit-reconcile/", env!("CARGO_PKG_VERSION")).to_string(),
            min_interval_ms: 1000,
            max_concurrency: 4,
            cache_decimals: 4,
            timeout_secs: 10,
        }
    }
}
