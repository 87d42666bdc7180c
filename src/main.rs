use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use transit_reconcile::config::{EngineConfig, MatchingStrategy};
use transit_reconcile::geocode::{CachedGeocoder, NominatimGeocoder, OfflineGeocoder};
use transit_reconcile::server::{self, AppState};
use transit_reconcile::{Engine, OverspeedReport, PingBatch, ScheduleIndex};

#[derive(Parser)]
#[command(name = "transit-reconcile")]
#[command(about = "Delay and overspeed analysis of transit vehicle telemetry")]
struct Cli {
    /// JSON file with engine settings; unset fields keep their defaults
    #[arg(long, global = true, env = "RECONCILE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile stop visits against the schedule and report delays
    Delays {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, value_enum)]
        matching: Option<MatchingStrategy>,
        /// Only report delays longer than this many minutes
        #[arg(long)]
        min_delay: Option<f64>,
        /// Write the report to this CSV file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Count overspeeding vehicles and rank streets
    Overspeed {
        /// Ping batch file (.json, .csv, optionally .gz)
        #[arg(long)]
        pings: PathBuf,
        /// Number of streets to print
        #[arg(long, default_value = "10")]
        top: usize,
        #[command(flatten)]
        geocoder: GeocoderArgs,
    },
    /// Compute both reports and serve them over HTTP
    Serve {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(short, long, env = "SERVER_PORT", default_value = "3030")]
        port: u16,
        #[command(flatten)]
        geocoder: GeocoderArgs,
    },
}

#[derive(Args)]
struct Inputs {
    /// Ping batch file (.json, .csv, optionally .gz)
    #[arg(long)]
    pings: PathBuf,
    /// Schedule catalog CSV
    #[arg(long)]
    schedule: PathBuf,
    /// Stop catalog (.json or .csv)
    #[arg(long)]
    stops: PathBuf,
}

#[derive(Args)]
struct GeocoderArgs {
    #[arg(long, env = "GEOCODER_URL")]
    geocoder_url: Option<String>,
    #[arg(long, env = "GEOCODER_USER_AGENT")]
    user_agent: Option<String>,
    /// Skip reverse geocoding; only the vehicle count is reported
    #[arg(long)]
    offline: bool,
}

impl GeocoderArgs {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(url) = &self.geocoder_url {
            config.geocoder.base_url = url.clone();
        }
        if let Some(agent) = &self.user_agent {
            config.geocoder.user_agent = agent.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Delays {
            inputs,
            matching,
            min_delay,
            output,
        } => {
            if let Some(matching) = matching {
                config.matching = matching;
            }
            let (engine, batch) = load(config, &inputs)?;
            let mut report = engine.delays_parallel(&batch).await;
            if let Some(min) = min_delay {
                report = report.over_threshold(min);
            }
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    report.write_csv(BufWriter::new(file))?;
                    info!("Wrote {} delay records to {}", report.len(), path.display());
                }
                None => report.write_csv(std::io::stdout().lock())?,
            }
        }
        Command::Overspeed {
            pings,
            top,
            geocoder,
        } => {
            geocoder.apply(&mut config);
            config.validate()?;
            let batch = PingBatch::load(&pings)?;
            let engine = Engine::new(config, Arc::new(ScheduleIndex::default()));
            let report = overspeed_report(&engine, &batch, geocoder.offline).await?;

            println!("Overspeeding vehicles: {}", report.overspeeding_vehicles);
            for tally in report.top(top) {
                println!("{}: {} vehicles", tally.street, tally.count());
            }
        }
        Command::Serve {
            inputs,
            port,
            geocoder,
        } => {
            geocoder.apply(&mut config);
            let (engine, batch) = load(config, &inputs)?;
            let delays = engine.delays_parallel(&batch).await;
            let overspeed = overspeed_report(&engine, &batch, geocoder.offline).await?;

            let state = Arc::new(AppState {
                schedule: engine.shared_schedule(),
                delays,
                overspeed,
            });
            server::serve(state, port).await?;
        }
    }

    Ok(())
}

fn load(config: EngineConfig, inputs: &Inputs) -> Result<(Engine, PingBatch)> {
    config.validate()?;
    let schedule = ScheduleIndex::load(&inputs.schedule, &inputs.stops)?;
    let batch = PingBatch::load(&inputs.pings)?;
    Ok((Engine::new(config, Arc::new(schedule)), batch))
}

async fn overspeed_report(
    engine: &Engine,
    batch: &PingBatch,
    offline: bool,
) -> Result<OverspeedReport> {
    if offline {
        return Ok(engine.overspeed(batch, &OfflineGeocoder).await);
    }
    let settings = &engine.config().geocoder;
    let geocoder = CachedGeocoder::new(NominatimGeocoder::new(settings)?, settings.cache_decimals);
    let report = engine.overspeed(batch, &geocoder).await;
    info!("Geocoder lookups: {}", geocoder.misses());
    Ok(report)
}
