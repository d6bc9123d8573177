use std::{fs::write, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::{
    config::StoreArgs,
    geometry::PlanarOps,
    model::Level,
    store::{NocoDb, RetryPolicy, TableCache},
    tasks::CancelToken,
};

mod actors;
mod config;
mod error;
mod extract;
mod geometry;
mod load;
mod matcher;
mod model;
mod report;
mod staging;
mod store;
mod tasks;
mod transform;
mod utils;

#[derive(Debug, Parser)]
#[command(about = "Geographic zone pipeline for the water distribution record store")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Extract(Extract),
    #[command(subcommand)]
    Transform(Transform),
    #[command(subcommand)]
    Load(Load),
    #[command(subcommand)]
    Task(Task),
}

#[derive(Clone, Debug, Subcommand)]
enum Extract {
    /// Raw boundary GeoJSON into staging
    Geojson {
        level: Level,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Water companies of German municipalities
    Wasserportal {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Pause between API requests
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum Transform {
    /// One zone per staged water company
    DistributionZones {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum Load {
    /// Staged areas of one level into the store
    Zones {
        level: Level,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Water company actors from a CSV file
    WaterCompanies { csv: PathBuf },
}

#[derive(Clone, Debug, Subcommand)]
enum Task {
    /// Fill missing zone geometries from their municipalities
    CalculateDistributionZone {
        /// Also write the report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Delete actors without a name
    CleanBlankActors,
    /// Stored geometries as GeoJSON, optionally as PMTiles
    ExportTiles {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Run tippecanoe on the exported files
        #[arg(long)]
        tiles: bool,
    },
}

fn open_store(args: &StoreArgs) -> Result<(NocoDb, RetryPolicy)> {
    let config = args.resolve()?;
    let store = NocoDb::new(&config, TableCache::new(config.schema_ttl));
    Ok((store, config.retry))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Extract(Extract::Geojson { level, data_dir }) => {
            extract::geojson(level, &data_dir)?;
        }
        Command::Extract(Extract::Wasserportal { data_dir, delay_ms }) => {
            extract::wasserportal::run(&data_dir, Duration::from_millis(delay_ms))?;
        }
        Command::Transform(Transform::DistributionZones { data_dir }) => {
            let report = transform::distribution_zones(&data_dir, &PlanarOps)?;
            print!("{}", report.to_markdown()?);
        }
        Command::Load(Load::Zones { level, data_dir }) => {
            let (store, retry) = open_store(&cli.store)?;
            let report = load::zones(&store, level, &data_dir, &retry)?;
            print!("{}", report.to_markdown()?);
        }
        Command::Load(Load::WaterCompanies { csv }) => {
            let (store, retry) = open_store(&cli.store)?;
            let report = actors::load_water_companies(&store, &csv, &retry)?;
            println!(
                "{} read, {} already loaded, {} inserted, {} zones created, {} linked",
                report.read, report.existing, report.inserted, report.zones_created, report.linked
            );
        }
        Command::Task(Task::CalculateDistributionZone { report: report_path }) => {
            let (store, retry) = open_store(&cli.store)?;
            let cancel = CancelToken::new();
            let handle = cancel.clone();
            ctrlc::set_handler(move || {
                warn!("cancelling, in-flight writes will finish");
                handle.cancel();
            })
            .context("installing Ctrl-C handler")?;

            let options = tasks::distribution_zone::Options { retry, cancel };
            let report = tasks::distribution_zone::run(&store, &PlanarOps, &options)?;
            let md = report.to_markdown()?;
            print!("{md}");
            if let Some(path) = report_path {
                write(&path, &md).with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Command::Task(Task::CleanBlankActors) => {
            let (store, retry) = open_store(&cli.store)?;
            let deleted = actors::clean_blank_actors(&store, &retry)?;
            println!("{deleted} blank actors deleted");
        }
        Command::Task(Task::ExportTiles { data_dir, tiles }) => {
            let (store, retry) = open_store(&cli.store)?;
            tasks::export::run(&store, &data_dir, tiles, &retry)?;
        }
    }

    Ok(())
}
