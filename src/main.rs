//! Grove Fulfillment CLI
//!
//! Operates on the SQLite store in the storage directory.
//!
//! ## Usage
//!
//! ```bash
//! # Create config and database
//! grove-fulfillment init --storage-dir /data/grove
//!
//! # Load inventory, requests and quotas from a JSON file
//! grove-fulfillment load inventory.json
//!
//! # Reserve for request 12 from its own plots, or from explicit plots
//! grove-fulfillment reserve 12
//! grove-fulfillment reserve 12 --plot 4:6 --plot 9:4
//!
//! # Run every remaining stage of request 12
//! grove-fulfillment process 12
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use grove_fulfillment::services::events::spawn_logging_listener;
use grove_fulfillment::{
    AssignmentPair, Collaborators, CommandRasterizer, Config, FsObjectStore, HttpSlideService,
    LoggingNotifier, NotificationOptions, PlotDemand, PlotReservation, RecipientQuota,
    ReservationRequest, Services, SqliteTreeStore, TreeStore, TreeUnit, UnitScope,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "grove-fulfillment")]
#[command(about = "Reserve, assign and render tree cards for donation and gift requests")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "GROVE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "GROVE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Database file, overrides the one in the storage directory
    #[arg(long, env = "GROVE_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the storage directory, config file and database
    Init,
    /// Load units, requests, quotas and templates from a JSON file
    Load { file: PathBuf },
    /// Show pledged, reserved and remaining counts
    Stats { request_id: i64 },
    /// Reserve units from plots (the request's own plots when none are given)
    Reserve {
        request_id: i64,
        /// Plot demand as PLOT_ID:COUNT
        #[arg(long = "plot", value_parser = parse_plot_demand)]
        plots: Vec<PlotDemand>,
    },
    /// Reserve exactly the given units
    ReserveExact {
        request_id: i64,
        #[arg(required = true)]
        unit_ids: Vec<i64>,
    },
    /// Release reserved units
    Unreserve {
        request_id: i64,
        unit_ids: Vec<i64>,
        #[arg(long, conflicts_with = "unit_ids")]
        all: bool,
    },
    /// Assign reserved units to recipients (automatically when no pairs are given)
    Assign {
        request_id: i64,
        /// Explicit assignment as QUOTA_ID:UNIT_ID
        #[arg(long = "pair", value_parser = parse_pair)]
        pairs: Vec<AssignmentPair>,
    },
    /// Clear assignments, keeping reservations
    Unassign {
        request_id: i64,
        unit_ids: Vec<i64>,
        #[arg(long, conflicts_with = "unit_ids")]
        all: bool,
    },
    /// Render cards for every assigned unit
    Generate { request_id: i64 },
    /// Mail recipients their cards
    Notify {
        request_id: i64,
        #[arg(long)]
        attach_cards: bool,
        #[arg(long)]
        cc: Vec<String>,
        /// Send to these addresses instead, without marking quotas as notified
        #[arg(long = "test-recipient")]
        test_recipients: Vec<String>,
    },
    /// Run every remaining stage of a request
    Process { request_id: i64 },
}

fn parse_plot_demand(s: &str) -> Result<PlotDemand, String> {
    let (plot, count) = s.split_once(':').ok_or("expected PLOT_ID:COUNT")?;
    Ok(PlotDemand::new(
        plot.parse().map_err(|e| format!("bad plot id: {}", e))?,
        count.parse().map_err(|e| format!("bad count: {}", e))?,
    ))
}

fn parse_pair(s: &str) -> Result<AssignmentPair, String> {
    let (quota, unit) = s.split_once(':').ok_or("expected QUOTA_ID:UNIT_ID")?;
    Ok(AssignmentPair {
        quota_id: quota.parse().map_err(|e| format!("bad quota id: {}", e))?,
        unit_id: unit.parse().map_err(|e| format!("bad unit id: {}", e))?,
    })
}

fn scope(unit_ids: Vec<i64>, all: bool) -> anyhow::Result<UnitScope> {
    match (all, unit_ids.is_empty()) {
        (true, _) => Ok(UnitScope::All),
        (false, false) => Ok(UnitScope::Ids(unit_ids)),
        (false, true) => bail!("pass unit ids or --all"),
    }
}

/// Contents accepted by `load`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Fixture {
    units: Vec<TreeUnit>,
    requests: Vec<ReservationRequest>,
    quotas: Vec<RecipientQuota>,
    /// Plant type to template slot id
    templates: HashMap<String, String>,
}

async fn build_services(config: &Config, store: Arc<dyn TreeStore>) -> anyhow::Result<Services> {
    let collaborators = Collaborators {
        slides: Arc::new(HttpSlideService::new(&config.slides_api_url, config.http_timeout_secs)?),
        objects: Arc::new(FsObjectStore::new(config.images_dir(), &config.public_base_url).await?),
        rasterizer: Arc::new(CommandRasterizer::new(&config.rasterizer_program, config.rasterizer_dpi)),
        notifier: Arc::new(LoggingNotifier),
    };
    Ok(Services::new(store, collaborators, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("grove_fulfillment=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    let database_path = args.database.unwrap_or_else(|| config.database_path());

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let store: Arc<dyn TreeStore> = Arc::new(SqliteTreeStore::open(&database_path)?);
    let services = build_services(&config, store.clone()).await?;
    let listener = spawn_logging_listener(services.events.clone());

    match args.command {
        Command::Init => {
            info!(
                storage_dir = %config.storage_dir.display(),
                database = %database_path.display(),
                "Initialized"
            );
        }
        Command::Load { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let fixture: Fixture = serde_json::from_str(&content)?;

            store.insert_units(&fixture.units).await?;
            for request in &fixture.requests {
                store.insert_request(request).await?;
            }
            for quota in &fixture.quotas {
                store.upsert_quota(quota).await?;
            }
            for (plant_type, slot_id) in &fixture.templates {
                store.set_template_slot(plant_type, slot_id).await?;
            }
            info!(
                units = fixture.units.len(),
                requests = fixture.requests.len(),
                quotas = fixture.quotas.len(),
                templates = fixture.templates.len(),
                "Loaded fixture"
            );
        }
        Command::Stats { request_id } => {
            let stats = services.allocator.reservation_stats(request_id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Reserve { request_id, plots } => {
            let reserved = if plots.is_empty() {
                services.allocator.auto_reserve(request_id).await?
            } else {
                let request = store
                    .get_request(request_id)
                    .await?
                    .with_context(|| format!("request {} not found", request_id))?;
                let reservation = PlotReservation {
                    plots,
                    ..PlotReservation::for_request(&request)
                };
                services.allocator.reserve_in_plots(&reservation).await?
            };
            println!("{}", serde_json::to_string(&reserved)?);
        }
        Command::ReserveExact { request_id, unit_ids } => {
            let reserved = services.allocator.reserve_exact(request_id, &unit_ids).await?;
            println!("reserved {}", reserved);
        }
        Command::Unreserve { request_id, unit_ids, all } => {
            let released = services.allocator.unreserve(request_id, &scope(unit_ids, all)?).await?;
            println!("released {}", released);
        }
        Command::Assign { request_id, pairs } => {
            if pairs.is_empty() {
                for fill in services.assignment.auto_assign(request_id).await? {
                    println!(
                        "quota {}: assigned {}, short {}",
                        fill.quota_id,
                        fill.assigned.len(),
                        fill.shortfall
                    );
                }
            } else {
                let assigned = services.assignment.assign_explicit(request_id, &pairs).await?;
                println!("assigned {}", assigned);
            }
        }
        Command::Unassign { request_id, unit_ids, all } => {
            let cleared = services.assignment.unassign(request_id, &scope(unit_ids, all)?).await?;
            println!("cleared {}", cleared);
        }
        Command::Generate { request_id } => {
            let report = services.pipeline.generate_for_request(request_id).await?;
            println!(
                "batches {}, rendered {}, failed {}, skipped {}",
                report.batches, report.rendered, report.failed, report.skipped
            );
        }
        Command::Notify {
            request_id,
            attach_cards,
            cc,
            test_recipients,
        } => {
            let options = NotificationOptions {
                attach_cards,
                cc,
                test_recipients,
            };
            let report = services
                .notifications
                .send_recipient_notifications(request_id, &options)
                .await?;
            println!(
                "sent {}, failed {}, skipped {}",
                report.sent, report.failed, report.skipped
            );
        }
        Command::Process { request_id } => {
            let status = services.lifecycle.process(request_id).await?;
            println!("{}", status);
        }
    }

    drop(services);
    listener.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plot_demand() {
        assert_eq!(parse_plot_demand("4:6").unwrap(), PlotDemand::new(4, 6));
        assert!(parse_plot_demand("4").is_err());
        assert!(parse_plot_demand("x:1").is_err());
    }

    #[test]
    fn test_scope_requires_ids_or_all() {
        assert_eq!(scope(vec![], true).unwrap(), UnitScope::All);
        assert_eq!(scope(vec![1, 2], false).unwrap(), UnitScope::Ids(vec![1, 2]));
        assert!(scope(vec![], false).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from(["grove-fulfillment", "reserve", "12", "--plot", "4:6", "--plot", "9:4"]).unwrap();
        match args.command {
            Command::Reserve { request_id, plots } => {
                assert_eq!(request_id, 12);
                assert_eq!(plots, vec![PlotDemand::new(4, 6), PlotDemand::new(9, 4)]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
